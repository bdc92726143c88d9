// SPDX-License-Identifier: MIT OR Apache-2.0
//! TCP connect and DNS resolution probe stages.

use crate::options::Options;
use crate::{OptionMeta, Stage, StageMeta, StageReport};
use async_trait::async_trait;
use serde_json::json;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use upw_core::{context, CheckContext, EngineError, StageSpec};

const TCP_CONNECT_TIMEOUT_SECS: u64 = 5;

// ---------------------------------------------------------------------------
// tcp
// ---------------------------------------------------------------------------

/// Stage metadata for `tcp`.
pub static TCP_META: StageMeta = StageMeta {
    stage_type: "tcp",
    label: "TCP connect",
    description: "Open a TCP connection to the monitor host on a given port",
    network: true,
    options: &[OptionMeta {
        name: "port",
        label: "Port",
        value_type: "number",
        required: true,
        default: None,
        description: "Port to connect to",
    }],
};

/// Registry constructor for `tcp`.
pub fn build_tcp(spec: &StageSpec) -> Result<Box<dyn Stage>, EngineError> {
    let opts = Options::new(spec, "tcp");
    let port = opts.u64("port")?.ok_or_else(|| EngineError::StageConfig {
        stage_type: "tcp".into(),
        reason: "`port` is required".into(),
    })?;
    let port = u16::try_from(port).map_err(|_| EngineError::StageConfig {
        stage_type: "tcp".into(),
        reason: format!("`port` must be 1-65535, got {port}"),
    })?;
    if port == 0 {
        return Err(EngineError::StageConfig {
            stage_type: "tcp".into(),
            reason: "`port` must be 1-65535, got 0".into(),
        });
    }
    Ok(Box::new(TcpStage { port }))
}

/// Plain TCP reachability probe.
pub struct TcpStage {
    port: u16,
}

#[async_trait]
impl Stage for TcpStage {
    fn meta(&self) -> &'static StageMeta {
        &TCP_META
    }

    async fn check(
        &self,
        url: &str,
        _verbose: bool,
        ctx: &mut CheckContext,
    ) -> Result<StageReport, EngineError> {
        let start = Instant::now();
        let host = host_of(url)?;

        let report = match timeout(
            Duration::from_secs(TCP_CONNECT_TIMEOUT_SECS),
            TcpStream::connect((host.as_str(), self.port)),
        )
        .await
        {
            Ok(Ok(_stream)) => StageReport::up(format!("connected to {host}:{}", self.port)),
            Ok(Err(e)) => StageReport::down("connect_failed").detail("error", json!(e.to_string())),
            Err(_) => StageReport::down("connect_failed").detail("error", json!("connect timeout")),
        };

        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        ctx.set_value(context::VALUE_ELAPSED_MS, json!(elapsed_ms));

        Ok(report
            .detail("host", json!(host))
            .detail("port", json!(self.port)))
    }
}

// ---------------------------------------------------------------------------
// dns
// ---------------------------------------------------------------------------

/// Stage metadata for `dns`.
pub static DNS_META: StageMeta = StageMeta {
    stage_type: "dns",
    label: "DNS resolution",
    description: "Resolve the monitor host and optionally match an expected address",
    network: true,
    options: &[OptionMeta {
        name: "expected_ip",
        label: "Expected IP",
        value_type: "string",
        required: false,
        default: None,
        description: "Degrade unless at least one resolved address equals this IP",
    }],
};

/// Registry constructor for `dns`.
pub fn build_dns(spec: &StageSpec) -> Result<Box<dyn Stage>, EngineError> {
    let opts = Options::new(spec, "dns");
    let expected_ip = opts
        .string("expected_ip")?
        .map(|raw| {
            raw.parse::<IpAddr>().map_err(|_| EngineError::StageConfig {
                stage_type: "dns".into(),
                reason: format!("`expected_ip` is not a valid IP address: `{raw}`"),
            })
        })
        .transpose()?;
    Ok(Box::new(DnsStage { expected_ip }))
}

/// Host resolution probe.
pub struct DnsStage {
    expected_ip: Option<IpAddr>,
}

#[async_trait]
impl Stage for DnsStage {
    fn meta(&self) -> &'static StageMeta {
        &DNS_META
    }

    async fn check(
        &self,
        url: &str,
        _verbose: bool,
        ctx: &mut CheckContext,
    ) -> Result<StageReport, EngineError> {
        let start = Instant::now();
        let host = host_of(url)?;

        // Port 0 keeps lookup_host purely about name resolution.
        let resolved: Vec<IpAddr> = match lookup_host((host.as_str(), 0u16)).await {
            Ok(addrs) => {
                let mut ips: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
                ips.sort_unstable();
                ips.dedup();
                ips
            }
            Err(e) => {
                let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
                ctx.set_value(context::VALUE_ELAPSED_MS, json!(elapsed_ms));
                return Ok(StageReport::down("resolution_failed")
                    .detail("host", json!(host))
                    .detail("error", json!(e.to_string())));
            }
        };

        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        ctx.set_value(context::VALUE_ELAPSED_MS, json!(elapsed_ms));

        let addresses: Vec<String> = resolved.iter().map(ToString::to_string).collect();
        let report = if resolved.is_empty() {
            StageReport::down("resolution_failed").detail("error", json!("no addresses returned"))
        } else {
            match self.expected_ip {
                Some(expected) if !resolved.contains(&expected) => {
                    StageReport::degraded(format!("{expected} not in resolved set"))
                        .detail("expected_ip", json!(expected.to_string()))
                }
                _ => StageReport::up(format!(
                    "resolved {} address{}",
                    addresses.len(),
                    if addresses.len() == 1 { "" } else { "es" }
                )),
            }
        };

        Ok(report
            .detail("host", json!(host))
            .detail("addresses", json!(addresses)))
    }
}

fn host_of(url: &str) -> Result<String, EngineError> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| EngineError::Internal(format!("invalid url `{url}`: {e}")))?;
    parsed
        .host_str()
        .map(str::to_string)
        .ok_or_else(|| EngineError::Internal(format!("url `{url}` has no host")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use upw_core::CheckStatus;

    #[test]
    fn tcp_requires_a_valid_port() {
        assert!(build_tcp(&StageSpec::new("tcp")).is_err());
        assert!(build_tcp(&StageSpec::new("tcp").option("port", json!(0))).is_err());
        assert!(build_tcp(&StageSpec::new("tcp").option("port", json!(70_000))).is_err());
        assert!(build_tcp(&StageSpec::new("tcp").option("port", json!(443))).is_ok());
    }

    #[tokio::test]
    async fn tcp_connects_to_a_listening_socket() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let stage = build_tcp(&StageSpec::new("tcp").option("port", json!(port))).unwrap();
        let mut ctx = CheckContext::new();
        let report = stage
            .check("http://127.0.0.1/", false, &mut ctx)
            .await
            .unwrap();
        assert_eq!(report.status, CheckStatus::Up);
        assert_eq!(report.details["port"], json!(port));
        assert!(ctx.value("elapsed_ms").is_some());
    }

    #[tokio::test]
    async fn tcp_reports_down_when_refused() {
        let stage = build_tcp(&StageSpec::new("tcp").option("port", json!(1))).unwrap();
        let mut ctx = CheckContext::new();
        let report = stage
            .check("http://127.0.0.1/", false, &mut ctx)
            .await
            .unwrap();
        assert_eq!(report.status, CheckStatus::Down);
        assert_eq!(report.message, "connect_failed");
    }

    #[test]
    fn dns_rejects_malformed_expected_ip() {
        let spec = StageSpec::new("dns").option("expected_ip", json!("not-an-ip"));
        assert!(matches!(
            build_dns(&spec),
            Err(EngineError::StageConfig { .. })
        ));
    }

    #[tokio::test]
    async fn dns_resolves_localhost() {
        let stage = build_dns(&StageSpec::new("dns")).unwrap();
        let mut ctx = CheckContext::new();
        let report = stage
            .check("http://localhost/", false, &mut ctx)
            .await
            .unwrap();
        assert_eq!(report.status, CheckStatus::Up);
        assert!(!report.details["addresses"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn dns_degrades_on_unexpected_address() {
        let spec = StageSpec::new("dns").option("expected_ip", json!("203.0.113.9"));
        let stage = build_dns(&spec).unwrap();
        let mut ctx = CheckContext::new();
        let report = stage
            .check("http://localhost/", false, &mut ctx)
            .await
            .unwrap();
        assert_eq!(report.status, CheckStatus::Degraded);
    }

    #[tokio::test]
    async fn dns_matching_expected_address_is_up() {
        let spec = StageSpec::new("dns").option("expected_ip", json!("127.0.0.1"));
        let stage = build_dns(&spec).unwrap();
        let mut ctx = CheckContext::new();
        let report = stage
            .check("http://127.0.0.1/", false, &mut ctx)
            .await
            .unwrap();
        assert_eq!(report.status, CheckStatus::Up);
    }
}
