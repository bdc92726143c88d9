// SPDX-License-Identifier: MIT OR Apache-2.0
//! TLS certificate probe stage (`ssl`).
//!
//! Connects to the monitor's host and inspects the peer certificate. A
//! strict handshake runs first; when it fails for certificate reasons the
//! stage retries permissively so an expired or otherwise rejected
//! certificate can still be reported with its real validity window.

use crate::options::Options;
use crate::{OptionMeta, Stage, StageMeta, StageReport};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::timeout;
use upw_core::{context, CheckContext, EngineError, StageSpec};
use x509_parser::prelude::parse_x509_certificate;

const DEFAULT_WARN_DAYS: i64 = 30;
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Stage metadata for `ssl`.
pub static META: StageMeta = StageMeta {
    stage_type: "ssl",
    label: "SSL certificate",
    description: "Check the target's TLS certificate validity and expiry",
    network: true,
    options: &[
        OptionMeta {
            name: "warn_days",
            label: "Warn days",
            value_type: "number",
            required: false,
            default: Some("30"),
            description: "Report degraded when the certificate expires within this many days",
        },
        OptionMeta {
            name: "timeout",
            label: "Timeout",
            value_type: "number",
            required: false,
            default: Some("10"),
            description: "Connect timeout in seconds (capped at 60)",
        },
    ],
};

/// Registry constructor for `ssl`.
pub fn build(spec: &StageSpec) -> Result<Box<dyn Stage>, EngineError> {
    let opts = Options::new(spec, "ssl");
    let warn_days = opts.u64("warn_days")?.map_or(DEFAULT_WARN_DAYS, |d| d as i64);
    let timeout_secs = opts.timeout_secs(DEFAULT_TIMEOUT_SECS)?;
    Ok(Box::new(SslStage {
        warn_days,
        timeout_secs,
    }))
}

/// Certificate expiry probe.
pub struct SslStage {
    warn_days: i64,
    timeout_secs: u64,
}

/// Fields pulled out of the peer certificate.
struct CertFacts {
    subject: String,
    issuer: String,
    not_before: i64,
    not_after: i64,
}

impl SslStage {
    async fn handshake(
        &self,
        host: &str,
        port: u16,
        accept_invalid: bool,
    ) -> Result<CertFacts, StageReport> {
        let tcp = match timeout(
            Duration::from_secs(self.timeout_secs),
            TcpStream::connect((host, port)),
        )
        .await
        {
            Ok(Ok(tcp)) => tcp,
            Ok(Err(e)) => {
                return Err(StageReport::down("unreachable")
                    .detail("error", json!(e.to_string())));
            }
            Err(_) => return Err(StageReport::down("unreachable").detail("error", json!("connect timeout"))),
        };

        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(accept_invalid)
            .danger_accept_invalid_hostnames(accept_invalid)
            .build()
            .map_err(|e| StageReport::down("handshake_failed").detail("error", json!(e.to_string())))?;
        let connector = tokio_native_tls::TlsConnector::from(connector);

        let tls = match timeout(
            Duration::from_secs(self.timeout_secs),
            connector.connect(host, tcp),
        )
        .await
        {
            Ok(Ok(tls)) => tls,
            Ok(Err(e)) => {
                return Err(StageReport::down("invalid_certificate")
                    .detail("error", json!(e.to_string())));
            }
            Err(_) => {
                return Err(StageReport::down("handshake_failed")
                    .detail("error", json!("handshake timeout")));
            }
        };

        let der = tls
            .get_ref()
            .peer_certificate()
            .ok()
            .flatten()
            .and_then(|cert| cert.to_der().ok())
            .ok_or_else(|| {
                StageReport::down("invalid_certificate")
                    .detail("error", json!("no peer certificate presented"))
            })?;

        let (_, cert) = parse_x509_certificate(&der).map_err(|e| {
            StageReport::down("invalid_certificate")
                .detail("error", json!(format!("certificate parse failed: {e}")))
        })?;

        Ok(CertFacts {
            subject: cert.subject().to_string(),
            issuer: cert.issuer().to_string(),
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
        })
    }

    fn verdict(&self, facts: &CertFacts, strict_ok: bool, now: i64) -> StageReport {
        let days_remaining = (facts.not_after - now) / 86_400;
        let not_after = DateTime::<Utc>::from_timestamp(facts.not_after, 0)
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();

        let report = if now > facts.not_after {
            StageReport::down("expired")
        } else if now < facts.not_before {
            StageReport::down("not_yet_valid")
        } else if !strict_ok {
            StageReport::down("invalid_certificate")
        } else if days_remaining <= self.warn_days {
            StageReport::degraded(format!("expires in {days_remaining} days"))
        } else {
            StageReport::up(format!("valid for {days_remaining} days"))
        };

        report
            .detail("subject", json!(facts.subject))
            .detail("issuer", json!(facts.issuer))
            .detail("not_after", json!(not_after))
            .detail("days_remaining", json!(days_remaining))
    }
}

#[async_trait]
impl Stage for SslStage {
    fn meta(&self) -> &'static StageMeta {
        &META
    }

    fn hard_timeout(&self) -> Duration {
        Duration::from_secs((self.timeout_secs * 2).min(crate::MAX_STAGE_TIMEOUT_SECS))
    }

    async fn check(
        &self,
        url: &str,
        _verbose: bool,
        ctx: &mut CheckContext,
    ) -> Result<StageReport, EngineError> {
        let start = Instant::now();
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| EngineError::Internal(format!("invalid url `{url}`: {e}")))?;
        let Some(host) = parsed.host_str().map(str::to_string) else {
            return Ok(StageReport::down("unreachable").detail("error", json!("url has no host")));
        };
        let port = parsed.port().unwrap_or(443);
        let now = Utc::now().timestamp();

        let report = match self.handshake(&host, port, false).await {
            Ok(facts) => self.verdict(&facts, true, now),
            Err(strict_failure) => {
                if strict_failure.message == "invalid_certificate" {
                    // Retry permissively so a rejected certificate can still
                    // be described (expired vs otherwise invalid).
                    match self.handshake(&host, port, true).await {
                        Ok(facts) => self.verdict(&facts, false, now),
                        Err(_) => strict_failure,
                    }
                } else {
                    strict_failure
                }
            }
        };

        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        ctx.set_value(context::VALUE_ELAPSED_MS, json!(elapsed_ms));

        Ok(report)
    }
}
