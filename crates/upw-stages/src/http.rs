// SPDX-License-Identifier: MIT OR Apache-2.0
//! HTTP probe stage.
//!
//! Performs a GET against the monitor URL, following redirects manually so
//! the hop chain stays observable, then seeds the run context with the
//! response body, headers, and the built-in `$` values.

use crate::options::Options;
use crate::{OptionMeta, Stage, StageMeta, StageReport};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, LOCATION, USER_AGENT};
use reqwest::redirect::Policy;
use reqwest::Url;
use serde_json::json;
use std::time::{Duration, Instant};
use upw_core::{context, CheckContext, EngineError, StageSpec};

const DEFAULT_TIMEOUT_SECS: u64 = 10;
const MAX_REDIRECTS: usize = 10;
const DEFAULT_USER_AGENT: &str = concat!("upwatch/", env!("CARGO_PKG_VERSION"));

/// Stage metadata for `http`.
pub static META: StageMeta = StageMeta {
    stage_type: "http",
    label: "HTTP",
    description: "GET the monitor URL and judge the final response status",
    network: true,
    options: &[
        OptionMeta {
            name: "timeout",
            label: "Timeout",
            value_type: "number",
            required: false,
            default: Some("10"),
            description: "Request timeout in seconds (capped at 60)",
        },
        OptionMeta {
            name: "headers",
            label: "Headers",
            value_type: "object",
            required: false,
            default: None,
            description: "Extra request headers merged over the default User-Agent",
        },
    ],
};

/// Registry constructor for `http`.
pub fn build(spec: &StageSpec) -> Result<Box<dyn Stage>, EngineError> {
    let opts = Options::new(spec, "http");
    let timeout_secs = opts.timeout_secs(DEFAULT_TIMEOUT_SECS)?;

    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));
    if let Some(map) = opts.object("headers")? {
        for (name, value) in map {
            let value = value.as_str().ok_or_else(|| EngineError::StageConfig {
                stage_type: "http".into(),
                reason: format!("header `{name}` must be a string"),
            })?;
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                EngineError::StageConfig {
                    stage_type: "http".into(),
                    reason: format!("invalid header name `{name}`"),
                }
            })?;
            let value =
                HeaderValue::from_str(value).map_err(|_| EngineError::StageConfig {
                    stage_type: "http".into(),
                    reason: format!("invalid value for header `{name}`"),
                })?;
            headers.insert(name, value);
        }
    }

    let client = reqwest::Client::builder()
        .redirect(Policy::none())
        .timeout(Duration::from_secs(timeout_secs))
        .default_headers(headers)
        .build()
        .map_err(|e| EngineError::Internal(format!("http client init failed: {e}")))?;

    Ok(Box::new(HttpStage {
        client,
        timeout_secs,
    }))
}

/// GET probe with manual redirect following.
pub struct HttpStage {
    client: reqwest::Client,
    timeout_secs: u64,
}

#[async_trait]
impl Stage for HttpStage {
    fn meta(&self) -> &'static StageMeta {
        &META
    }

    fn hard_timeout(&self) -> Duration {
        // The client timeout applies per hop; the hard bound covers the
        // whole redirect chain.
        Duration::from_secs((self.timeout_secs * 2).min(crate::MAX_STAGE_TIMEOUT_SECS))
    }

    async fn check(
        &self,
        url: &str,
        verbose: bool,
        ctx: &mut CheckContext,
    ) -> Result<StageReport, EngineError> {
        let start = Instant::now();
        let mut current = Url::parse(url)
            .map_err(|e| EngineError::Internal(format!("invalid url `{url}`: {e}")))?;
        let mut redirects = Vec::new();

        let response = loop {
            let resp = match self.client.get(current.clone()).send().await {
                Ok(resp) => resp,
                Err(e) => {
                    let message = if e.is_timeout() { "timeout" } else { "transport_error" };
                    return Ok(StageReport::down(message)
                        .detail("error", json!(e.to_string()))
                        .detail("url", json!(current.as_str())));
                }
            };

            if !resp.status().is_redirection() {
                break resp;
            }
            let Some(location) = resp
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|loc| current.join(loc).ok())
            else {
                // A 3xx without a usable Location is the final answer.
                break resp;
            };
            redirects.push(json!({
                "status": resp.status().as_u16(),
                "location": location.as_str(),
            }));
            if redirects.len() > MAX_REDIRECTS {
                return Ok(StageReport::down("too_many_redirects")
                    .detail("redirects", json!(redirects)));
            }
            current = location;
        };

        let status_code = response.status().as_u16();
        let http_version = format!("{:?}", response.version());
        let final_url = response.url().to_string();
        let header_pairs: Vec<(String, String)> = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    v.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                return Ok(StageReport::down("transport_error")
                    .detail("error", json!(format!("body read failed: {e}"))));
            }
        };
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        ctx.response_body = Some(body);
        ctx.set_response_headers(header_pairs.iter().map(|(k, v)| (k.as_str(), v.clone())));
        ctx.set_value(context::VALUE_ELAPSED_MS, json!(elapsed_ms));
        ctx.set_value(context::VALUE_STATUS_CODE, json!(status_code));
        ctx.set_value(context::VALUE_FINAL_URL, json!(final_url.clone()));
        ctx.set_value("http_version", json!(http_version.clone()));
        ctx.set_value("redirects", json!(redirects.len()));
        if let Some(server) = ctx.header("server").map(str::to_string) {
            ctx.set_value("server", json!(server));
        }
        if let Some(ct) = ctx.header("content-type").map(str::to_string) {
            ctx.set_value("content_type", json!(ct));
        }

        let mut report = if status_code < 400 {
            StageReport::up(status_code.to_string())
        } else {
            StageReport::degraded(status_code.to_string())
        };
        report = report
            .detail("status_code", json!(status_code))
            .detail("final_url", json!(final_url))
            .detail("elapsed_ms", json!(elapsed_ms));
        if !redirects.is_empty() {
            report = report.detail("redirects", json!(redirects));
        }
        if verbose {
            report = report
                .detail("http_version", json!(http_version))
                .detail("headers", json!(header_pairs
                    .iter()
                    .map(|(k, v)| json!({ "name": k, "value": v }))
                    .collect::<Vec<_>>()));
        }
        Ok(report)
    }
}
