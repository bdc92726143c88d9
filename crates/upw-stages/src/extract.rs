// SPDX-License-Identifier: MIT OR Apache-2.0
//! Extractor stages: pull values out of the latest network response and
//! publish them for later assertions via `store_as`.
//!
//! Extractors report `up` whenever a value is produced, never `degraded`;
//! judging the value is the assertions' job. Without a prior network stage
//! there is nothing to extract and they report `down`.

use crate::options::Options;
use crate::{OptionMeta, Stage, StageMeta, StageReport};
use async_trait::async_trait;
use jaq_interpret::{Ctx, FilterT, ParseCtx, RcIter, Val};
use serde_json::json;
use upw_core::{CheckContext, EngineError, StageSpec};

const PREVIEW_LEN: usize = 80;

/// Render a short preview of an extracted value for the stage message.
fn preview(value: &serde_json::Value) -> String {
    let rendered = match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if rendered.chars().count() > PREVIEW_LEN {
        let cut: String = rendered.chars().take(PREVIEW_LEN).collect();
        format!("{cut}…")
    } else {
        rendered
    }
}

/// Publish `value` under `store_as` (when set) and build the `up` report.
fn produced(
    ctx: &mut CheckContext,
    store_as: Option<&str>,
    value: serde_json::Value,
) -> StageReport {
    if let Some(name) = store_as {
        ctx.set_value(name, value.clone());
    }
    StageReport::up(preview(&value)).detail("value", value)
}

fn body_or_down(ctx: &CheckContext) -> Result<String, StageReport> {
    ctx.response_body
        .clone()
        .ok_or_else(|| StageReport::down("no_response_body"))
}

fn json_body_or_down(ctx: &CheckContext) -> Result<serde_json::Value, StageReport> {
    let body = body_or_down(ctx)?;
    serde_json::from_str(&body)
        .map_err(|e| StageReport::down("body_not_json").detail("error", json!(e.to_string())))
}

// ---------------------------------------------------------------------------
// jq
// ---------------------------------------------------------------------------

/// Stage metadata for `jq`.
pub static JQ_META: StageMeta = StageMeta {
    stage_type: "jq",
    label: "jq extract",
    description: "Apply a jq program to the JSON response body",
    network: false,
    options: &[
        OptionMeta {
            name: "expr",
            label: "Program",
            value_type: "string",
            required: true,
            default: None,
            description: "jq-compatible program producing a single value",
        },
        OptionMeta {
            name: "store_as",
            label: "Store as",
            value_type: "string",
            required: false,
            default: None,
            description: "Context name the value is published under",
        },
    ],
};

/// Registry constructor for `jq`.
pub fn build_jq(spec: &StageSpec) -> Result<Box<dyn Stage>, EngineError> {
    let opts = Options::new(spec, "jq");
    let expr = opts.required_string("expr")?;
    let store_as = opts.string("store_as")?;

    // Parse eagerly so bad programs fail at monitor ingestion, not at run
    // time. Compilation against the definition set happens per check.
    let (main, errs) = jaq_parse::parse(&expr, jaq_parse::main());
    if main.is_none() || !errs.is_empty() {
        let detail = errs
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        return Err(EngineError::StageConfig {
            stage_type: "jq".into(),
            reason: format!("invalid jq program: {detail}"),
        });
    }

    Ok(Box::new(JqStage { expr, store_as }))
}

/// jq program extractor.
pub struct JqStage {
    expr: String,
    store_as: Option<String>,
}

impl JqStage {
    fn run_program(&self, input: serde_json::Value) -> Result<Vec<serde_json::Value>, String> {
        let mut defs = ParseCtx::new(Vec::new());
        defs.insert_natives(jaq_core::core());
        defs.insert_defs(jaq_std::std());

        let (main, errs) = jaq_parse::parse(&self.expr, jaq_parse::main());
        if !errs.is_empty() {
            return Err(errs
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; "));
        }
        let main = main.ok_or_else(|| "empty program".to_string())?;
        let filter = defs.compile(main);
        if !defs.errs.is_empty() {
            return Err("program references undefined filters".into());
        }

        let inputs = RcIter::new(core::iter::empty());
        let mut out = Vec::new();
        for item in filter.run((Ctx::new([], &inputs), Val::from(input))) {
            match item {
                Ok(val) => out.push(serde_json::Value::from(val)),
                Err(e) => return Err(e.to_string()),
            }
            if out.len() > 1 {
                break;
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl Stage for JqStage {
    fn meta(&self) -> &'static StageMeta {
        &JQ_META
    }

    async fn check(
        &self,
        _url: &str,
        _verbose: bool,
        ctx: &mut CheckContext,
    ) -> Result<StageReport, EngineError> {
        let input = match json_body_or_down(ctx) {
            Ok(input) => input,
            Err(report) => return Ok(report),
        };

        let values = match self.run_program(input) {
            Ok(values) => values,
            Err(e) => return Ok(StageReport::down("eval_error").detail("error", json!(e))),
        };

        match values.len() {
            0 => Ok(StageReport::down("no_output").detail("expr", json!(self.expr))),
            1 => Ok(produced(
                ctx,
                self.store_as.as_deref(),
                values.into_iter().next().unwrap_or(serde_json::Value::Null),
            )),
            _ => Ok(StageReport::down("multiple_outputs").detail("expr", json!(self.expr))),
        }
    }
}

// ---------------------------------------------------------------------------
// jsonpath
// ---------------------------------------------------------------------------

/// Stage metadata for `jsonpath`.
pub static JSONPATH_META: StageMeta = StageMeta {
    stage_type: "jsonpath",
    label: "JSONPath extract",
    description: "Evaluate a JSONPath expression against the JSON response body",
    network: false,
    options: &[
        OptionMeta {
            name: "expr",
            label: "Expression",
            value_type: "string",
            required: true,
            default: None,
            description: "JSONPath expression; one match yields the value, many an array",
        },
        OptionMeta {
            name: "store_as",
            label: "Store as",
            value_type: "string",
            required: false,
            default: None,
            description: "Context name the value is published under",
        },
    ],
};

/// Registry constructor for `jsonpath`.
pub fn build_jsonpath(spec: &StageSpec) -> Result<Box<dyn Stage>, EngineError> {
    let opts = Options::new(spec, "jsonpath");
    let expr = opts.required_string("expr")?;
    let store_as = opts.string("store_as")?;
    let path = serde_json_path::JsonPath::parse(&expr).map_err(|e| EngineError::StageConfig {
        stage_type: "jsonpath".into(),
        reason: format!("invalid JSONPath `{expr}`: {e}"),
    })?;
    Ok(Box::new(JsonPathStage { path, store_as }))
}

/// JSONPath extractor.
pub struct JsonPathStage {
    path: serde_json_path::JsonPath,
    store_as: Option<String>,
}

#[async_trait]
impl Stage for JsonPathStage {
    fn meta(&self) -> &'static StageMeta {
        &JSONPATH_META
    }

    async fn check(
        &self,
        _url: &str,
        _verbose: bool,
        ctx: &mut CheckContext,
    ) -> Result<StageReport, EngineError> {
        let input = match json_body_or_down(ctx) {
            Ok(input) => input,
            Err(report) => return Ok(report),
        };

        let matches: Vec<serde_json::Value> =
            self.path.query(&input).all().into_iter().cloned().collect();
        let value = match matches.len() {
            0 => return Ok(StageReport::down("no_match")),
            1 => matches.into_iter().next().unwrap_or(serde_json::Value::Null),
            _ => serde_json::Value::Array(matches),
        };
        Ok(produced(ctx, self.store_as.as_deref(), value))
    }
}

// ---------------------------------------------------------------------------
// regex
// ---------------------------------------------------------------------------

/// Stage metadata for `regex`.
pub static REGEX_META: StageMeta = StageMeta {
    stage_type: "regex",
    label: "Regex extract",
    description: "Match a pattern against the textual response body",
    network: false,
    options: &[
        OptionMeta {
            name: "pattern",
            label: "Pattern",
            value_type: "string",
            required: true,
            default: None,
            description: "Regular expression; group 1 is taken when present, else the whole match",
        },
        OptionMeta {
            name: "store_as",
            label: "Store as",
            value_type: "string",
            required: false,
            default: None,
            description: "Context name the value is published under",
        },
    ],
};

/// Registry constructor for `regex`.
pub fn build_regex(spec: &StageSpec) -> Result<Box<dyn Stage>, EngineError> {
    let opts = Options::new(spec, "regex");
    let pattern = opts.required_string("pattern")?;
    let store_as = opts.string("store_as")?;
    let regex = regex::Regex::new(&pattern).map_err(|e| EngineError::StageConfig {
        stage_type: "regex".into(),
        reason: format!("invalid pattern: {e}"),
    })?;
    Ok(Box::new(RegexStage { regex, store_as }))
}

/// Regular-expression extractor.
pub struct RegexStage {
    regex: regex::Regex,
    store_as: Option<String>,
}

#[async_trait]
impl Stage for RegexStage {
    fn meta(&self) -> &'static StageMeta {
        &REGEX_META
    }

    async fn check(
        &self,
        _url: &str,
        _verbose: bool,
        ctx: &mut CheckContext,
    ) -> Result<StageReport, EngineError> {
        let body = match body_or_down(ctx) {
            Ok(body) => body,
            Err(report) => return Ok(report),
        };

        let Some(captures) = self.regex.captures(&body) else {
            return Ok(StageReport::down("no_match").detail("pattern", json!(self.regex.as_str())));
        };
        // Group 1 when the pattern declares groups, else the whole match.
        let text = if self.regex.captures_len() > 1 {
            captures.get(1).map(|m| m.as_str()).unwrap_or_default()
        } else {
            captures.get(0).map(|m| m.as_str()).unwrap_or_default()
        };
        Ok(produced(ctx, self.store_as.as_deref(), json!(text)))
    }
}

// ---------------------------------------------------------------------------
// header
// ---------------------------------------------------------------------------

/// Stage metadata for `header`.
pub static HEADER_META: StageMeta = StageMeta {
    stage_type: "header",
    label: "Header extract",
    description: "Read a response header (case-insensitive)",
    network: false,
    options: &[
        OptionMeta {
            name: "pattern",
            label: "Header name",
            value_type: "string",
            required: true,
            default: None,
            description: "Response header to read",
        },
        OptionMeta {
            name: "store_as",
            label: "Store as",
            value_type: "string",
            required: false,
            default: None,
            description: "Context name the value is published under",
        },
    ],
};

/// Registry constructor for `header`.
pub fn build_header(spec: &StageSpec) -> Result<Box<dyn Stage>, EngineError> {
    let opts = Options::new(spec, "header");
    let name = opts.required_string("pattern")?;
    let store_as = opts.string("store_as")?;
    Ok(Box::new(HeaderStage { name, store_as }))
}

/// Response-header extractor.
pub struct HeaderStage {
    name: String,
    store_as: Option<String>,
}

#[async_trait]
impl Stage for HeaderStage {
    fn meta(&self) -> &'static StageMeta {
        &HEADER_META
    }

    async fn check(
        &self,
        _url: &str,
        _verbose: bool,
        ctx: &mut CheckContext,
    ) -> Result<StageReport, EngineError> {
        let Some(value) = ctx.header(&self.name).map(str::to_string) else {
            return Ok(StageReport::down("header_missing").detail("header", json!(self.name)));
        };
        Ok(produced(ctx, self.store_as.as_deref(), json!(value)))
    }
}
