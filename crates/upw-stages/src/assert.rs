// SPDX-License-Identifier: MIT OR Apache-2.0
//! Assertion stages: judge extracted values and response content.
//!
//! Every assertion input accepts either a literal or a `$name` reference
//! resolved against the run context; unresolved references propagate as
//! errors and the executor converts them to stage-level `down`s.

use crate::options::Options;
use crate::{OptionMeta, Stage, StageMeta, StageReport};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::json;
use upw_core::context::value_as_f64;
use upw_core::{CheckContext, EngineError, StageSpec};

// ---------------------------------------------------------------------------
// threshold
// ---------------------------------------------------------------------------

/// Stage metadata for `threshold`.
pub static THRESHOLD_META: StageMeta = StageMeta {
    stage_type: "threshold",
    label: "Numeric threshold",
    description: "Assert a numeric value lies within min/max bounds",
    network: false,
    options: &[
        OptionMeta {
            name: "value",
            label: "Value",
            value_type: "string",
            required: true,
            default: None,
            description: "Literal number or $reference to assert on",
        },
        OptionMeta {
            name: "min",
            label: "Minimum",
            value_type: "number",
            required: false,
            default: None,
            description: "Inclusive lower bound",
        },
        OptionMeta {
            name: "max",
            label: "Maximum",
            value_type: "number",
            required: false,
            default: None,
            description: "Inclusive upper bound",
        },
    ],
};

/// Registry constructor for `threshold`.
pub fn build_threshold(spec: &StageSpec) -> Result<Box<dyn Stage>, EngineError> {
    let opts = Options::new(spec, "threshold");
    let value = opts
        .raw("value")
        .cloned()
        .ok_or_else(|| EngineError::StageConfig {
            stage_type: "threshold".into(),
            reason: "`value` is required".into(),
        })?;
    let min = opts.f64("min")?;
    let max = opts.f64("max")?;
    if min.is_none() && max.is_none() {
        return Err(EngineError::StageConfig {
            stage_type: "threshold".into(),
            reason: "at least one of `min`/`max` is required".into(),
        });
    }
    Ok(Box::new(ThresholdStage { value, min, max }))
}

/// Numeric bounds assertion.
pub struct ThresholdStage {
    value: serde_json::Value,
    min: Option<f64>,
    max: Option<f64>,
}

#[async_trait]
impl Stage for ThresholdStage {
    fn meta(&self) -> &'static StageMeta {
        &THRESHOLD_META
    }

    async fn check(
        &self,
        _url: &str,
        _verbose: bool,
        ctx: &mut CheckContext,
    ) -> Result<StageReport, EngineError> {
        let resolved = ctx.resolve(&self.value)?;
        let v = match value_as_f64(&resolved) {
            Ok(v) => v,
            Err(_) => {
                return Ok(StageReport::down("not_numeric").detail("value", resolved));
            }
        };

        let in_range = self.min.is_none_or(|min| v >= min) && self.max.is_none_or(|max| v <= max);
        let report = if in_range {
            StageReport::up(format!("{v} within bounds"))
        } else {
            StageReport::down("out_of_range")
        };
        Ok(report
            .detail("value", json!(v))
            .detail("min", json!(self.min))
            .detail("max", json!(self.max)))
    }
}

// ---------------------------------------------------------------------------
// contains
// ---------------------------------------------------------------------------

/// Stage metadata for `contains`.
pub static CONTAINS_META: StageMeta = StageMeta {
    stage_type: "contains",
    label: "Body contains",
    description: "Assert the response body contains (or does not contain) a substring",
    network: false,
    options: &[
        OptionMeta {
            name: "pattern",
            label: "Pattern",
            value_type: "string",
            required: true,
            default: None,
            description: "Substring to look for",
        },
        OptionMeta {
            name: "negate",
            label: "Negate",
            value_type: "boolean",
            required: false,
            default: Some("false"),
            description: "Pass when the substring is absent instead",
        },
    ],
};

/// Registry constructor for `contains`.
pub fn build_contains(spec: &StageSpec) -> Result<Box<dyn Stage>, EngineError> {
    let opts = Options::new(spec, "contains");
    let pattern = opts.required_string("pattern")?;
    let negate = opts.bool("negate")?.unwrap_or(false);
    Ok(Box::new(ContainsStage { pattern, negate }))
}

/// Substring assertion on the response body.
pub struct ContainsStage {
    pattern: String,
    negate: bool,
}

#[async_trait]
impl Stage for ContainsStage {
    fn meta(&self) -> &'static StageMeta {
        &CONTAINS_META
    }

    async fn check(
        &self,
        _url: &str,
        _verbose: bool,
        ctx: &mut CheckContext,
    ) -> Result<StageReport, EngineError> {
        let Some(body) = ctx.response_body.as_deref() else {
            return Ok(StageReport::down("no_response_body"));
        };
        let found = body.contains(&self.pattern);
        let report = match (found, self.negate) {
            (true, false) => StageReport::up("pattern found"),
            (false, true) => StageReport::up("pattern absent"),
            (false, false) => StageReport::down("not_found"),
            (true, true) => StageReport::down("unexpectedly_found"),
        };
        Ok(report
            .detail("pattern", json!(self.pattern))
            .detail("negate", json!(self.negate))
            .detail("found", json!(found)))
    }
}

// ---------------------------------------------------------------------------
// age
// ---------------------------------------------------------------------------

/// Stage metadata for `age`.
pub static AGE_META: StageMeta = StageMeta {
    stage_type: "age",
    label: "Timestamp age",
    description: "Assert an ISO-8601 timestamp is recent enough",
    network: false,
    options: &[
        OptionMeta {
            name: "value",
            label: "Timestamp",
            value_type: "string",
            required: true,
            default: None,
            description: "Literal timestamp or $reference",
        },
        OptionMeta {
            name: "max_age",
            label: "Max age",
            value_type: "number",
            required: true,
            default: None,
            description: "Maximum acceptable age in seconds (degraded up to twice this)",
        },
    ],
};

/// Registry constructor for `age`.
pub fn build_age(spec: &StageSpec) -> Result<Box<dyn Stage>, EngineError> {
    let opts = Options::new(spec, "age");
    let value = opts
        .raw("value")
        .cloned()
        .ok_or_else(|| EngineError::StageConfig {
            stage_type: "age".into(),
            reason: "`value` is required".into(),
        })?;
    let max_age = opts.u64("max_age")?.ok_or_else(|| EngineError::StageConfig {
        stage_type: "age".into(),
        reason: "`max_age` is required".into(),
    })?;
    Ok(Box::new(AgeStage { value, max_age }))
}

/// Freshness assertion over an extracted timestamp.
pub struct AgeStage {
    value: serde_json::Value,
    max_age: u64,
}

impl AgeStage {
    fn judge(&self, ts: DateTime<Utc>, now: DateTime<Utc>) -> StageReport {
        let delta = now.signed_duration_since(ts);
        // Equal instants are not "in the past"; a zero whole-second age with
        // a strictly positive delta still passes `max_age = 0`.
        if delta <= TimeDelta::zero() {
            return self.report_with(ts, StageReport::down("timestamp_in_future"), delta);
        }
        let age = delta.num_seconds();
        let max = self.max_age as i64;
        let report = if age <= max {
            StageReport::up(format!("{age}s old"))
        } else if age <= 2 * max {
            StageReport::degraded(format!("{age}s old exceeds {max}s"))
        } else {
            StageReport::down("too_old")
        };
        self.report_with(ts, report, delta)
    }

    fn report_with(&self, ts: DateTime<Utc>, report: StageReport, delta: TimeDelta) -> StageReport {
        report
            .detail("timestamp", json!(ts.to_rfc3339()))
            .detail("age_seconds", json!(delta.num_seconds()))
            .detail("max_age", json!(self.max_age))
    }
}

#[async_trait]
impl Stage for AgeStage {
    fn meta(&self) -> &'static StageMeta {
        &AGE_META
    }

    async fn check(
        &self,
        _url: &str,
        _verbose: bool,
        ctx: &mut CheckContext,
    ) -> Result<StageReport, EngineError> {
        let resolved = ctx.resolve(&self.value)?;
        let Some(raw) = resolved.as_str() else {
            return Ok(StageReport::down("not_a_timestamp").detail("value", resolved));
        };
        let Ok(ts) = DateTime::parse_from_rfc3339(raw) else {
            return Ok(StageReport::down("not_a_timestamp").detail("value", json!(raw)));
        };
        Ok(self.judge(ts.with_timezone(&Utc), Utc::now()))
    }
}

// ---------------------------------------------------------------------------
// json-schema
// ---------------------------------------------------------------------------

/// Stage metadata for `json-schema`.
pub static JSON_SCHEMA_META: StageMeta = StageMeta {
    stage_type: "json-schema",
    label: "JSON Schema",
    description: "Validate the JSON response body against a schema",
    network: false,
    options: &[OptionMeta {
        name: "schema",
        label: "Schema",
        value_type: "object",
        required: true,
        default: None,
        description: "JSON Schema the body must satisfy",
    }],
};

/// Registry constructor for `json-schema`.
pub fn build_json_schema(spec: &StageSpec) -> Result<Box<dyn Stage>, EngineError> {
    let opts = Options::new(spec, "json-schema");
    let schema = opts
        .object("schema")?
        .ok_or_else(|| EngineError::StageConfig {
            stage_type: "json-schema".into(),
            reason: "`schema` is required".into(),
        })?;
    let schema = serde_json::Value::Object(schema.clone());
    let validator =
        jsonschema::validator_for(&schema).map_err(|e| EngineError::StageConfig {
            stage_type: "json-schema".into(),
            reason: format!("invalid schema: {e}"),
        })?;
    Ok(Box::new(JsonSchemaStage { validator }))
}

/// Schema-conformance assertion on the JSON body.
pub struct JsonSchemaStage {
    validator: jsonschema::Validator,
}

#[async_trait]
impl Stage for JsonSchemaStage {
    fn meta(&self) -> &'static StageMeta {
        &JSON_SCHEMA_META
    }

    async fn check(
        &self,
        _url: &str,
        _verbose: bool,
        ctx: &mut CheckContext,
    ) -> Result<StageReport, EngineError> {
        let Some(body) = ctx.response_body.as_deref() else {
            return Ok(StageReport::down("no_response_body"));
        };
        let instance: serde_json::Value = match serde_json::from_str(body) {
            Ok(v) => v,
            Err(e) => {
                return Ok(
                    StageReport::down("body_not_json").detail("error", json!(e.to_string()))
                );
            }
        };

        let report = match self.validator.iter_errors(&instance).next() {
            None => Ok(StageReport::up("schema satisfied").detail("valid", json!(true))),
            Some(err) => {
                let path = err.instance_path.to_string();
                let at = if path.is_empty() { "root".to_string() } else { path };
                Ok(StageReport::down(format!("violation at {at}"))
                    .detail("valid", json!(false))
                    .detail("error", json!(err.to_string())))
            }
        };
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use upw_core::CheckStatus;

    #[tokio::test]
    async fn threshold_passes_inside_bounds() {
        let stage = build_threshold(
            &StageSpec::new("threshold")
                .option("value", json!("$c"))
                .option("min", json!(10))
                .option("max", json!(100)),
        )
        .unwrap();
        let mut ctx = CheckContext::new();
        ctx.set_value("c", json!(42));
        let report = stage.check("https://x/", false, &mut ctx).await.unwrap();
        assert_eq!(report.status, CheckStatus::Up);
    }

    #[tokio::test]
    async fn threshold_out_of_range_is_down() {
        let stage = build_threshold(
            &StageSpec::new("threshold")
                .option("value", json!("$c"))
                .option("min", json!(100)),
        )
        .unwrap();
        let mut ctx = CheckContext::new();
        ctx.set_value("c", json!(42));
        let report = stage.check("https://x/", false, &mut ctx).await.unwrap();
        assert_eq!(report.status, CheckStatus::Down);
        assert_eq!(report.message, "out_of_range");
    }

    #[tokio::test]
    async fn threshold_unresolved_reference_propagates() {
        let stage = build_threshold(
            &StageSpec::new("threshold")
                .option("value", json!("$missing"))
                .option("min", json!(1)),
        )
        .unwrap();
        let mut ctx = CheckContext::new();
        let err = stage.check("https://x/", false, &mut ctx).await.unwrap_err();
        assert_eq!(err.to_string(), "unresolved $missing");
    }

    #[tokio::test]
    async fn threshold_accepts_literal_values_and_single_bound() {
        let stage = build_threshold(
            &StageSpec::new("threshold")
                .option("value", json!(250))
                .option("max", json!(500)),
        )
        .unwrap();
        let mut ctx = CheckContext::new();
        let report = stage.check("https://x/", false, &mut ctx).await.unwrap();
        assert_eq!(report.status, CheckStatus::Up);
    }

    #[test]
    fn threshold_requires_a_bound() {
        let spec = StageSpec::new("threshold").option("value", json!("$c"));
        assert!(matches!(
            build_threshold(&spec),
            Err(EngineError::StageConfig { .. })
        ));
    }

    #[tokio::test]
    async fn threshold_non_numeric_value_is_down() {
        let stage = build_threshold(
            &StageSpec::new("threshold")
                .option("value", json!("$c"))
                .option("min", json!(0)),
        )
        .unwrap();
        let mut ctx = CheckContext::new();
        ctx.set_value("c", json!({"not": "numeric"}));
        let report = stage.check("https://x/", false, &mut ctx).await.unwrap();
        assert_eq!(report.status, CheckStatus::Down);
        assert_eq!(report.message, "not_numeric");
    }

    #[tokio::test]
    async fn contains_respects_negation() {
        let mut ctx = CheckContext::new();
        ctx.response_body = Some("service OK".into());

        let plain =
            build_contains(&StageSpec::new("contains").option("pattern", json!("OK"))).unwrap();
        let report = plain.check("https://x/", false, &mut ctx).await.unwrap();
        assert_eq!(report.status, CheckStatus::Up);

        let negated = build_contains(
            &StageSpec::new("contains")
                .option("pattern", json!("OK"))
                .option("negate", json!(true)),
        )
        .unwrap();
        let report = negated.check("https://x/", false, &mut ctx).await.unwrap();
        assert_eq!(report.status, CheckStatus::Down);
        assert_eq!(report.message, "unexpectedly_found");
    }

    fn age_stage(max_age: u64) -> AgeStage {
        AgeStage {
            value: json!("$ts"),
            max_age,
        }
    }

    #[test]
    fn age_fresh_timestamp_is_up() {
        let now = Utc::now();
        let report = age_stage(300).judge(now - TimeDelta::seconds(60), now);
        assert_eq!(report.status, CheckStatus::Up);
    }

    #[test]
    fn age_within_twice_the_limit_is_degraded() {
        let now = Utc::now();
        let report = age_stage(300).judge(now - TimeDelta::seconds(450), now);
        assert_eq!(report.status, CheckStatus::Degraded);
    }

    #[test]
    fn age_beyond_twice_the_limit_is_down() {
        let now = Utc::now();
        let report = age_stage(300).judge(now - TimeDelta::seconds(601), now);
        assert_eq!(report.status, CheckStatus::Down);
        assert_eq!(report.message, "too_old");
    }

    #[test]
    fn age_zero_max_age_accepts_strictly_past_zero_delta() {
        let now = Utc::now();
        let report = age_stage(0).judge(now - TimeDelta::milliseconds(500), now);
        assert_eq!(report.status, CheckStatus::Up);

        let report = age_stage(0).judge(now, now);
        assert_eq!(report.status, CheckStatus::Down);
    }

    #[test]
    fn age_future_timestamp_is_down() {
        let now = Utc::now();
        let report = age_stage(300).judge(now + TimeDelta::seconds(60), now);
        assert_eq!(report.status, CheckStatus::Down);
        assert_eq!(report.message, "timestamp_in_future");
    }

    #[tokio::test]
    async fn age_rejects_unparseable_timestamps() {
        let stage = build_age(
            &StageSpec::new("age")
                .option("value", json!("$ts"))
                .option("max_age", json!(60)),
        )
        .unwrap();
        let mut ctx = CheckContext::new();
        ctx.set_value("ts", json!("not-a-timestamp"));
        let report = stage.check("https://x/", false, &mut ctx).await.unwrap();
        assert_eq!(report.status, CheckStatus::Down);
        assert_eq!(report.message, "not_a_timestamp");
    }

    #[tokio::test]
    async fn json_schema_reports_first_violation_path() {
        let stage = build_json_schema(&StageSpec::new("json-schema").option(
            "schema",
            json!({
                "type": "object",
                "properties": { "count": { "type": "number" } },
                "required": ["count"]
            }),
        ))
        .unwrap();

        let mut ctx = CheckContext::new();
        ctx.response_body = Some(r#"{"count": 42}"#.into());
        let report = stage.check("https://x/", false, &mut ctx).await.unwrap();
        assert_eq!(report.status, CheckStatus::Up);

        ctx.response_body = Some(r#"{"count": "many"}"#.into());
        let report = stage.check("https://x/", false, &mut ctx).await.unwrap();
        assert_eq!(report.status, CheckStatus::Down);
        assert!(report.message.contains("/count"), "got {}", report.message);
    }

    #[test]
    fn json_schema_requires_schema_object() {
        assert!(matches!(
            build_json_schema(&StageSpec::new("json-schema")),
            Err(EngineError::StageConfig { .. })
        ));
    }
}
