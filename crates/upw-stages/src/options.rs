// SPDX-License-Identifier: MIT OR Apache-2.0
//! Typed accessors over the open option map of a [`StageSpec`].
//!
//! Stage constructors validate lazily: every accessor returns
//! [`EngineError::StageConfig`] naming the stage type and the offending
//! option, so the API layer can surface a precise 400.

use upw_core::{EngineError, StageSpec};

pub(crate) struct Options<'a> {
    spec: &'a StageSpec,
    stage_type: &'static str,
}

impl<'a> Options<'a> {
    pub(crate) fn new(spec: &'a StageSpec, stage_type: &'static str) -> Self {
        Self { spec, stage_type }
    }

    fn bad(&self, reason: impl Into<String>) -> EngineError {
        EngineError::StageConfig {
            stage_type: self.stage_type.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn raw(&self, key: &str) -> Option<&'a serde_json::Value> {
        self.spec.options.get(key)
    }

    pub(crate) fn string(&self, key: &str) -> Result<Option<String>, EngineError> {
        match self.raw(key) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(serde_json::Value::String(s)) => Ok(Some(s.clone())),
            Some(other) => Err(self.bad(format!("`{key}` must be a string, got {other}"))),
        }
    }

    pub(crate) fn required_string(&self, key: &str) -> Result<String, EngineError> {
        self.string(key)?
            .ok_or_else(|| self.bad(format!("`{key}` is required")))
    }

    pub(crate) fn u64(&self, key: &str) -> Result<Option<u64>, EngineError> {
        match self.raw(key) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(serde_json::Value::Number(n)) => n
                .as_u64()
                .map(Some)
                .ok_or_else(|| self.bad(format!("`{key}` must be a non-negative integer"))),
            Some(other) => Err(self.bad(format!("`{key}` must be a number, got {other}"))),
        }
    }

    pub(crate) fn f64(&self, key: &str) -> Result<Option<f64>, EngineError> {
        match self.raw(key) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(serde_json::Value::Number(n)) => Ok(n.as_f64()),
            // Assertions accept numeric strings so that `$ref` lookups and
            // literals share one code path.
            Some(serde_json::Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .map(Some)
                .map_err(|_| self.bad(format!("`{key}` must be numeric, got `{s}`"))),
            Some(other) => Err(self.bad(format!("`{key}` must be a number, got {other}"))),
        }
    }

    pub(crate) fn bool(&self, key: &str) -> Result<Option<bool>, EngineError> {
        match self.raw(key) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(serde_json::Value::Bool(b)) => Ok(Some(*b)),
            Some(other) => Err(self.bad(format!("`{key}` must be a boolean, got {other}"))),
        }
    }

    pub(crate) fn object(
        &self,
        key: &str,
    ) -> Result<Option<&'a serde_json::Map<String, serde_json::Value>>, EngineError> {
        match self.raw(key) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(serde_json::Value::Object(map)) => Ok(Some(map)),
            Some(other) => Err(self.bad(format!("`{key}` must be an object, got {other}"))),
        }
    }

    /// Effective network timeout in seconds: the stage's `timeout` option,
    /// defaulted and capped.
    pub(crate) fn timeout_secs(&self, default: u64) -> Result<u64, EngineError> {
        let t = self.u64("timeout")?.unwrap_or(default);
        if t == 0 {
            return Err(self.bad("`timeout` must be positive"));
        }
        Ok(t.min(crate::MAX_STAGE_TIMEOUT_SECS))
    }
}
