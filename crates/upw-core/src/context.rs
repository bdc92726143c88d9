// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-run scratch space carried between pipeline stages.
//!
//! A [`CheckContext`] is owned by the executor for the duration of one run
//! and passed by mutable reference to each stage. Network stages seed the
//! response body/headers and the built-in `$` values; extractors add named
//! values; assertions resolve them.

use crate::EngineError;
use std::collections::HashMap;

/// Name under which network stages publish their request wall-clock.
pub const VALUE_ELAPSED_MS: &str = "elapsed_ms";
/// Name under which the last network stage publishes its HTTP status code.
pub const VALUE_STATUS_CODE: &str = "status_code";
/// Name under which the last network stage publishes its final URL.
pub const VALUE_FINAL_URL: &str = "final_url";

/// In-memory scratch space for one pipeline run.
#[derive(Clone, Debug, Default)]
pub struct CheckContext {
    /// Latest response body from a network stage, when any.
    pub response_body: Option<String>,

    // Lowercased header names; lookup is case-insensitive.
    headers: HashMap<String, String>,

    values: HashMap<String, serde_json::Value>,
}

impl CheckContext {
    /// Fresh, empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the response headers with the given `(name, value)` pairs.
    ///
    /// Only network stages call this; names are lowercased on the way in so
    /// later lookups are case-insensitive.
    pub fn set_response_headers<I, K, V>(&mut self, headers: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        self.headers = headers
            .into_iter()
            .map(|(k, v)| (k.as_ref().to_ascii_lowercase(), v.into()))
            .collect();
    }

    /// Case-insensitive response header lookup.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// True when any network stage has populated headers.
    #[must_use]
    pub fn has_headers(&self) -> bool {
        !self.headers.is_empty()
    }

    /// Publish a named value for later stages.
    ///
    /// Existing keys are overwritten (latest network stage wins for the
    /// built-ins); stages never remove keys set by their predecessors.
    pub fn set_value(&mut self, name: impl Into<String>, value: serde_json::Value) {
        self.values.insert(name.into(), value);
    }

    /// Direct value lookup by bare name (no `$` prefix).
    #[must_use]
    pub fn value(&self, name: &str) -> Option<&serde_json::Value> {
        self.values.get(name)
    }

    /// Resolve a stage input that is either a literal or a `$name` reference.
    ///
    /// Strings starting with `$` are looked up in the value map; everything
    /// else is returned as-is.
    ///
    /// # Errors
    ///
    /// [`EngineError::UnresolvedValue`] when a referenced name is absent.
    pub fn resolve(&self, input: &serde_json::Value) -> Result<serde_json::Value, EngineError> {
        if let serde_json::Value::String(s) = input {
            if let Some(name) = s.strip_prefix('$') {
                return self
                    .values
                    .get(name)
                    .cloned()
                    .ok_or_else(|| EngineError::UnresolvedValue { name: name.into() });
            }
        }
        Ok(input.clone())
    }
}

/// Coerce a resolved value to `f64` for numeric assertions.
///
/// Accepts JSON numbers and numeric strings (extractors frequently produce
/// the latter from regex matches and headers).
///
/// # Errors
///
/// [`EngineError::Internal`] when the value is not numeric.
pub fn value_as_f64(value: &serde_json::Value) -> Result<f64, EngineError> {
    match value {
        serde_json::Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| EngineError::Internal("number out of f64 range".into())),
        serde_json::Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| EngineError::Internal(format!("`{s}` is not numeric"))),
        other => Err(EngineError::Internal(format!(
            "expected a number, got {other}"
        ))),
    }
}
