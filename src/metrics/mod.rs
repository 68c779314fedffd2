//! Metrics store access.
//!
//! The core only issues instant queries. [`MetricsApi`] is the seam:
//! [`PrometheusClient`] talks to a live Prometheus over HTTP, and
//! [`ReplayMetrics`] answers from recorded results.

pub mod prometheus;
pub mod replay;

use std::collections::BTreeMap;
use std::time::SystemTime;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::MetricsError;

pub use prometheus::{PrometheusClient, PrometheusConfig};
pub use replay::ReplayMetrics;

/// Result type for metrics operations.
pub type MetricsResult<T> = std::result::Result<T, MetricsError>;

/// Label name → label value.
pub type LabelSet = BTreeMap<String, String>;

/// One element of an instant-query result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub metric: LabelSet,
    /// `NaN` when the store had nothing to compute from (serialized as `null`).
    #[serde(deserialize_with = "deserialize_value")]
    pub value: f64,
}

impl Sample {
    pub fn new(metric: LabelSet, value: f64) -> Self {
        Self { metric, value }
    }

    /// Build a sample from `(name, value)` label pairs.
    pub fn from_labels<'a>(
        labels: impl IntoIterator<Item = (&'a str, &'a str)>,
        value: f64,
    ) -> Self {
        Self {
            metric: labels
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            value,
        }
    }

    pub fn label(&self, name: &str) -> Option<&str> {
        self.metric.get(name).map(|s| s.as_str())
    }
}

/// An instant-query result.
pub type Vector = Vec<Sample>;

/// Instant-query access to a time-series store.
///
/// Implementations own retry and backoff policy; callers issue each query once.
pub trait MetricsApi: Send + Sync {
    /// Evaluate `expression` at `time`.
    fn query(&self, expression: &str, time: SystemTime) -> MetricsResult<Vector>;
}

/// Parse a sample value as the store renders it (`"0.25"`, `"NaN"`, `"+Inf"`).
pub fn parse_sample_value(raw: &str) -> Result<f64, String> {
    raw.trim()
        .parse::<f64>()
        .map_err(|e| format!("invalid sample value \"{raw}\": {e}"))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrText {
    Number(f64),
    Text(String),
}

fn deserialize_value<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<NumberOrText>::deserialize(deserializer)? {
        None => Ok(f64::NAN),
        Some(NumberOrText::Number(v)) => Ok(v),
        Some(NumberOrText::Text(s)) => parse_sample_value(&s).map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn special_values_parse() {
        assert!(parse_sample_value("NaN").unwrap().is_nan());
        assert_eq!(parse_sample_value("+Inf").unwrap(), f64::INFINITY);
        assert_eq!(parse_sample_value("0.25").unwrap(), 0.25);
        assert!(parse_sample_value("fast").is_err());
    }

    #[test]
    fn sample_value_accepts_number_text_and_null() {
        let s: Sample = serde_json::from_str(r#"{"metric": {"a": "b"}, "value": 0.5}"#).unwrap();
        assert_eq!(s.value, 0.5);
        assert_eq!(s.label("a"), Some("b"));

        let s: Sample = serde_json::from_str(r#"{"metric": {}, "value": "NaN"}"#).unwrap();
        assert!(s.value.is_nan());

        let s: Sample = serde_json::from_str(r#"{"metric": {}, "value": null}"#).unwrap();
        assert!(s.value.is_nan());
    }
}
