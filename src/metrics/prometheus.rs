//! Prometheus instant-query client.
//!
//! Uses `ureq` for synchronous HTTP requests against `/api/v1/query`.
//! One agent is shared by every query of a request.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::MetricsError;

use super::{LabelSet, MetricsApi, MetricsResult, Sample, Vector, parse_sample_value};

/// Maximum error body kept in a [`MetricsError::Status`].
const MAX_ERROR_BODY: usize = 500;

/// Connection settings for a Prometheus server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrometheusConfig {
    /// Base URL, e.g. `http://prometheus.istio-system:9090`.
    #[serde(default = "default_url")]
    pub url: String,
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Optional bearer token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

fn default_url() -> String {
    "http://prometheus.istio-system:9090".into()
}
fn default_timeout_secs() -> u64 {
    30
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            timeout_secs: default_timeout_secs(),
            token: None,
        }
    }
}

/// HTTP client for the Prometheus query API.
pub struct PrometheusClient {
    base_url: String,
    token: Option<String>,
    http: ureq::Agent,
}

impl PrometheusClient {
    /// Build a client. Fails when the URL is not http(s).
    pub fn new(config: &PrometheusConfig) -> MetricsResult<Self> {
        let url = config.url.trim();
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(MetricsError::InvalidUrl {
                url: config.url.clone(),
            });
        }

        let http = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build();

        tracing::debug!(url, timeout_secs = config.timeout_secs, "created prometheus client");

        Ok(Self {
            base_url: url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl MetricsApi for PrometheusClient {
    fn query(&self, expression: &str, time: SystemTime) -> MetricsResult<Vector> {
        let url = format!("{}/api/v1/query", self.base_url);
        let mut request = self
            .http
            .get(&url)
            .query("query", expression)
            .query("time", &format_time(time));
        if let Some(ref token) = self.token {
            request = request.set("Authorization", &format!("Bearer {token}"));
        }

        tracing::trace!(query = expression, "prometheus instant query");

        match request.call() {
            Ok(response) => {
                let body = response.into_string().map_err(|e| MetricsError::Response {
                    message: format!("failed to read body: {e}"),
                })?;
                parse_vector(&body)
            }
            Err(ureq::Error::Status(status, response)) => {
                let body = response.into_string().unwrap_or_default();
                Err(status_error(status, body))
            }
            Err(ureq::Error::Transport(transport)) => Err(MetricsError::Request {
                message: transport.to_string(),
            }),
        }
    }
}

impl std::fmt::Debug for PrometheusClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusClient")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Unix seconds with millisecond precision, as the query API expects.
fn format_time(time: SystemTime) -> String {
    let secs = time
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64();
    format!("{secs:.3}")
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiResponse {
    status: String,
    #[serde(default)]
    data: Option<ApiData>,
    #[serde(default)]
    error_type: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiData {
    result_type: String,
    #[serde(default)]
    result: Vec<ApiSample>,
}

#[derive(Deserialize)]
struct ApiSample {
    #[serde(default)]
    metric: LabelSet,
    value: (f64, String),
}

/// Decode a `/api/v1/query` response body into a vector.
pub(crate) fn parse_vector(body: &str) -> MetricsResult<Vector> {
    let response: ApiResponse = serde_json::from_str(body).map_err(|e| MetricsError::Response {
        message: e.to_string(),
    })?;

    if response.status != "success" {
        return Err(MetricsError::Query {
            error_type: response.error_type.unwrap_or_else(|| "unknown".into()),
            message: response.error.unwrap_or_default(),
        });
    }

    let data = response.data.ok_or_else(|| MetricsError::Response {
        message: "missing data".into(),
    })?;
    if data.result_type != "vector" {
        return Err(MetricsError::Response {
            message: format!("expected vector result, got {}", data.result_type),
        });
    }

    data.result
        .into_iter()
        .map(|s| {
            let value = parse_sample_value(&s.value.1)
                .map_err(|message| MetricsError::Response { message })?;
            Ok(Sample::new(s.metric, value))
        })
        .collect()
}

fn status_error(status: u16, body: String) -> MetricsError {
    if let Ok(parsed) = serde_json::from_str::<ApiResponse>(&body) {
        if parsed.status == "error" {
            return MetricsError::Query {
                error_type: parsed.error_type.unwrap_or_else(|| "unknown".into()),
                message: parsed.error.unwrap_or_default(),
            };
        }
    }
    let body = if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &body[..cut])
    } else {
        body
    };
    MetricsError::Status { status, body }
}
