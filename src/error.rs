//! Rich diagnostic error types for mesh-graph.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! providing error codes, help text, and source chains so callers can tell a
//! fatal request-level failure from a per-namespace one.

use std::sync::Arc;

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for mesh-graph.
///
/// Each variant wraps a subsystem-specific error, preserving the full diagnostic
/// chain through to the user.
#[derive(Debug, Error, Diagnostic)]
pub enum MeshError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Metrics(#[from] MetricsError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Appender(#[from] AppenderError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),
}

// ---------------------------------------------------------------------------
// Graph errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum GraphError {
    #[error("node not found: {id}")]
    #[diagnostic(
        code(mesh::graph::node_not_found),
        help(
            "The edge references a node id that is not in the traffic map. \
             Add the node before adding edges that touch it."
        )
    )]
    NodeNotFound { id: String },

    #[error("invalid graph snapshot: {message}")]
    #[diagnostic(
        code(mesh::graph::snapshot),
        help(
            "The snapshot JSON could not be turned into a traffic map. \
             Check that it has `nodes` and `edges` arrays and that every edge \
             endpoint names a listed node."
        )
    )]
    Snapshot { message: String },

    #[error("unknown graph type: {value}")]
    #[diagnostic(
        code(mesh::graph::graph_type),
        help("Valid graph types are: app, versionedApp, workload, service.")
    )]
    UnknownGraphType { value: String },
}

// ---------------------------------------------------------------------------
// Metrics errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum MetricsError {
    #[error("invalid metrics store URL: \"{url}\"")]
    #[diagnostic(
        code(mesh::metrics::invalid_url),
        help("The Prometheus URL must start with http:// or https://.")
    )]
    InvalidUrl { url: String },

    #[error("metrics request failed: {message}")]
    #[diagnostic(
        code(mesh::metrics::request),
        help(
            "The metrics store could not be reached. Check the configured URL, \
             network access, and that Prometheus is running."
        )
    )]
    Request { message: String },

    #[error("metrics store returned HTTP {status}: {body}")]
    #[diagnostic(
        code(mesh::metrics::status),
        help("The query was rejected by the metrics store. The body usually names the cause.")
    )]
    Status { status: u16, body: String },

    #[error("query failed ({error_type}): {message}")]
    #[diagnostic(
        code(mesh::metrics::query),
        help("The expression was accepted over HTTP but failed to evaluate.")
    )]
    Query { error_type: String, message: String },

    #[error("unexpected metrics response: {message}")]
    #[diagnostic(
        code(mesh::metrics::response),
        help("The response did not match the Prometheus instant-query format.")
    )]
    Response { message: String },

    #[error("failed to load recorded metrics from {path}: {message}")]
    #[diagnostic(
        code(mesh::metrics::replay),
        help("The replay file must be a JSON object mapping query expressions to sample arrays.")
    )]
    Replay { path: String, message: String },
}

// ---------------------------------------------------------------------------
// Appender errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum AppenderError {
    #[error("metrics client could not be constructed")]
    #[diagnostic(
        code(mesh::appender::client_init),
        help(
            "No appender can run without a metrics client, so the whole request \
             is aborted. Fix the metrics configuration and retry."
        )
    )]
    ClientInit {
        #[source]
        source: Arc<MetricsError>,
    },

    #[error("appender {appender} failed for namespace \"{namespace}\"")]
    #[diagnostic(
        code(mesh::appender::query),
        help(
            "A metrics query failed while enriching this namespace. Other \
             namespaces are unaffected and metadata written by earlier \
             appenders is left as it was."
        )
    )]
    Query {
        appender: &'static str,
        namespace: String,
        #[source]
        source: MetricsError,
    },

    #[error("unknown appender: \"{name}\"")]
    #[diagnostic(
        code(mesh::appender::unknown),
        help("Known appenders: responseTime. Use `_all_` to run every appender.")
    )]
    UnknownAppender { name: String },
}

impl AppenderError {
    /// Whether the error aborts the whole request rather than one namespace.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AppenderError::ClientInit { .. })
    }
}

// ---------------------------------------------------------------------------
// Config errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read config: {path}")]
    #[diagnostic(
        code(mesh::config::read),
        help("Ensure the config file exists and is readable.")
    )]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {path}")]
    #[diagnostic(
        code(mesh::config::parse),
        help("Check the TOML syntax in the config file. {message}")
    )]
    Parse { path: String, message: String },

    #[error("invalid configuration: {message}")]
    #[diagnostic(code(mesh::config::invalid), help("Check the config fields. {message}"))]
    Invalid { message: String },

    #[error("invalid namespace name: \"{name}\"")]
    #[diagnostic(
        code(mesh::config::namespace),
        help(
            "Namespace names must be DNS-1123 labels: lowercase alphanumerics \
             and '-', starting and ending with an alphanumeric, at most 63 characters."
        )
    )]
    InvalidNamespace { name: String },
}

/// Convenience alias for functions returning mesh-graph results.
pub type MeshResult<T> = std::result::Result<T, MeshError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_error_converts_to_mesh_error() {
        let err = MetricsError::InvalidUrl {
            url: "ftp://x".into(),
        };
        let mesh: MeshError = err.into();
        assert!(matches!(
            mesh,
            MeshError::Metrics(MetricsError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn only_client_init_is_fatal() {
        let fatal = AppenderError::ClientInit {
            source: Arc::new(MetricsError::InvalidUrl { url: "x".into() }),
        };
        let local = AppenderError::Query {
            appender: "responseTime",
            namespace: "bookinfo".into(),
            source: MetricsError::Request {
                message: "timeout".into(),
            },
        };
        assert!(fatal.is_fatal());
        assert!(!local.is_fatal());
    }

    #[test]
    fn error_display_messages_are_descriptive() {
        let err = AppenderError::Query {
            appender: "responseTime",
            namespace: "bookinfo".into(),
            source: MetricsError::Status {
                status: 400,
                body: "bad".into(),
            },
        };
        let msg = format!("{err}");
        assert!(msg.contains("responseTime"));
        assert!(msg.contains("bookinfo"));
    }
}
