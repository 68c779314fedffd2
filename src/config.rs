//! Configuration file for graph enrichment.
//!
//! Settings are read from TOML. Every field has a default, so an empty file
//! (or no file at all) yields a working configuration:
//!
//! ```toml
//! [prometheus]
//! url = "http://prometheus.istio-system:9090"
//! timeout_secs = 30
//!
//! [graph]
//! graph_type = "versionedApp"
//! inject_service_nodes = true
//! quantile = 99.0
//! duration_secs = 600
//! appenders = ["responseTime"]
//! infrastructure_namespaces = ["istio-system"]
//! ```

use std::path::Path;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::appender::{
    ALL_APPENDERS, AppenderOptions, DEFAULT_QUANTILE, InfrastructureNamespaces, NamespaceInfoMap,
    validate_namespace,
};
use crate::error::ConfigError;
use crate::graph::GraphType;
use crate::metrics::PrometheusConfig;

/// Result type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeshConfig {
    #[serde(default)]
    pub prometheus: PrometheusConfig,
    #[serde(default)]
    pub graph: GraphConfig,
}

/// How graphs are resolved and enriched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphConfig {
    #[serde(default)]
    pub graph_type: GraphType,
    /// Add a service node between a caller and the workload serving it.
    #[serde(default)]
    pub inject_service_nodes: bool,
    /// Response-time percentile in (0, 100).
    #[serde(default = "default_quantile")]
    pub quantile: f64,
    /// Lookback window for rate queries, in seconds.
    #[serde(default = "default_duration_secs")]
    pub duration_secs: u64,
    /// Appenders to run, in order. Empty means all.
    #[serde(default)]
    pub appenders: Vec<String>,
    #[serde(default = "default_infrastructure_namespaces")]
    pub infrastructure_namespaces: Vec<String>,
}

fn default_quantile() -> f64 {
    DEFAULT_QUANTILE
}
fn default_duration_secs() -> u64 {
    600
}
fn default_infrastructure_namespaces() -> Vec<String> {
    vec!["istio-system".into()]
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            graph_type: GraphType::default(),
            inject_service_nodes: false,
            quantile: default_quantile(),
            duration_secs: default_duration_secs(),
            appenders: Vec::new(),
            infrastructure_namespaces: default_infrastructure_namespaces(),
        }
    }
}

impl MeshConfig {
    /// Load and validate a TOML file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::parse(&content, &path.display().to_string())
    }

    /// Parse and validate TOML text.
    pub fn from_toml(content: &str) -> ConfigResult<Self> {
        Self::parse(content, "<inline>")
    }

    fn parse(content: &str, path: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: path.to_string(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no request could run with.
    ///
    /// The quantile is not checked here: an out-of-range value falls back to
    /// the default when the appender runs.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.prometheus.timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                message: "prometheus.timeout_secs must be at least 1".into(),
            });
        }
        if self.graph.duration_secs == 0 {
            return Err(ConfigError::Invalid {
                message: "graph.duration_secs must be at least 1".into(),
            });
        }
        for ns in &self.graph.infrastructure_namespaces {
            validate_namespace(ns)?;
        }
        Ok(())
    }

    pub fn lookback(&self) -> Duration {
        Duration::from_secs(self.graph.duration_secs)
    }

    pub fn infrastructure(&self) -> InfrastructureNamespaces {
        InfrastructureNamespaces::new(self.graph.infrastructure_namespaces.iter().cloned())
    }

    /// Appender names to run; all of them when none are configured.
    pub fn appender_names(&self) -> Vec<String> {
        if self.graph.appenders.is_empty() {
            vec![ALL_APPENDERS.to_string()]
        } else {
            self.graph.appenders.clone()
        }
    }

    /// Namespace infos for `namespaces`, sharing this config's lookback.
    pub fn namespace_infos<S: AsRef<str>>(
        &self,
        namespaces: &[S],
    ) -> ConfigResult<NamespaceInfoMap> {
        NamespaceInfoMap::build(
            namespaces.iter().map(|s| s.as_ref().to_string()),
            self.lookback(),
            &self.infrastructure(),
        )
    }

    /// Appender options for one request over `namespaces`.
    pub fn appender_options<S: AsRef<str>>(
        &self,
        namespaces: &[S],
        query_time: SystemTime,
    ) -> ConfigResult<AppenderOptions> {
        Ok(AppenderOptions {
            graph_type: self.graph.graph_type,
            inject_service_nodes: self.graph.inject_service_nodes,
            namespaces: self.namespace_infos(namespaces)?,
            quantile: self.graph.quantile,
            query_time,
        })
    }
}
