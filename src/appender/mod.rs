//! Appenders: enrichment stages that annotate a traffic map with telemetry.
//!
//! Each appender implements the [`Appender`] trait and is run by a
//! [`Pipeline`](crate::pipeline::Pipeline) once per target namespace.
//! Appenders share one [`AppenderGlobalInfo`] per request and receive an
//! immutable [`NamespaceInfo`] for the namespace being processed.

pub mod response_time;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, LazyLock, OnceLock};
use std::time::{Duration, SystemTime};

use regex::Regex;

use crate::error::{AppenderError, ConfigError, MetricsError};
use crate::graph::{GraphType, TrafficMap};
use crate::metrics::{MetricsApi, MetricsResult, PrometheusClient, PrometheusConfig};

pub use response_time::{DEFAULT_QUANTILE, RESPONSE_TIME_APPENDER_NAME, ResponseTimeAppender};

/// Result type for appender operations.
pub type AppenderResult<T> = std::result::Result<T, AppenderError>;

/// Appender list entry that selects every known appender.
pub const ALL_APPENDERS: &str = "_all_";

/// An enrichment stage.
///
/// `append_graph` may only change node and edge metadata; it never adds or
/// removes nodes or edges.
pub trait Appender: Send + Sync {
    /// Unique name of the appender.
    fn name(&self) -> &'static str;

    /// Enrich `traffic_map` for the namespace described by `namespace_info`.
    fn append_graph(
        &self,
        traffic_map: &mut TrafficMap,
        global_info: &AppenderGlobalInfo,
        namespace_info: &NamespaceInfo,
    ) -> AppenderResult<()>;
}

type ClientFactory = Box<dyn Fn() -> MetricsResult<Arc<dyn MetricsApi>> + Send + Sync>;

/// Request-scoped state shared by every appender and namespace.
///
/// The metrics client is built on first use, at most once. Concurrent callers
/// block on the first construction and then share its outcome; a failed
/// construction is remembered and reported to every later caller.
pub struct AppenderGlobalInfo {
    client: OnceLock<Result<Arc<dyn MetricsApi>, Arc<MetricsError>>>,
    factory: Option<ClientFactory>,
}

impl AppenderGlobalInfo {
    /// Build the client lazily with `factory`.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> MetricsResult<Arc<dyn MetricsApi>> + Send + Sync + 'static,
    {
        Self {
            client: OnceLock::new(),
            factory: Some(Box::new(factory)),
        }
    }

    /// Use an already constructed client.
    pub fn with_client(client: Arc<dyn MetricsApi>) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(Ok(client));
        Self {
            client: cell,
            factory: None,
        }
    }

    /// Lazily connect to Prometheus with `config`.
    pub fn prometheus(config: PrometheusConfig) -> Self {
        Self::new(move || {
            let client: Arc<dyn MetricsApi> = Arc::new(PrometheusClient::new(&config)?);
            Ok(client)
        })
    }

    /// The shared metrics client, constructing it on first use.
    pub fn metrics_client(&self) -> AppenderResult<Arc<dyn MetricsApi>> {
        let slot = self.client.get_or_init(|| {
            tracing::debug!("constructing metrics client");
            match self.factory {
                Some(ref factory) => factory().map_err(Arc::new),
                None => Err(Arc::new(MetricsError::Request {
                    message: "no metrics client configured".into(),
                })),
            }
        });
        match slot {
            Ok(client) => Ok(Arc::clone(client)),
            Err(source) => Err(AppenderError::ClientInit {
                source: Arc::clone(source),
            }),
        }
    }

    /// Whether construction has been attempted.
    pub fn is_initialized(&self) -> bool {
        self.client.get().is_some()
    }
}

impl std::fmt::Debug for AppenderGlobalInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppenderGlobalInfo")
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

/// Namespaces that host control-plane components.
///
/// Their components report telemetry only on the callee side, which changes how
/// traffic touching them has to be queried.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InfrastructureNamespaces(BTreeSet<String>);

impl InfrastructureNamespaces {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(names.into_iter().map(Into::into).collect())
    }

    pub fn contains(&self, namespace: &str) -> bool {
        self.0.contains(namespace)
    }

    /// Sorted names.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Per-namespace parameters, immutable while the namespace is processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceInfo {
    pub namespace: String,
    /// Lookback window for rate queries.
    pub duration: Duration,
    /// Configured infrastructure namespaces.
    pub infrastructure: InfrastructureNamespaces,
}

impl NamespaceInfo {
    /// Validate `namespace` and build its info.
    pub fn new(
        namespace: impl Into<String>,
        duration: Duration,
        infrastructure: InfrastructureNamespaces,
    ) -> Result<Self, ConfigError> {
        let namespace = namespace.into();
        validate_namespace(&namespace)?;
        if duration.as_secs() == 0 {
            return Err(ConfigError::Invalid {
                message: format!("lookback for namespace \"{namespace}\" must be at least 1s"),
            });
        }
        Ok(Self {
            namespace,
            duration,
            infrastructure,
        })
    }

    pub fn is_infrastructure(&self) -> bool {
        self.infrastructure.contains(&self.namespace)
    }
}

/// The namespaces requested for one graph, by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespaceInfoMap(BTreeMap<String, NamespaceInfo>);

impl NamespaceInfoMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build infos for `names`, all sharing one lookback and infrastructure set.
    pub fn build<I, S>(
        names: I,
        duration: Duration,
        infrastructure: &InfrastructureNamespaces,
    ) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut map = Self::new();
        for name in names {
            map.insert(NamespaceInfo::new(name, duration, infrastructure.clone())?);
        }
        Ok(map)
    }

    pub fn insert(&mut self, info: NamespaceInfo) {
        self.0.insert(info.namespace.clone(), info);
    }

    pub fn get(&self, namespace: &str) -> Option<&NamespaceInfo> {
        self.0.get(namespace)
    }

    pub fn contains(&self, namespace: &str) -> bool {
        self.0.contains_key(namespace)
    }

    /// Requested namespace names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(|s| s.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &NamespaceInfo> {
        self.0.values()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

static DNS_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("DNS label pattern is valid")
});

/// Namespace names end up inside query label matchers, so only DNS-1123
/// labels are accepted.
pub fn validate_namespace(name: &str) -> Result<(), ConfigError> {
    if name.len() <= 63 && DNS_LABEL.is_match(name) {
        Ok(())
    } else {
        Err(ConfigError::InvalidNamespace {
            name: name.to_string(),
        })
    }
}

/// Settings shared by the appenders a registry builds.
#[derive(Debug, Clone)]
pub struct AppenderOptions {
    pub graph_type: GraphType,
    pub inject_service_nodes: bool,
    pub namespaces: NamespaceInfoMap,
    /// Response-time percentile in (0, 100).
    pub quantile: f64,
    pub query_time: SystemTime,
}

/// Build the ordered appender list named by `names`.
///
/// `_all_` selects every appender; an empty list selects none.
pub fn parse_appenders<S: AsRef<str>>(
    names: &[S],
    options: &AppenderOptions,
) -> AppenderResult<Vec<Box<dyn Appender>>> {
    let mut appenders: Vec<Box<dyn Appender>> = Vec::new();
    let mut response_time = false;

    for name in names {
        match name.as_ref().trim() {
            ALL_APPENDERS | RESPONSE_TIME_APPENDER_NAME => response_time = true,
            "" => {}
            other => {
                return Err(AppenderError::UnknownAppender {
                    name: other.to_string(),
                });
            }
        }
    }

    if response_time {
        appenders.push(Box::new(ResponseTimeAppender::new(options)));
    }
    Ok(appenders)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::ReplayMetrics;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn options() -> AppenderOptions {
        AppenderOptions {
            graph_type: GraphType::Workload,
            inject_service_nodes: false,
            namespaces: NamespaceInfoMap::new(),
            quantile: DEFAULT_QUANTILE,
            query_time: SystemTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn client_is_constructed_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let global = AppenderGlobalInfo::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            let client: Arc<dyn MetricsApi> = Arc::new(ReplayMetrics::new());
            Ok(client)
        });

        assert!(!global.is_initialized());
        let a = global.metrics_client().unwrap();
        let b = global.metrics_client().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_first_use_constructs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let global = AppenderGlobalInfo::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            let client: Arc<dyn MetricsApi> = Arc::new(ReplayMetrics::new());
            Ok(client)
        });

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| global.metrics_client().unwrap());
            }
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_construction_is_remembered() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let global = AppenderGlobalInfo::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(MetricsError::InvalidUrl { url: "nope".into() })
        });

        for _ in 0..2 {
            match global.metrics_client() {
                Err(e) => assert!(e.is_fatal()),
                Ok(_) => panic!("construction should have failed"),
            }
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn prometheus_factory_rejects_bad_url() {
        let global = AppenderGlobalInfo::prometheus(PrometheusConfig {
            url: "localhost:9090".into(),
            ..Default::default()
        });
        assert!(matches!(
            global.metrics_client(),
            Err(AppenderError::ClientInit { .. })
        ));
    }

    #[test]
    fn namespace_names_are_validated() {
        assert!(validate_namespace("istio-system").is_ok());
        assert!(validate_namespace("bookinfo2").is_ok());
        assert!(validate_namespace("").is_err());
        assert!(validate_namespace("Bookinfo").is_err());
        assert!(validate_namespace("-edge").is_err());
        assert!(validate_namespace("a\"}or{b").is_err());
        assert!(validate_namespace(&"a".repeat(64)).is_err());
    }

    #[test]
    fn namespace_info_knows_infrastructure() {
        let infra = InfrastructureNamespaces::new(["istio-system"]);
        let map = NamespaceInfoMap::build(
            ["bookinfo", "istio-system"],
            Duration::from_secs(600),
            &infra,
        )
        .unwrap();
        assert!(map.get("istio-system").unwrap().is_infrastructure());
        assert!(!map.get("bookinfo").unwrap().is_infrastructure());
        assert_eq!(map.names().collect::<Vec<_>>(), vec!["bookinfo", "istio-system"]);
    }

    #[test]
    fn zero_lookback_is_rejected() {
        let result = NamespaceInfo::new(
            "bookinfo",
            Duration::ZERO,
            InfrastructureNamespaces::default(),
        );
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn parse_appenders_by_name() {
        let all = parse_appenders(&[ALL_APPENDERS], &options()).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name(), RESPONSE_TIME_APPENDER_NAME);

        let named = parse_appenders(&["responseTime", "responseTime"], &options()).unwrap();
        assert_eq!(named.len(), 1);

        let none = parse_appenders::<&str>(&[], &options()).unwrap();
        assert!(none.is_empty());

        assert!(matches!(
            parse_appenders(&["securityPolicy"], &options()),
            Err(AppenderError::UnknownAppender { .. })
        ));
    }
}
