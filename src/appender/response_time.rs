//! Response-time appender.
//!
//! Attaches a latency percentile (default 95th), in milliseconds, to every
//! edge of the traffic map. The value means: that share of requests on the
//! edge completed in no more than the stored number of milliseconds.
//!
//! Latency can be reported by the caller's proxy, the callee's proxy, or both,
//! depending on where the traffic comes from. Each namespace is therefore
//! covered by several traffic-disjoint queries, each choosing the reporter
//! that actually sees its traffic:
//!
//! 1. unknown (out-of-mesh) callers into the namespace, callee-reported;
//! 2. callers from other namespaces, caller-reported, or callee-reported when
//!    the namespace is infrastructure;
//! 3. callers inside the namespace, caller-reported;
//! 4. for infrastructure namespaces only, infrastructure-to-infrastructure
//!    traffic, callee-reported.

use std::collections::HashMap;
use std::time::SystemTime;

use rayon::prelude::*;

use crate::graph::{
    EdgeKey, GraphType, NodeIdentity, NodeType, RESPONSE_TIME, TrafficMap, is_ok,
};
use crate::metrics::{MetricsResult, Sample, Vector};

use super::{
    Appender, AppenderError, AppenderGlobalInfo, AppenderOptions, AppenderResult, NamespaceInfo,
    NamespaceInfoMap,
};

/// Uniquely identifies the appender.
pub const RESPONSE_TIME_APPENDER_NAME: &str = "responseTime";

/// Percentile used when the configured one is out of range.
pub const DEFAULT_QUANTILE: f64 = 95.0;

const METRIC: &str = "istio_request_duration_seconds_bucket";

/// Success for every protocol the mesh reports; `0` is an unclassified response.
const RESPONSE_CODES: &str = "2[0-9]{2}|^0$";

const GROUP_BY: &str = "le,source_workload_namespace,source_workload,source_app,source_version,\
destination_service_namespace,destination_service_name,destination_workload_namespace,\
destination_workload,destination_app,destination_version";

/// Response-time values keyed by edge, in milliseconds.
pub type ResponseTimeMap = HashMap<EdgeKey, f64>;

/// Adds a latency percentile to each edge.
#[derive(Debug, Clone)]
pub struct ResponseTimeAppender {
    pub graph_type: GraphType,
    pub inject_service_nodes: bool,
    /// Every namespace requested for this graph.
    pub namespaces: NamespaceInfoMap,
    /// Percentile in (0, 100).
    pub quantile: f64,
    pub query_time: SystemTime,
}

impl ResponseTimeAppender {
    pub fn new(options: &AppenderOptions) -> Self {
        Self {
            graph_type: options.graph_type,
            inject_service_nodes: options.inject_service_nodes,
            namespaces: options.namespaces.clone(),
            quantile: options.quantile,
            query_time: options.query_time,
        }
    }

    /// The configured percentile, or [`DEFAULT_QUANTILE`] when it is outside (0, 100).
    pub fn effective_quantile(&self) -> f64 {
        if self.quantile > 0.0 && self.quantile < 100.0 {
            self.quantile
        } else {
            tracing::warn!(
                quantile = self.quantile,
                default = DEFAULT_QUANTILE,
                "replacing invalid quantile with default"
            );
            DEFAULT_QUANTILE
        }
    }

    /// The query expressions evaluated for `namespace_info`, in merge order.
    pub fn queries(&self, namespace_info: &NamespaceInfo) -> Vec<String> {
        let quantile = format_quantile(self.effective_quantile());
        let namespace = namespace_info.namespace.as_str();
        let window = namespace_info.duration.as_secs();
        let is_infra = namespace_info.is_infrastructure();

        let expr = |selector: String| {
            format!(
                "histogram_quantile({quantile}, sum(rate({METRIC}{{{selector},response_code=~\"{RESPONSE_CODES}\"}}[{window}s])) by ({GROUP_BY}))"
            )
        };

        let mut queries = Vec::with_capacity(4);

        // 1) out-of-mesh callers; there is no caller proxy to report
        queries.push(expr(format!(
            "reporter=\"destination\",source_workload=\"unknown\",destination_service_namespace=\"{namespace}\""
        )));

        // 2) callers in other namespaces, unknown callers are covered by 1)
        let (reporter, source_filter) = if is_infra {
            // infrastructure is only reported callee-side, and other
            // infrastructure namespaces not requested here must not leak in
            let excluded: Vec<&str> = namespace_info
                .infrastructure
                .iter()
                .filter(|ns| !self.namespaces.contains(ns))
                .collect();
            let filter = if excluded.is_empty() {
                format!("source_workload_namespace!=\"{namespace}\"")
            } else {
                format!(
                    "source_workload_namespace!~\"{namespace}|{}\"",
                    excluded.join("|")
                )
            };
            ("destination", filter)
        } else {
            ("source", format!("source_workload_namespace!=\"{namespace}\""))
        };
        queries.push(expr(format!(
            "reporter=\"{reporter}\",{source_filter},source_workload!=\"unknown\",destination_service_namespace=\"{namespace}\""
        )));

        // 3) callers inside the namespace
        queries.push(expr(format!(
            "reporter=\"source\",source_workload_namespace=\"{namespace}\""
        )));

        // 4) infrastructure-to-infrastructure, invisible to 3)
        if is_infra {
            let requested: Vec<&str> = self
                .namespaces
                .names()
                .filter(|ns| namespace_info.infrastructure.contains(ns))
                .collect();
            let targets = if requested.is_empty() {
                namespace.to_string()
            } else {
                requested.join("|")
            };
            queries.push(expr(format!(
                "reporter=\"destination\",source_workload_namespace=\"{namespace}\",destination_service_namespace=~\"{targets}\""
            )));
        }

        queries
    }

    /// Fold one query result into `response_times`.
    ///
    /// Values are converted to milliseconds here so downstream rounding keeps
    /// the thousandths. Later samples overwrite earlier ones for the same edge.
    pub fn populate(&self, response_times: &mut ResponseTimeMap, vector: &Vector) {
        for sample in vector {
            let Some(labels) = SampleLabels::from_sample(sample) else {
                tracing::warn!(labels = ?sample.metric, "skipping sample, missing expected labels");
                continue;
            };

            let value = sample.value * 1000.0;
            // NaN: no traffic in the window. +Inf: the quantile fell in the
            // overflow bucket, which has no upper bound to report.
            if !value.is_finite() {
                if value.is_infinite() {
                    tracing::debug!(labels = ?sample.metric, "skipping unbounded response time");
                }
                continue;
            }

            let source = NodeIdentity {
                service_namespace: labels.source_workload_namespace,
                service: "",
                workload_namespace: labels.source_workload_namespace,
                workload: labels.source_workload,
                app: labels.source_app,
                version: labels.source_version,
            };
            let dest = NodeIdentity {
                service_namespace: labels.destination_service_namespace,
                service: labels.destination_service_name,
                workload_namespace: labels.destination_workload_namespace,
                workload: labels.destination_workload,
                app: labels.destination_app,
                version: labels.destination_version,
            };

            if self.inject_service_nodes && is_ok(dest.service) {
                let (_, dest_type) = dest.resolve(self.graph_type);
                if dest_type != NodeType::Service {
                    // The caller -> service edge gets no value: one hop cannot
                    // pool the latencies of several distinct backends.
                    let service = NodeIdentity {
                        service_namespace: dest.service_namespace,
                        service: dest.service,
                        workload_namespace: dest.service_namespace,
                        ..Default::default()
                    };
                    self.add_response_time(response_times, value, &service, &dest);
                    continue;
                }
            }
            self.add_response_time(response_times, value, &source, &dest);
        }
    }

    fn add_response_time(
        &self,
        response_times: &mut ResponseTimeMap,
        value: f64,
        source: &NodeIdentity<'_>,
        dest: &NodeIdentity<'_>,
    ) {
        let (source_id, _) = source.resolve(self.graph_type);
        let (dest_id, _) = dest.resolve(self.graph_type);
        response_times.insert(EdgeKey::new(source_id, dest_id), value);
    }
}

impl Appender for ResponseTimeAppender {
    fn name(&self) -> &'static str {
        RESPONSE_TIME_APPENDER_NAME
    }

    fn append_graph(
        &self,
        traffic_map: &mut TrafficMap,
        global_info: &AppenderGlobalInfo,
        namespace_info: &NamespaceInfo,
    ) -> AppenderResult<()> {
        if traffic_map.is_empty() {
            return Ok(());
        }

        let client = global_info.metrics_client()?;
        let queries = self.queries(namespace_info);
        tracing::debug!(
            namespace = %namespace_info.namespace,
            queries = queries.len(),
            "generating response times"
        );

        let results: Vec<MetricsResult<Vector>> = queries
            .par_iter()
            .map(|query| client.query(query, self.query_time))
            .collect();

        let mut response_times = ResponseTimeMap::new();
        for (query, result) in queries.iter().zip(results) {
            let vector = result.map_err(|source| AppenderError::Query {
                appender: RESPONSE_TIME_APPENDER_NAME,
                namespace: namespace_info.namespace.clone(),
                source,
            })?;
            tracing::trace!(query = %query, samples = vector.len(), "response time query");
            self.populate(&mut response_times, &vector);
        }

        let applied = apply_response_time(traffic_map, &response_times);
        tracing::debug!(
            namespace = %namespace_info.namespace,
            edges = applied,
            "applied response times"
        );
        Ok(())
    }
}

/// Set [`RESPONSE_TIME`] on every edge with a value; other edges are untouched.
///
/// Returns the number of edges updated.
pub fn apply_response_time(
    traffic_map: &mut TrafficMap,
    response_times: &ResponseTimeMap,
) -> usize {
    let mut applied = 0;
    for edge in traffic_map.edges_mut() {
        if let Some(value) = response_times.get(&edge.key()) {
            if edge.metadata.set_f64(RESPONSE_TIME, *value) {
                applied += 1;
            }
        }
    }
    applied
}

/// Percentile → histogram_quantile fraction, without trailing zeros.
fn format_quantile(percentile: f64) -> String {
    let fraction = format!("{:.6}", percentile / 100.0);
    fraction.trim_end_matches('0').trim_end_matches('.').to_string()
}

/// The identity labels every response-time sample must carry.
struct SampleLabels<'a> {
    source_workload_namespace: &'a str,
    source_workload: &'a str,
    source_app: &'a str,
    source_version: &'a str,
    destination_service_namespace: &'a str,
    destination_service_name: &'a str,
    destination_workload_namespace: &'a str,
    destination_workload: &'a str,
    destination_app: &'a str,
    destination_version: &'a str,
}

impl<'a> SampleLabels<'a> {
    fn from_sample(sample: &'a Sample) -> Option<Self> {
        Some(Self {
            source_workload_namespace: sample.label("source_workload_namespace")?,
            source_workload: sample.label("source_workload")?,
            source_app: sample.label("source_app")?,
            source_version: sample.label("source_version")?,
            destination_service_namespace: sample.label("destination_service_namespace")?,
            destination_service_name: sample.label("destination_service_name")?,
            destination_workload_namespace: sample.label("destination_workload_namespace")?,
            destination_workload: sample.label("destination_workload")?,
            destination_app: sample.label("destination_app")?,
            destination_version: sample.label("destination_version")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::appender::InfrastructureNamespaces;
    use crate::graph::{NodeId, UNKNOWN, id};

    fn appender(quantile: f64) -> ResponseTimeAppender {
        ResponseTimeAppender {
            graph_type: GraphType::Workload,
            inject_service_nodes: false,
            namespaces: NamespaceInfoMap::new(),
            quantile,
            query_time: SystemTime::UNIX_EPOCH,
        }
    }

    fn sample(
        source: (&str, &str, &str, &str),
        dest_service: (&str, &str),
        dest: (&str, &str, &str, &str),
        value: f64,
    ) -> Sample {
        Sample::from_labels(
            [
                ("source_workload_namespace", source.0),
                ("source_workload", source.1),
                ("source_app", source.2),
                ("source_version", source.3),
                ("destination_service_namespace", dest_service.0),
                ("destination_service_name", dest_service.1),
                ("destination_workload_namespace", dest.0),
                ("destination_workload", dest.1),
                ("destination_app", dest.2),
                ("destination_version", dest.3),
            ],
            value,
        )
    }

    fn wl_id(ns: &str, workload: &str) -> NodeId {
        id(ns, "", ns, workload, "", "", GraphType::Workload).0
    }

    #[test]
    fn invalid_quantiles_fall_back_to_default() {
        for q in [0.0, 100.0, -5.0, 150.0] {
            assert_eq!(appender(q).effective_quantile(), DEFAULT_QUANTILE);
        }
        assert_eq!(appender(99.9).effective_quantile(), 99.9);
    }

    #[test]
    fn quantile_renders_as_fraction() {
        assert_eq!(format_quantile(95.0), "0.95");
        assert_eq!(format_quantile(99.9), "0.999");
        assert_eq!(format_quantile(50.0), "0.5");
    }

    #[test]
    fn unknown_source_query_text() {
        let info = NamespaceInfo::new(
            "bookinfo",
            Duration::from_secs(600),
            InfrastructureNamespaces::new(["istio-system"]),
        )
        .unwrap();
        let queries = appender(95.0).queries(&info);
        assert_eq!(queries.len(), 3);
        assert_eq!(
            queries[0],
            "histogram_quantile(0.95, sum(rate(istio_request_duration_seconds_bucket{reporter=\"destination\",\
             source_workload=\"unknown\",destination_service_namespace=\"bookinfo\",\
             response_code=~\"2[0-9]{2}|^0$\"}[600s])) by (le,source_workload_namespace,source_workload,\
             source_app,source_version,destination_service_namespace,destination_service_name,\
             destination_workload_namespace,destination_workload,destination_app,destination_version))"
        );
        assert!(queries[1].contains("reporter=\"source\",source_workload_namespace!=\"bookinfo\""));
        assert!(queries[2].contains("reporter=\"source\",source_workload_namespace=\"bookinfo\""));
    }

    #[test]
    fn infrastructure_namespace_adds_supplemental_query() {
        let infra = InfrastructureNamespaces::new(["istio-system", "istio-telemetry"]);
        let mut rt = appender(95.0);
        rt.namespaces = NamespaceInfoMap::build(
            ["bookinfo", "istio-system"],
            Duration::from_secs(60),
            &infra,
        )
        .unwrap();
        let info = rt.namespaces.get("istio-system").unwrap().clone();

        let queries = rt.queries(&info);
        assert_eq!(queries.len(), 4);
        assert!(queries[1].contains(
            "reporter=\"destination\",source_workload_namespace!~\"istio-system|istio-telemetry\""
        ));
        assert!(queries[3].contains(
            "reporter=\"destination\",source_workload_namespace=\"istio-system\",destination_service_namespace=~\"istio-system\""
        ));
        assert!(queries.iter().all(|q| q.contains("[60s]")));
    }

    #[test]
    fn seconds_become_milliseconds() {
        let rt = appender(95.0);
        let mut map = ResponseTimeMap::new();
        rt.populate(
            &mut map,
            &vec![sample(
                ("bookinfo", "productpage-v1", "productpage", "v1"),
                ("bookinfo", "reviews"),
                ("bookinfo", "reviews-v1", "reviews", "v1"),
                0.25,
            )],
        );
        let key = EdgeKey::new(
            wl_id("bookinfo", "productpage-v1"),
            wl_id("bookinfo", "reviews-v1"),
        );
        assert_eq!(map.get(&key), Some(&250.0));
    }

    #[test]
    fn nan_is_dropped() {
        let rt = appender(95.0);
        let mut map = ResponseTimeMap::new();
        rt.populate(
            &mut map,
            &vec![sample(
                ("bookinfo", "productpage-v1", "productpage", "v1"),
                ("bookinfo", "reviews"),
                ("bookinfo", "reviews-v1", "reviews", "v1"),
                f64::NAN,
            )],
        );
        assert!(map.is_empty());
    }

    #[test]
    fn infinite_latency_is_dropped() {
        let rt = appender(95.0);
        let mut map = ResponseTimeMap::new();
        rt.populate(
            &mut map,
            &vec![sample(
                ("bookinfo", "productpage-v1", "productpage", "v1"),
                ("bookinfo", "reviews"),
                ("bookinfo", "reviews-v1", "reviews", "v1"),
                f64::INFINITY,
            )],
        );
        assert!(map.is_empty());
    }

    #[test]
    fn apply_skips_non_finite_values() {
        let mut traffic = TrafficMap::new();
        let a = traffic.add_identity(
            &NodeIdentity {
                service_namespace: "bookinfo",
                workload_namespace: "bookinfo",
                workload: "productpage-v1",
                ..Default::default()
            },
            GraphType::Workload,
        );
        let b = traffic.add_identity(
            &NodeIdentity {
                service_namespace: "bookinfo",
                workload_namespace: "bookinfo",
                workload: "reviews-v1",
                ..Default::default()
            },
            GraphType::Workload,
        );
        traffic.add_edge(&a, &b).unwrap();

        let mut values = ResponseTimeMap::new();
        values.insert(EdgeKey::new(a.clone(), b.clone()), f64::INFINITY);
        assert_eq!(apply_response_time(&mut traffic, &values), 0);
        assert!(!traffic.edge(&a, &b).unwrap().metadata.contains_key(RESPONSE_TIME));
    }

    #[test]
    fn missing_label_skips_only_that_sample() {
        let rt = appender(95.0);
        let mut broken = sample(
            ("bookinfo", "productpage-v1", "productpage", "v1"),
            ("bookinfo", "reviews"),
            ("bookinfo", "reviews-v1", "reviews", "v1"),
            0.1,
        );
        broken.metric.remove("destination_service_namespace");
        let good = sample(
            ("bookinfo", "reviews-v1", "reviews", "v1"),
            ("bookinfo", "ratings"),
            ("bookinfo", "ratings-v1", "ratings", "v1"),
            0.02,
        );

        let mut map = ResponseTimeMap::new();
        rt.populate(&mut map, &vec![broken, good]);
        assert_eq!(map.len(), 1);
        let key = EdgeKey::new(wl_id("bookinfo", "reviews-v1"), wl_id("bookinfo", "ratings-v1"));
        assert_eq!(map.get(&key), Some(&20.0));
    }

    #[test]
    fn injection_keys_service_edge() {
        let mut rt = appender(95.0);
        rt.inject_service_nodes = true;
        let mut map = ResponseTimeMap::new();
        rt.populate(
            &mut map,
            &vec![sample(
                ("bookinfo", "productpage-v1", "productpage", "v1"),
                ("bookinfo", "reviews"),
                ("bookinfo", "reviews-v1", "reviews", "v1"),
                0.1,
            )],
        );
        let svc = id("bookinfo", "reviews", "bookinfo", "", "", "", GraphType::Workload).0;
        assert_eq!(map.len(), 1);
        let service_edge = EdgeKey::new(svc.clone(), wl_id("bookinfo", "reviews-v1"));
        assert_eq!(map.get(&service_edge), Some(&100.0));
        assert!(!map.contains_key(&EdgeKey::new(wl_id("bookinfo", "productpage-v1"), svc)));
    }

    #[test]
    fn injection_skipped_when_destination_is_a_service() {
        let mut rt = appender(95.0);
        rt.inject_service_nodes = true;
        let mut map = ResponseTimeMap::new();
        // no destination workload: the destination already is the service node
        rt.populate(
            &mut map,
            &vec![sample(
                ("bookinfo", "productpage-v1", "productpage", "v1"),
                ("bookinfo", "details"),
                ("unknown", "unknown", "unknown", "unknown"),
                0.1,
            )],
        );
        let (svc, _) = id(
            "bookinfo",
            "details",
            UNKNOWN,
            UNKNOWN,
            UNKNOWN,
            UNKNOWN,
            GraphType::Workload,
        );
        assert_eq!(
            map.get(&EdgeKey::new(wl_id("bookinfo", "productpage-v1"), svc)),
            Some(&100.0)
        );
    }
}
