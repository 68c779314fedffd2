//! Appender pipeline: ordered enrichment stages over a traffic map.
//!
//! Within one namespace the stages run strictly in order against the same
//! map, so a later stage can read metadata an earlier one wrote. Distinct
//! namespaces, each with its own map, can be processed concurrently and only
//! share the request's [`AppenderGlobalInfo`].

use rayon::prelude::*;

use crate::appender::{
    Appender, AppenderGlobalInfo, AppenderOptions, AppenderResult, NamespaceInfo, parse_appenders,
};
use crate::graph::TrafficMap;

/// Caller-ordered list of appenders.
#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Box<dyn Appender>>,
}

/// Result of running the pipeline for one namespace.
#[derive(Debug)]
pub struct NamespaceOutcome {
    pub namespace: String,
    /// The map after enrichment; partially enriched when `result` is an error.
    pub traffic_map: TrafficMap,
    pub result: AppenderResult<()>,
}

impl NamespaceOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

impl Pipeline {
    pub fn new(stages: Vec<Box<dyn Appender>>) -> Self {
        Self { stages }
    }

    /// Build a pipeline from appender names, see [`parse_appenders`].
    pub fn from_names<S: AsRef<str>>(
        names: &[S],
        options: &AppenderOptions,
    ) -> AppenderResult<Self> {
        Ok(Self::new(parse_appenders(names, options)?))
    }

    /// Stage names in run order.
    pub fn names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run every stage for one namespace, stopping at the first error.
    ///
    /// Metadata written by stages that already finished stays in place.
    pub fn run(
        &self,
        traffic_map: &mut TrafficMap,
        global_info: &AppenderGlobalInfo,
        namespace_info: &NamespaceInfo,
    ) -> AppenderResult<()> {
        tracing::info!(
            namespace = %namespace_info.namespace,
            stages = self.stages.len(),
            edges = traffic_map.edge_count(),
            "pipeline: enriching namespace"
        );

        for stage in &self.stages {
            tracing::debug!(
                namespace = %namespace_info.namespace,
                appender = stage.name(),
                "pipeline: running appender"
            );
            if let Err(e) = stage.append_graph(traffic_map, global_info, namespace_info) {
                tracing::warn!(
                    namespace = %namespace_info.namespace,
                    appender = stage.name(),
                    error = %e,
                    "pipeline: appender failed"
                );
                return Err(e);
            }
        }
        Ok(())
    }

    /// Run the pipeline for several namespaces in parallel.
    ///
    /// Each namespace carries its own map. Per-namespace failures are
    /// reported in the returned outcomes, in input order. A fatal error
    /// (the metrics client could not be built) fails the whole request.
    pub fn run_namespaces(
        &self,
        jobs: Vec<(NamespaceInfo, TrafficMap)>,
        global_info: &AppenderGlobalInfo,
    ) -> AppenderResult<Vec<NamespaceOutcome>> {
        let outcomes: Vec<NamespaceOutcome> = jobs
            .into_par_iter()
            .map(|(namespace_info, mut traffic_map)| {
                let result = self.run(&mut traffic_map, global_info, &namespace_info);
                NamespaceOutcome {
                    namespace: namespace_info.namespace,
                    traffic_map,
                    result,
                }
            })
            .collect();

        let mut finished = Vec::with_capacity(outcomes.len());
        for NamespaceOutcome {
            namespace,
            traffic_map,
            result,
        } in outcomes
        {
            let result = match result {
                Err(e) if e.is_fatal() => return Err(e),
                other => other,
            };
            finished.push(NamespaceOutcome {
                namespace,
                traffic_map,
                result,
            });
        }

        let failed = finished.iter().filter(|o| !o.is_ok()).count();
        tracing::info!(
            namespaces = finished.len(),
            failed,
            "pipeline: request complete"
        );
        Ok(finished)
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.names())
            .finish()
    }
}
