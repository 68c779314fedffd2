// thiserror's #[error("...{field}...")] format strings reference struct fields,
// but the compiler doesn't see through the derive macro and reports false positives.
#![allow(unused_assignments)]

//! # mesh-graph
//!
//! Traffic-graph enrichment for service meshes: a deterministic node-identity
//! scheme, a graph model of mesh traffic, and a pipeline of appenders that
//! annotate the graph with telemetry fetched from Prometheus.
//!
//! ## Architecture
//!
//! - **Graph model** (`graph`): petgraph-backed `TrafficMap` with an id index,
//!   identity resolution (`graph::id`) and a JSON snapshot form
//! - **Metrics** (`metrics`): `MetricsApi` instant queries over the Prometheus
//!   HTTP API, or answered from recorded responses
//! - **Appenders** (`appender`): enrichment stages and their request context,
//!   including the response-time appender
//! - **Pipeline** (`pipeline`): ordered stages per namespace, namespaces in parallel
//!
//! ## Library usage
//!
//! ```no_run
//! use std::time::SystemTime;
//!
//! use mesh_graph::appender::AppenderGlobalInfo;
//! use mesh_graph::config::MeshConfig;
//! use mesh_graph::graph::snapshot::GraphSnapshot;
//! use mesh_graph::pipeline::Pipeline;
//!
//! let config = MeshConfig::default();
//! let snapshot = GraphSnapshot::from_json(r#"{"nodes": [], "edges": []}"#).unwrap();
//! let mut map = snapshot.into_map().unwrap();
//!
//! let options = config.appender_options(&["bookinfo"], SystemTime::now()).unwrap();
//! let pipeline = Pipeline::from_names(&config.appender_names(), &options).unwrap();
//! let global = AppenderGlobalInfo::prometheus(config.prometheus.clone());
//! for info in options.namespaces.values() {
//!     pipeline.run(&mut map, &global, info).unwrap();
//! }
//! ```

pub mod appender;
pub mod config;
pub mod error;
pub mod graph;
pub mod metrics;
pub mod pipeline;
