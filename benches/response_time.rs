//! Benchmarks for response-time merge and apply.

use std::time::SystemTime;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use mesh_graph::appender::NamespaceInfoMap;
use mesh_graph::appender::response_time::{
    ResponseTimeAppender, ResponseTimeMap, apply_response_time,
};
use mesh_graph::graph::{GraphType, NodeIdentity, TrafficMap};
use mesh_graph::metrics::{Sample, Vector};

const WORKLOADS: usize = 200;

fn workload(i: usize) -> String {
    format!("wl-{i}")
}

/// A chain of workloads in one namespace: wl-0 -> wl-1 -> ... -> wl-N.
fn chain_map() -> TrafficMap {
    let mut map = TrafficMap::new();
    let names: Vec<String> = (0..WORKLOADS).map(workload).collect();
    let ids: Vec<_> = names
        .iter()
        .map(|name| {
            map.add_identity(
                &NodeIdentity {
                    service_namespace: "bench",
                    workload_namespace: "bench",
                    workload: name,
                    app: "app",
                    version: "v1",
                    ..Default::default()
                },
                GraphType::Workload,
            )
        })
        .collect();
    for pair in ids.windows(2) {
        map.add_edge(&pair[0], &pair[1]).unwrap();
    }
    map
}

fn chain_samples() -> Vector {
    (1..WORKLOADS)
        .map(|i| {
            let src = workload(i - 1);
            let dst = workload(i);
            Sample::from_labels(
                [
                    ("source_workload_namespace", "bench"),
                    ("source_workload", src.as_str()),
                    ("source_app", "app"),
                    ("source_version", "v1"),
                    ("destination_service_namespace", "bench"),
                    ("destination_service_name", "svc"),
                    ("destination_workload_namespace", "bench"),
                    ("destination_workload", dst.as_str()),
                    ("destination_app", "app"),
                    ("destination_version", "v1"),
                ],
                0.001 * i as f64,
            )
        })
        .collect()
}

fn appender() -> ResponseTimeAppender {
    ResponseTimeAppender {
        graph_type: GraphType::Workload,
        inject_service_nodes: false,
        namespaces: NamespaceInfoMap::new(),
        quantile: 95.0,
        query_time: SystemTime::UNIX_EPOCH,
    }
}

fn bench_populate(c: &mut Criterion) {
    let rt = appender();
    let samples = chain_samples();

    c.bench_function("populate_200_samples", |bench| {
        bench.iter(|| {
            let mut values = ResponseTimeMap::new();
            rt.populate(&mut values, black_box(&samples));
            black_box(values)
        })
    });
}

fn bench_apply(c: &mut Criterion) {
    let rt = appender();
    let mut values = ResponseTimeMap::new();
    rt.populate(&mut values, &chain_samples());
    let mut map = chain_map();

    c.bench_function("apply_200_edges", |bench| {
        bench.iter(|| black_box(apply_response_time(&mut map, black_box(&values))))
    });
}

criterion_group!(benches, bench_populate, bench_apply);
criterion_main!(benches);
