//! Node identity: mesh labels + granularity → `(NodeId, NodeType)`.
//!
//! Resolution is a total function. Incomplete identities degrade to an
//! `Unknown` node scoped to their namespace instead of failing.

use super::{GraphType, NodeId, NodeType};

/// Label value the mesh reports when it cannot identify a peer.
pub const UNKNOWN: &str = "unknown";

/// Id of the single node standing for every out-of-mesh caller.
pub const UNKNOWN_SOURCE_ID: &str = "unknown_source";

/// Prefix of per-namespace unknown nodes. It differs from the first segment
/// of [`UNKNOWN_SOURCE_ID`], so no rendered id can equal the sentinel.
const UNKNOWN_PREFIX: &str = "unk";

/// A label value is usable when it is set and not the `unknown` placeholder.
pub fn is_ok(name: &str) -> bool {
    !name.is_empty() && name != UNKNOWN
}

/// The identity fields a telemetry sample carries for one side of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NodeIdentity<'a> {
    pub service_namespace: &'a str,
    pub service: &'a str,
    pub workload_namespace: &'a str,
    pub workload: &'a str,
    pub app: &'a str,
    pub version: &'a str,
}

impl<'a> NodeIdentity<'a> {
    /// The workload namespace when known, otherwise the service namespace.
    pub fn namespace(&self) -> &'a str {
        if is_ok(self.workload_namespace) {
            self.workload_namespace
        } else {
            self.service_namespace
        }
    }

    /// Resolve this identity to a node id and type at `graph_type`.
    pub fn resolve(&self, graph_type: GraphType) -> (NodeId, NodeType) {
        let namespace = self.namespace();

        // requests from outside the mesh
        if namespace == UNKNOWN
            && self.workload == UNKNOWN
            && self.app == UNKNOWN
            && self.service.is_empty()
        {
            return (NodeId::new(UNKNOWN_SOURCE_ID), NodeType::Unknown);
        }

        // requests to an unknown destination, e.g. an ingress path with no backend
        if self.workload == UNKNOWN
            && self.app == UNKNOWN
            && (self.service.is_empty() || self.service == UNKNOWN)
        {
            return (render("svc", &[namespace, UNKNOWN]), NodeType::Service);
        }

        let workload_ok = is_ok(self.workload);
        let app_ok = is_ok(self.app);
        let service_ok = is_ok(self.service);

        if !workload_ok && !app_ok && !service_ok {
            return (render(UNKNOWN_PREFIX, &[namespace]), NodeType::Unknown);
        }

        let service_node = || (render("svc", &[namespace, self.service]), NodeType::Service);
        let workload_node = || (render("wl", &[namespace, self.workload]), NodeType::Workload);

        match graph_type {
            // service graphs are resolved as workload graphs
            GraphType::Workload | GraphType::Service => {
                if workload_ok {
                    workload_node()
                } else if service_ok {
                    service_node()
                } else {
                    (render(UNKNOWN_PREFIX, &[namespace]), NodeType::Unknown)
                }
            }
            GraphType::App | GraphType::VersionedApp => {
                if app_ok {
                    if graph_type == GraphType::VersionedApp {
                        if workload_ok {
                            return (render("vapp", &[namespace, self.workload]), NodeType::App);
                        }
                        if is_ok(self.version) {
                            return (
                                render("vapp", &[namespace, self.app, self.version]),
                                NodeType::App,
                            );
                        }
                    }
                    (render("app", &[namespace, self.app]), NodeType::App)
                } else if workload_ok {
                    workload_node()
                } else {
                    service_node()
                }
            }
        }
    }
}

/// Resolve a node identity from its individual labels.
pub fn id(
    service_namespace: &str,
    service: &str,
    workload_namespace: &str,
    workload: &str,
    app: &str,
    version: &str,
    graph_type: GraphType,
) -> (NodeId, NodeType) {
    NodeIdentity {
        service_namespace,
        service,
        workload_namespace,
        workload,
        app,
        version,
    }
    .resolve(graph_type)
}

/// Join `prefix` and escaped `parts` with `_`.
///
/// Parts never contain a raw `_` after escaping, so distinct part lists
/// always render to distinct ids.
fn render(prefix: &str, parts: &[&str]) -> NodeId {
    let mut out = String::from(prefix);
    for part in parts {
        out.push('_');
        for c in part.chars() {
            match c {
                '%' => out.push_str("%25"),
                '_' => out.push_str("%5F"),
                c => out.push(c),
            }
        }
    }
    NodeId::new(out)
}
