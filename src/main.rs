//! mesh-graph CLI: enrich mesh traffic graphs with telemetry.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};

use mesh_graph::appender::AppenderGlobalInfo;
use mesh_graph::config::MeshConfig;
use mesh_graph::graph::snapshot::GraphSnapshot;
use mesh_graph::graph::{GraphType, NodeIdentity};
use mesh_graph::metrics::{MetricsApi, ReplayMetrics};
use mesh_graph::pipeline::Pipeline;

#[derive(Parser)]
#[command(name = "mesh-graph", version, about = "Service mesh traffic graph enrichment")]
struct Cli {
    /// Path to a TOML config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enrich a traffic graph snapshot with telemetry.
    Enrich {
        /// Graph snapshot JSON to enrich.
        #[arg(long)]
        input: PathBuf,

        /// Namespaces to enrich (comma-separated).
        #[arg(long, value_delimiter = ',', required = true)]
        namespaces: Vec<String>,

        /// Where to write the enriched snapshot (stdout when omitted).
        #[arg(long)]
        output: Option<PathBuf>,

        /// Graph type, overriding the snapshot and config.
        #[arg(long)]
        graph_type: Option<GraphType>,

        /// Response-time percentile, overriding the config.
        #[arg(long)]
        quantile: Option<f64>,

        /// Query evaluation time as unix seconds (now when omitted).
        #[arg(long)]
        query_time: Option<u64>,

        /// Answer queries from a recorded-responses JSON file instead of Prometheus.
        #[arg(long)]
        replay: Option<PathBuf>,
    },

    /// Resolve a node id from identity labels.
    Id {
        #[arg(long, default_value = "workload")]
        graph_type: GraphType,

        #[arg(long, default_value = "")]
        service_namespace: String,

        #[arg(long, default_value = "")]
        service: String,

        #[arg(long, default_value = "")]
        workload_namespace: String,

        #[arg(long, default_value = "")]
        workload: String,

        #[arg(long, default_value = "")]
        app: String,

        #[arg(long, default_value = "")]
        version: String,
    },
}

fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(3)
                .build(),
        )
    }))
    .ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match cli.config {
        Some(ref path) => MeshConfig::load(path)?,
        None => MeshConfig::default(),
    };

    match cli.command {
        Commands::Enrich {
            input,
            namespaces,
            output,
            graph_type,
            quantile,
            query_time,
            replay,
        } => {
            let content = std::fs::read_to_string(&input).into_diagnostic()?;
            let snapshot = GraphSnapshot::from_json(&content)?;

            if let Some(graph_type) = graph_type.or(snapshot.graph_type) {
                config.graph.graph_type = graph_type;
            }
            if let Some(quantile) = quantile {
                config.graph.quantile = quantile;
            }
            let query_time = query_time
                .map(|secs| UNIX_EPOCH + Duration::from_secs(secs))
                .unwrap_or_else(SystemTime::now);

            let mut traffic_map = snapshot.into_map()?;
            let options = config.appender_options(&namespaces, query_time)?;
            let pipeline = Pipeline::from_names(&config.appender_names(), &options)?;

            let global = match replay {
                Some(path) => {
                    let client: Arc<dyn MetricsApi> = Arc::new(ReplayMetrics::load(&path)?);
                    AppenderGlobalInfo::with_client(client)
                }
                None => AppenderGlobalInfo::prometheus(config.prometheus.clone()),
            };

            tracing::info!(
                nodes = traffic_map.len(),
                edges = traffic_map.edge_count(),
                appenders = ?pipeline.names(),
                graph_type = %config.graph.graph_type,
                "enriching graph"
            );

            // One shared map: namespaces run one after another.
            let mut failed = 0;
            for info in options.namespaces.values() {
                match pipeline.run(&mut traffic_map, &global, info) {
                    Ok(()) => {}
                    Err(e) if e.is_fatal() => return Err(e.into()),
                    Err(e) => {
                        tracing::warn!(
                            namespace = %info.namespace,
                            error = %e,
                            "namespace left partially enriched"
                        );
                        failed += 1;
                    }
                }
            }

            let enriched = GraphSnapshot::from_map(&traffic_map, Some(config.graph.graph_type));
            let json = enriched.to_json_pretty()?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json).into_diagnostic()?;
                    eprintln!("Wrote enriched graph to {}", path.display());
                }
                None => println!("{json}"),
            }
            if failed > 0 {
                eprintln!("{failed} of {} namespaces failed to enrich", options.namespaces.len());
            }
        }

        Commands::Id {
            graph_type,
            service_namespace,
            service,
            workload_namespace,
            workload,
            app,
            version,
        } => {
            let identity = NodeIdentity {
                service_namespace: &service_namespace,
                service: &service,
                workload_namespace: &workload_namespace,
                workload: &workload,
                app: &app,
                version: &version,
            };
            let (id, node_type) = identity.resolve(graph_type);
            println!("{id}\t{node_type}");
        }
    }

    Ok(())
}
