use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use cass_pilot::{
    Caller, QueryRequest, QueryService, Settings,
    client::GrpcConnector,
    cluster::{ClusterDirectory, ContactPoint, FileDirectory, StaticDirectory},
    health::{HealthMonitor, StatusCache, TcpProber, probe_tcp},
    http::{self, ApiState},
    querylog::{JsonlQueryLog, QueryLogSink, TracingQueryLog},
    registry::QueryRegistry,
    telemetry,
    util::{print_health, print_rows},
};
use clap::{Args, Parser, Subcommand};
use tracing::info;

#[derive(Parser)]
#[command(name = "cass-pilot")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the HTTP API and run the periodic health monitor
    Serve(ServeArgs),
    /// Run one health pass over every active cluster and print it
    Health {
        #[arg(long)]
        clusters: PathBuf,
        #[command(flatten)]
        settings: SettingsArgs,
    },
    /// Check whether a single host:port accepts TCP connections
    Probe {
        target: String,
        #[arg(long, default_value_t = 3_000)]
        timeout_ms: u64,
        #[arg(long, default_value_t = 9042)]
        default_port: u16,
    },
    /// Run one read-only query and print the rows
    Query(QueryArgs),
}

#[derive(Args)]
struct ServeArgs {
    #[arg(long, default_value = "127.0.0.1:3001")]
    listen: SocketAddr,
    /// JSON file describing the clusters; re-read on every health pass
    #[arg(long)]
    clusters: PathBuf,
    /// Append finished queries to this file as JSON lines
    #[arg(long)]
    query_log: Option<PathBuf>,
    #[command(flatten)]
    settings: SettingsArgs,
}

#[derive(Args)]
struct QueryArgs {
    #[arg(long)]
    clusters: PathBuf,
    /// Cluster id to run against
    #[arg(long)]
    cluster: String,
    #[arg(long, default_value = "cli")]
    user: String,
    #[command(flatten)]
    settings: SettingsArgs,
    /// Statement text; words are joined with spaces
    #[arg(required = true, trailing_var_arg = true)]
    text: Vec<String>,
}

#[derive(Args)]
struct SettingsArgs {
    #[arg(long, default_value_t = 3_000)]
    probe_timeout_ms: u64,
    #[arg(long, default_value_t = 60)]
    health_interval_secs: u64,
    #[arg(long, default_value_t = 10_000)]
    connect_timeout_ms: u64,
    #[arg(long, default_value_t = 30_000)]
    read_timeout_ms: u64,
    #[arg(long, default_value_t = 9042)]
    default_port: u16,
    /// Connect to the port declared on each contact point instead of the
    /// default port
    #[arg(long)]
    honor_declared_ports: bool,
    #[arg(long, default_value_t = 1000)]
    max_rows: usize,
}

impl SettingsArgs {
    fn into_settings(self) -> Settings {
        Settings {
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            health_interval: Duration::from_secs(self.health_interval_secs),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            default_port: self.default_port,
            honor_declared_ports: self.honor_declared_ports,
            max_rows: self.max_rows,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => {
            let guard = telemetry::init_tracing("cass-pilot", Some(args.listen.to_string()))?;
            run_serve(args).await?;
            if let Err(err) = guard.shutdown() {
                tracing::error!(?err, "failed to shutdown tracer provider");
            }
        }
        Command::Health { clusters, settings } => {
            let guard = telemetry::init_tracing("cass-pilot-cli", None)?;
            let settings = settings.into_settings();
            settings.validate()?;
            let monitor = HealthMonitor::new(
                Arc::new(StaticDirectory::from_path(&clusters)?),
                Arc::new(TcpProber::new(settings.probe_timeout)),
                Arc::new(StatusCache::new()),
                settings.health_interval,
                settings.default_port,
            );
            let statuses = monitor.refresh().await;
            print_health(&statuses, &mut std::io::stdout())?;
            if let Err(err) = guard.shutdown() {
                tracing::error!(?err, "failed to shutdown tracer provider");
            }
        }
        Command::Probe {
            target,
            timeout_ms,
            default_port,
        } => {
            let cp: ContactPoint = target.parse()?;
            let port = cp.probe_port(default_port);
            let online = probe_tcp(&cp.host, port, Duration::from_millis(timeout_ms)).await;
            println!("{cp}: {}", if online { "online" } else { "offline" });
        }
        Command::Query(args) => {
            let guard = telemetry::init_tracing("cass-pilot-cli", None)?;
            run_query(args).await?;
            if let Err(err) = guard.shutdown() {
                tracing::error!(?err, "failed to shutdown tracer provider");
            }
        }
    }
    Ok(())
}

async fn run_serve(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let settings = args.settings.into_settings();
    settings.validate()?;

    let directory: Arc<dyn ClusterDirectory> = Arc::new(FileDirectory::new(&args.clusters));
    // refuse to start on an unreadable cluster file
    let clusters = directory.active_clusters().await?;
    info!(
        clusters = clusters.len(),
        path = %args.clusters.display(),
        "loaded cluster directory"
    );

    let log: Arc<dyn QueryLogSink> = match args.query_log {
        Some(path) => Arc::new(JsonlQueryLog::new(path)),
        None => Arc::new(TracingQueryLog),
    };
    let service = Arc::new(QueryService::new(
        Arc::new(QueryRegistry::new()),
        directory.clone(),
        Arc::new(GrpcConnector),
        log,
        settings.clone(),
    ));
    let monitor = Arc::new(HealthMonitor::new(
        directory,
        Arc::new(TcpProber::new(settings.probe_timeout)),
        Arc::new(StatusCache::new()),
        settings.health_interval,
        settings.default_port,
    ));
    let ticker = monitor.clone().spawn();

    let listener = std::net::TcpListener::bind(args.listen)?;
    let state = Arc::new(ApiState { service, monitor });
    http::serve(listener, state, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(%err, "cannot listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        info!("shutting down");
    })
    .await?;
    ticker.abort();
    Ok(())
}

async fn run_query(args: QueryArgs) -> Result<(), Box<dyn std::error::Error>> {
    let settings = args.settings.into_settings();
    settings.validate()?;
    let service = QueryService::new(
        Arc::new(QueryRegistry::new()),
        Arc::new(StaticDirectory::from_path(&args.clusters)?),
        Arc::new(GrpcConnector),
        Arc::new(TracingQueryLog),
        settings,
    );
    let result = service
        .submit(QueryRequest {
            cluster_id: args.cluster,
            text: args.text.join(" "),
            caller: Caller::user(args.user),
            query_id: None,
        })
        .await?;
    print_rows(&result.columns, &result.rows, &mut std::io::stdout())?;
    if result.truncated {
        println!("(truncated, {} rows returned by the cluster)", result.total_rows);
    }
    Ok(())
}
