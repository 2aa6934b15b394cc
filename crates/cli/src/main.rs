use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use stellar_api::{router, Backends, Coordinator, Tuning};
use stellar_kubehub::{ContextProvider, KubeHubConnector, KubePolicyBackend, KubeProbe, KubeSource, ResourceSource};
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "stellarctl", version, about = "KubeStellar console backend")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Explicit kubeconfig path (default: $KUBECONFIG or ~/.kube/config)
    #[arg(long, env = "KUBECONFIG", global = true)]
    kubeconfig: Option<PathBuf>,

    /// Context of the workload description space (default: current context)
    #[arg(long = "wds-context", env = "STELLAR_WDS_CONTEXT", global = true)]
    wds_context: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the console HTTP and WebSocket API
    Serve {
        #[arg(long, env = "STELLAR_LISTEN", default_value = "0.0.0.0:4000")]
        listen: SocketAddr,
        /// OCM hub (ITS) context used for detachment
        #[arg(long = "hub-context", env = "STELLAR_HUB_CONTEXT")]
        hub_context: Option<String>,
    },
    /// List the resources the resource stream would watch, by priority
    Discover,
    /// Print the clusters and workloads a binding policy file targets
    Derive {
        /// BindingPolicy YAML file
        file: PathBuf,
    },
}

fn init_tracing() {
    let env = std::env::var("STELLAR_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("STELLAR_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid STELLAR_METRICS_ADDR; expected host:port");
        }
    }
}

async fn shutdown() {
    if let Err(e) = signal::ctrl_c().await {
        warn!(error = %e, "ctrl-c handler failed; serving until killed");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

async fn serve(cli: &Cli, listen: SocketAddr, hub_context: Option<String>) -> Result<()> {
    let provider = Arc::new(ContextProvider::new(cli.kubeconfig.clone()));
    let wds = provider.client(cli.wds_context.as_deref()).await.context("connecting to the workload description space")?;
    if hub_context.is_none() {
        warn!("no hub context configured; detachment requests will fail");
    }
    let backends = Backends {
        probe: Arc::new(KubeProbe),
        hub: Arc::new(KubeHubConnector::new(provider.clone(), hub_context.clone())),
        source: Arc::new(KubeSource::new(wds.clone())),
        policies: Arc::new(KubePolicyBackend::new(wds)),
    };
    let app = router(Arc::new(Coordinator::new(backends, Tuning::default())));
    let listener = tokio::net::TcpListener::bind(listen).await.with_context(|| format!("binding {listen}"))?;
    info!(addr = %listen, hub = ?hub_context, wds = ?cli.wds_context, "console listening");
    axum::serve(listener, app).with_graceful_shutdown(shutdown()).await.context("serving")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Serve { listen, hub_context } => serve(&cli, *listen, hub_context.clone()).await?,
        Commands::Discover => {
            let t0 = Instant::now();
            let provider = ContextProvider::new(cli.kubeconfig.clone());
            let client = provider.client(cli.wds_context.as_deref()).await?;
            let found = KubeSource::new(client).discover().await?;
            info!(count = found.resources.len(), partial = found.partial, took_ms = %t0.elapsed().as_millis(), "discover ok");
            match cli.output {
                Output::Human => {
                    for r in &found.resources {
                        println!("{:?} • {} • {}", r.priority, r.gvr.key(), r.kind);
                    }
                    if found.partial {
                        eprintln!("warning: some API groups did not answer; list may be incomplete");
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&found)?),
            }
        }
        Commands::Derive { file } => {
            let yaml = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
            let (_, intent) = stellar_policy::parse_document(&yaml)?;
            let derived = stellar_policy::derive(&intent);
            match cli.output {
                Output::Human => {
                    println!("policy: {}", intent.name);
                    println!("clusters:");
                    for c in &derived.clusters {
                        println!("  {c}");
                    }
                    println!("workloads:");
                    for w in &derived.workloads {
                        println!("  {w}");
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&derived)?),
            }
        }
    }
    Ok(())
}
