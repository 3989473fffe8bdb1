use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use metrics_exporter_prometheus::PrometheusBuilder;
use roster_api::{manifest_router, ManifestClient, DEFAULT_ENDPOINT, DEFAULT_USER_AGENT};
use roster_core::Manifest;
use roster_schema::parse_file;
use roster_store::Pool;
use serde_json::Value;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Manifests handled by the CLI keep their payloads untyped.
type Document = Manifest<Value, Value>;

#[derive(Parser, Debug)]
#[command(name = "rosterctl", version, about = "Roster manifest registry CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Decode manifest files and print their keys, labels and errors
    Inspect {
        /// YAML or JSON files
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Serve a pool over HTTP, logging every change
    Serve {
        /// Listen address
        #[arg(long = "addr", env = "ROSTER_ADDR", default_value = "127.0.0.1:8080")]
        addr: SocketAddr,
        /// Route to accept manifests on; the default accepts any apiVersion/kind
        #[arg(long = "path", default_value = "/{*resource}")]
        path: String,
        /// Manifest files to load before serving
        #[arg(long = "load")]
        load: Vec<PathBuf>,
    },
    /// Decode a manifest file and post it to a serving pool
    Send {
        file: PathBuf,
        #[arg(long = "endpoint", env = "ROSTER_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
        endpoint: String,
        #[arg(long = "user-agent", env = "ROSTER_USER_AGENT", default_value = DEFAULT_USER_AGENT)]
        user_agent: String,
    },
}

/// Logs go to stderr so `-o json` output stays machine-readable.
fn init_tracing() {
    let filter = EnvFilter::try_from_env("ROSTER_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

/// Prometheus exporter, only when `ROSTER_METRICS_ADDR` is set.
fn init_metrics() -> Option<SocketAddr> {
    let raw = std::env::var("ROSTER_METRICS_ADDR").ok()?;
    let Ok(addr) = raw.parse::<SocketAddr>() else {
        warn!(value = %raw, "ignoring ROSTER_METRICS_ADDR; expected host:port");
        return None;
    };
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => {
            info!(addr = %addr, "metrics exporter listening");
            Some(addr)
        }
        Err(e) => {
            warn!(error = %e, "metrics exporter not installed");
            None
        }
    }
}

fn load(path: &Path) -> Result<Document> {
    parse_file(path).with_context(|| format!("decoding {}", path.display()))
}

fn print_human(m: &Document) {
    println!("{}", m.key());
    for (k, v) in &m.metadata.labels {
        println!("  label {}={}", k, v);
    }
    for e in &m.errors {
        println!("  error: {}", e);
    }
}

fn print_manifest(output: Output, m: &Document) -> Result<()> {
    match output {
        Output::Human => print_human(m),
        Output::Json => println!("{}", serde_json::to_string_pretty(m)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let metrics_addr = init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Inspect { files } => {
            // Loading through a pool surfaces files that share a key.
            let pool: Pool<Value, Value> = Pool::new()?;
            let mut decoded = Vec::new();
            let mut failed = 0usize;
            for path in &files {
                match load(path) {
                    Ok(m) => {
                        let action = pool.apply_silent(m.clone());
                        if action == roster_core::Action::Updated {
                            warn!(file = %path.display(), key = %m.key(), "key already seen in an earlier file");
                        }
                        decoded.push(m);
                    }
                    Err(e) => {
                        failed += 1;
                        error!(error = ?e, "inspect failed");
                        eprintln!("inspect error: {:#}", e);
                    }
                }
            }
            match cli.output {
                Output::Human => decoded.iter().for_each(print_human),
                Output::Json => println!("{}", serde_json::to_string_pretty(&decoded)?),
            }
            info!(files = files.len(), distinct = pool.len(), failed, "inspect done");
            if failed > 0 {
                anyhow::bail!("{} of {} files could not be decoded", failed, files.len());
            }
        }
        Commands::Serve { addr, path, load: preload } => {
            let pool: Pool<Value, Value> = Pool::new()?;
            pool.listen(|_, action, m| {
                info!(action = %action, key = %m.key(), errors = m.errors.len(), "manifest changed");
            });
            for file in &preload {
                pool.apply_silent(load(file)?);
            }
            let app = manifest_router(&path, pool.clone());
            let listener = tokio::net::TcpListener::bind(addr).await.with_context(|| format!("binding {}", addr))?;
            info!(addr = %addr, path = %path, preloaded = pool.len(), metrics = ?metrics_addr, "serving manifests");
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    if signal::ctrl_c().await.is_ok() {
                        info!("Ctrl-C received; shutting down");
                    }
                })
                .await?;
            pool.settled().await;
            info!(manifests = pool.len(), "server stopped");
        }
        Commands::Send { file, endpoint, user_agent } => {
            let manifest = load(&file)?;
            let client = ManifestClient::new(endpoint, user_agent);
            info!(url = %client.url_for(&manifest), "send invoked");
            let reply = client.send(&manifest).await.with_context(|| format!("sending {}", file.display()))?;
            print_manifest(cli.output, &reply)?;
        }
    }
    Ok(())
}
