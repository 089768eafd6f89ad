#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use vectra_core::{Result, ServiceConfig};
use vectra_engine::{training, Registry};

mod http;

#[derive(Parser, Debug)]
#[command(name = "vectra", version, about = "Segmented vector-search engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the service.
    Run {
        /// Listen address; overrides the config file.
        #[arg(long)]
        host: Option<String>,
        /// Listen port; overrides the config file.
        #[arg(long)]
        port: Option<u16>,
        /// Path to a vectra.toml config file.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Internal: train one segment's index, then exit. Spawned by the
    /// server; the exit code reports the failure stage.
    Train {
        #[arg(long)]
        segment_dir: PathBuf,
        /// 0 uses all cores.
        #[arg(long, default_value_t = 0)]
        threads: usize,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(unix)]
fn ignore_sigpipe() {
    // The engine's worker threads write on sockets the peer may have
    // closed; delivery as EPIPE is what we want, not process death.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

#[cfg(not(unix))]
fn ignore_sigpipe() {}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Commands::Train {
            segment_dir,
            threads,
        } => {
            std::process::exit(training::run(&segment_dir, threads));
        }
        Commands::Run { host, port, config } => {
            ignore_sigpipe();
            let mut config = ServiceConfig::load(config.as_deref())?;
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(run_server(config))
        }
    }
}

async fn run_server(config: ServiceConfig) -> Result<()> {
    let registry = Registry::new(&config);
    registry.load_all().await?;
    info!(
        collections = registry.len(),
        data_path = %config.data_path.display(),
        "registry loaded"
    );

    let addr = format!("{}:{}", config.host, config.port);
    http::serve(registry, &addr).await
}
