use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use veco_miner::chain::JsonRpcClient;
use veco_miner::config::{Config, MAX_THREADS};
use veco_miner::miner::{MiningEngine, Sha256d};
use veco_miner::orchestrator::MiningOrchestrator;

const MAX_BENCH_MILLIS: u64 = 600_000;

#[derive(Parser)]
#[command(name = "veco-miner")]
#[command(about = "Solo miner for a full node's JSON-RPC interface", version)]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mine against a node until interrupted
    Mine(MineArgs),

    /// Generate a default configuration file
    Init {
        /// Output path for config file
        #[arg(short, long, default_value = "config.toml")]
        output: String,
    },

    /// Measure local hash rate
    Bench {
        /// Number of threads to use (default: all cores)
        #[arg(short, long)]
        threads: Option<usize>,

        /// Benchmark duration in milliseconds
        #[arg(long, default_value = "5000")]
        millis: u64,
    },
}

#[derive(Args)]
struct MineArgs {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// RPC username
    #[arg(short = 'u', long)]
    user: Option<String>,

    /// RPC password
    #[arg(short = 'p', long, env = "VECO_RPC_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// RPC host
    #[arg(long)]
    host: Option<String>,

    /// RPC port
    #[arg(long)]
    port: Option<u16>,

    /// Address that receives block rewards
    #[arg(short, long)]
    address: Option<String>,

    /// Connect over https
    #[arg(short = 's', long)]
    tls: bool,

    /// Number of mining threads
    #[arg(short, long)]
    threads: Option<usize>,

    /// Fixed iterations per thread per round (disables calibration)
    #[arg(short, long)]
    iterations: Option<u64>,

    /// Target duration of one round in seconds
    #[arg(long)]
    round_secs: Option<u64>,
}

impl MineArgs {
    fn apply(self, config: &mut Config) {
        if let Some(user) = self.user {
            config.rpc.username = user;
        }
        if let Some(password) = self.password {
            config.rpc.password = password;
        }
        if let Some(host) = self.host {
            config.rpc.host = host;
        }
        if let Some(port) = self.port {
            config.rpc.port = port;
        }
        if let Some(address) = self.address {
            config.miner.address = address;
        }
        if self.tls {
            config.rpc.tls = true;
        }
        if let Some(threads) = self.threads {
            config.miner.threads = threads;
        }
        if self.iterations.is_some() {
            config.miner.iterations_per_thread = self.iterations;
        }
        if let Some(secs) = self.round_secs {
            config.miner.target_round_secs = secs;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.debug { "veco_miner=debug" } else { "veco_miner=info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Mine(args) => run_mine(args).await?,
        Commands::Init { output } => {
            let config = Config::default();
            config.save(&output)?;
            info!("Configuration file created at: {}", output);
        }
        Commands::Bench { threads, millis } => run_bench(threads, millis).await?,
    }

    Ok(())
}

async fn run_mine(args: MineArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    args.apply(&mut config);
    config.validate().context("invalid configuration")?;

    let client = JsonRpcClient::new(config.client_config())?;
    info!("Mining to {} via {}", config.miner.address, client.url());

    let shutdown = CancellationToken::new();
    let mut orchestrator = MiningOrchestrator::new(
        config.orchestrator_config(),
        Arc::new(client),
        Sha256d,
        shutdown.clone(),
    )?;

    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown.cancel();
    });

    orchestrator.run().await?;
    Ok(())
}

async fn run_bench(threads: Option<usize>, millis: u64) -> Result<()> {
    let threads = threads.unwrap_or_else(num_cpus::get);
    if threads == 0 || threads > MAX_THREADS {
        bail!("Thread count must be between 1 and {}", MAX_THREADS);
    }
    if millis == 0 || millis > MAX_BENCH_MILLIS {
        bail!("Benchmark duration must be between 1 and {} ms", MAX_BENCH_MILLIS);
    }

    let engine = MiningEngine::new(threads, Sha256d)?;
    let report = tokio::task::spawn_blocking(move || engine.benchmark(Duration::from_millis(millis))).await??;

    info!("Threads: {}", report.threads);
    info!("Hashes: {}", report.hashes);
    info!(
        "Hash rate: {:.2} H/s ({:.2} MH/s), {:.2} H/s per thread",
        report.hashrate(),
        report.hashrate() / 1_000_000.0,
        report.per_thread_hashrate()
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}
