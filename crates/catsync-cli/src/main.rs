use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use catsync_storage::StateStore;
use catsync_sync::{
    config::write_sample_config, convert_file, state_summary, AppConfig, Orchestrator, DEFAULT_CONFIG_PATH,
};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Parser)]
#[command(name = "catsync")]
#[command(about = "Supplier catalog converter and storefront sync")]
struct Cli {
    /// Default log filter when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Convert a supplier feed into the marketplace feed
    Convert {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        /// Expand color x size variants
        #[arg(long)]
        variant_mode: bool,
    },
    /// Run one sync cycle
    Sync {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Sync periodically until interrupted
    Daemon {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print the sync state summary as JSON
    Status {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Write a sample config file
    InitConfig {
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        path: PathBuf,
    },
}

fn init_tracing(default_level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match cli.command {
        Commands::Convert {
            input,
            output,
            config,
            variant_mode,
        } => {
            let mut config = AppConfig::load_or_default(config.as_deref())?;
            config.transform.variant_mode |= variant_mode;
            let summary = convert_file(&input, &output, &config.transform).await?;
            for issue in &summary.validation_issues {
                eprintln!("skipped: {issue}");
            }
            for warning in &summary.warnings {
                eprintln!("warning: {warning}");
            }
            println!(
                "converted {} products ({} variants, {} excluded, {} skipped) -> {}",
                summary.products,
                summary.variants,
                summary.excluded,
                summary.validation_issues.len(),
                output.display()
            );
        }
        Commands::Sync { config } => {
            let config = AppConfig::load_or_default(config.as_deref())?;
            let mut orchestrator = Orchestrator::from_config(&config)?;
            let report = orchestrator.run_cycle().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.halted {
                anyhow::bail!("error budget exhausted; sync halted");
            }
        }
        Commands::Daemon { config } => {
            let config = AppConfig::load_or_default(config.as_deref())?;
            let mut orchestrator = Orchestrator::from_config(&config)?;
            let (stop_tx, stop_rx) = watch::channel(false);
            tokio::spawn(async move {
                wait_for_shutdown().await;
                info!("stop requested; finishing current cycle");
                let _ = stop_tx.send(true);
            });
            let cycles = orchestrator.run_daemon(stop_rx).await?;
            println!("{}", serde_json::to_string_pretty(&orchestrator.status())?);
            info!(cycles, "daemon exited");
        }
        Commands::Status { config } => {
            let config = AppConfig::load_or_default(config.as_deref())?;
            let summary = state_summary(&StateStore::new(config.sync.state_file_path.clone())).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::InitConfig { path } => {
            init_config(&path)?;
            println!("wrote {}", path.display());
        }
    }

    Ok(())
}

fn init_config(path: &Path) -> Result<()> {
    write_sample_config(path).with_context(|| format!("initializing {}", path.display()))
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(err) => warn!(error = %err, "cannot listen for SIGTERM; only Ctrl-C stops the daemon"),
        }
    }
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}
