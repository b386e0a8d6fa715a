#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions
)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use helmsman::approval::CliApprovalBroker;
use helmsman::plan::Plan;
use helmsman::tools::DryRunInvoker;
use helmsman::{Config, Session};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// `helmsman` - supervised execution of multi-step agent plans.
#[derive(Parser, Debug)]
#[command(name = "helmsman")]
#[command(version = "0.1.0")]
#[command(about = "Run agent plans under breakpoints, approvals and snapshots.", long_about = None)]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (default: ~/.helmsman/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a plan with dry-run tools and interactive approvals
    Run {
        /// Plan file (JSON)
        plan: PathBuf,
    },

    /// Validate a plan file without running it
    Validate {
        /// Plan file (JSON)
        plan: PathBuf,
    },
}

fn read_plan(path: &Path) -> Result<Plan> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read plan: {}", path.display()))?;
    let plan: Plan = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse plan: {}", path.display()))?;
    plan.validate()?;
    Ok(plan)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load_or_init()?,
    };
    config.apply_env_overrides();

    match cli.command {
        Commands::Validate { plan } => {
            let plan = read_plan(&plan)?;
            println!("plan ok: {} step(s)", plan.len());
            Ok(())
        }
        Commands::Run { plan } => {
            let plan = read_plan(&plan)?;
            let timeout = Duration::from_secs(config.approval.timeout_secs);
            let mut session = Session::builder(config)
                .invoker(Arc::new(DryRunInvoker))
                .broker(Arc::new(CliApprovalBroker::new(timeout)))
                .build()?;

            let handle = session.handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupt received, aborting");
                    handle.abort();
                }
            });

            let outcome = session.start(plan).await?;
            session.end_session();
            println!("{}", serde_json::to_string_pretty(&outcome.report)?);
            if let Some(error) = outcome.error {
                anyhow::bail!(error);
            }
            Ok(())
        }
    }
}
