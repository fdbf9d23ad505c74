//! Backstop -- collapse a controller cluster to its surviving member.
//!
//! Run on the one controller machine that is still alive, with its agents
//! stopped. Every run re-reads state from disk, so an interrupted run is
//! simply run again.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::time::Instant;
use tracing::{error, info};

use backstop::cluster::NodeManager;
use backstop::config::{self, AgentTag};
use backstop::confirm::{confirm, RECOVERY_PROMPT};
use backstop::errors::BackstopError;
use backstop::report;

/// Log output format.
#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Command-line arguments for backstop.
#[derive(Parser, Debug)]
#[command(
    name = "backstop",
    version,
    about = "Collapse a raft-backed controller cluster to its surviving member"
)]
struct Cli {
    /// Agent tag of this machine, e.g. machine-0.
    tag: String,

    /// Skip the confirmation prompt.
    #[arg(short, long)]
    yes: bool,

    /// Base data directory holding the agents' configuration.
    #[arg(long, default_value = config::DEFAULT_DATA_DIR)]
    path: PathBuf,

    /// Seconds allowed for each step that reads consensus state.
    #[arg(long, default_value_t = 10)]
    timeout: u64,

    /// Report what would change without writing anything.
    #[arg(long)]
    dry_run: bool,

    /// Also rewrite this node's own record to the survivor.
    #[arg(long)]
    rewrite_info: bool,

    /// Log level used when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

/// Number of steps the overall deadline has to cover.
const DEADLINE_STEPS: u32 = 5;

fn init_tracing(level: &str, format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn run(cli: &Cli) -> Result<(), BackstopError> {
    let tag: AgentTag = cli.tag.parse()?;
    let path = config::config_path(&cli.path, &tag);
    info!("Loading agent configuration from {}", path.display());
    let agent = config::read_config(&path)?;
    let advertised = agent.api_addresses()?;

    let step_timeout = Duration::from_secs(cli.timeout);
    let deadline = Instant::now() + step_timeout * DEADLINE_STEPS;
    let manager = NodeManager::from_config(&agent).with_step_timeout(step_timeout);
    info!(
        data_dir = %manager.data_dir().display(),
        advertised = advertised.len(),
        dry_run = cli.dry_run,
        "starting recovery"
    );

    let outcome = if cli.dry_run {
        manager.plan(&advertised, deadline).await?
    } else {
        manager.recover(&advertised, deadline).await?
    };

    // Report what was applied before the optional rewrite, which can fail.
    print!("{}", report::render(&outcome, &tag.to_string()));

    if cli.rewrite_info {
        manager.rewrite_node_info(&outcome).await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_format);

    if !cli.dry_run {
        match confirm(cli.yes, RECOVERY_PROMPT) {
            Ok(true) => {}
            Ok(false) => {
                eprintln!("Aborted.");
                return ExitCode::SUCCESS;
            }
            Err(e) => {
                eprintln!("{e}");
                return ExitCode::from(1);
            }
        }
    }

    match run(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(code = e.code(), "{e}");
            eprintln!("backstop: {e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}
