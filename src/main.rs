use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use phasegate::autonomy::AutonomyMode;
use phasegate::config;
use phasegate::logging;
use phasegate::phase::Phase;

mod cmd;

#[derive(Parser)]
#[command(name = "phasegate")]
#[command(version, about = "Checkpoint-driven multi-phase pipeline orchestrator")]
pub struct Cli {
    /// Debug logging for phasegate itself
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Project root (defaults to the current directory)
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the pipeline, resuming from the newest checkpoint if there is one
    Run {
        /// Ticket identifier passed to every phase
        #[arg(long)]
        ticket: Option<String>,

        /// checkpoint, batch or fully_autonomous
        #[arg(long)]
        autonomy: Option<AutonomyMode>,

        /// Start at this phase instead of the checkpoint's resume point
        #[arg(long)]
        from: Option<Phase>,

        /// Upstream artifact as <phase>=<path>; may be repeated
        #[arg(long = "artifact", value_name = "PHASE=PATH")]
        artifacts: Vec<String>,

        /// Ignore checkpoints and start from the first phase
        #[arg(long, conflicts_with_all = ["from", "artifacts"])]
        fresh: bool,
    },
    /// Inspect or remove checkpoints
    Checkpoints {
        #[command(subcommand)]
        command: CheckpointCommands,
    },
    /// Show configuration, phases and the resumable checkpoint
    Status,
}

#[derive(Subcommand, Clone)]
pub enum CheckpointCommands {
    /// List checkpoints, newest first
    List,
    /// Delete old checkpoints
    Clean {
        /// Age threshold in days (defaults to [checkpoints] warn_days)
        #[arg(long)]
        days: Option<i64>,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    // Only runs keep a log file; read-only commands leave the project untouched.
    let log_dir = config::log_dir(&project_dir);
    let is_run = matches!(cli.command, Commands::Run { .. });
    let _guard = logging::init(cli.verbose, is_run.then_some(log_dir.as_path()));

    match cli.command {
        Commands::Run {
            ticket,
            autonomy,
            from,
            artifacts,
            fresh,
        } => {
            let args = cmd::RunArgs {
                ticket,
                autonomy,
                from,
                artifacts,
                fresh,
            };
            cmd::cmd_run(&project_dir, args).await?;
        }
        Commands::Checkpoints { command } => match command {
            CheckpointCommands::List => cmd::cmd_checkpoints_list(&project_dir)?,
            CheckpointCommands::Clean { days, yes } => {
                cmd::cmd_checkpoints_clean(&project_dir, days, yes)?
            }
        },
        Commands::Status => cmd::cmd_status(&project_dir)?,
    }

    Ok(())
}
