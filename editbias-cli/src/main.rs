//! editbias CLI: run, resume, and analyze image-editing bias audits.

mod commands;

use clap::Parser;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// editbias: audit image-editing models for attribute-conditioned refusal and erasure
#[derive(Parser, Debug)]
#[command(name = "editbias", version, about, long_about = None)]
pub(crate) struct Cli {
    /// Workspace directory
    #[arg(short, long, default_value = ".", global = true)]
    workspace: PathBuf,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
pub(crate) enum Commands {
    /// Run (or resume) a full audit: synthesize, dispatch, evaluate, analyze
    Run {
        /// Reuse a run id to resume an interrupted run
        #[arg(long)]
        run_id: Option<String>,

        /// Use the scripted in-memory backend and judges instead of real adapters
        #[arg(long)]
        dry_run: bool,
    },
    /// Run Stage I only and print the accepted prompts as JSON Lines
    Synthesize {
        /// Write prompts here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Recompute the report for an existing run directory
    Analyze {
        #[arg(long)]
        run_dir: PathBuf,

        /// Use the current stats settings instead of the run's snapshot
        #[arg(long)]
        current_stats: bool,
    },
    /// Show the human-review queue of a run
    Review {
        #[arg(long)]
        run_dir: PathBuf,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
pub(crate) enum ConfigAction {
    /// Create a default configuration file in the workspace
    Init,
    /// Show the merged configuration
    Show,
}

/// Install the stderr layer and a daily-rolling JSON file layer under `log_dir`.
pub(crate) fn init_tracing(verbose: u8, quiet: bool, log_dir: &Path) -> Option<WorkerGuard> {
    let filter = match verbose {
        0 if quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(env_filter);

    let (json_layer, guard) = match std::fs::create_dir_all(log_dir) {
        Ok(()) => {
            let file_appender = tracing_appender::rolling::daily(log_dir, "editbias.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(EnvFilter::new("debug"));
            (Some(layer), Some(guard))
        }
        Err(e) => {
            eprintln!("Cannot create log directory {}: {e}", log_dir.display());
            (None, None)
        }
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();
    guard
}

/// Log directory for commands that don't belong to a run.
pub(crate) fn default_log_dir() -> PathBuf {
    directories::ProjectDirs::from("dev", "editbias", "editbias")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from(".editbias/logs"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    commands::handle_command(cli, &workspace).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_with_global_flags() {
        let cli = Cli::parse_from(["editbias", "run", "--run-id", "r1", "--dry-run", "-vv"]);
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Run { run_id, dry_run } => {
                assert_eq!(run_id.as_deref(), Some("r1"));
                assert!(dry_run);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_analyze_requires_run_dir() {
        assert!(Cli::try_parse_from(["editbias", "analyze"]).is_err());
        let cli = Cli::parse_from([
            "editbias",
            "-c",
            "audit.toml",
            "analyze",
            "--run-dir",
            "runs/r1",
        ]);
        assert_eq!(cli.config, Some(PathBuf::from("audit.toml")));
        assert!(matches!(cli.command, Commands::Analyze { .. }));
    }
}
