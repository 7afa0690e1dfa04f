//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

/// JobDaemon - reliability plane for long-running multi-agent jobs
#[derive(Parser)]
#[command(
    name = "jd",
    about = "Run, resume and inspect long-running multi-agent pipeline jobs",
    version = env!("CARGO_PKG_VERSION"),
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Submit a pipeline job and run it in the foreground (Ctrl-C cancels)
    Submit {
        /// Job config file (YAML or JSON) with at least `task`
        #[arg(value_name = "CONFIG")]
        file: PathBuf,

        /// Job name, overriding the config's `name`
        #[arg(short, long)]
        name: Option<String>,

        /// Stop the job after this many seconds
        #[arg(long)]
        max_runtime_secs: Option<u64>,
    },

    /// List jobs, newest first
    List {
        /// Filter by status (queued, running, completed, failed, cancelled)
        #[arg(short, long)]
        status: Option<String>,

        /// Maximum number of jobs to show
        #[arg(short = 'n', long)]
        limit: Option<usize>,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Show one job and the tail of its log
    Show {
        /// Job ID (or unique partial match)
        id: String,

        /// Number of log lines to show
        #[arg(short = 'n', long, default_value = "20")]
        lines: usize,
    },

    /// Start a new job that continues an earlier job's run from its checkpoint
    Resume {
        /// Job ID (or unique partial match)
        id: String,
    },

    /// List saved checkpoints
    Checkpoints {
        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Mark jobs left running by a dead process as failed
    Recover,
}

/// Get the log file path
pub fn get_log_path() -> PathBuf {
    debug!("get_log_path: called");
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("jobdaemon")
        .join("logs")
        .join("jobdaemon.log")
}

/// Generate the after_help text
pub fn generate_after_help() -> String {
    format!("Logs are written to: {}\n", get_log_path().display())
}

/// Output format for list commands
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        debug!(%s, "OutputFormat::from_str: called");
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {}. Use: text or json", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}
