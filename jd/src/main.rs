//! JobDaemon - reliability plane for long-running multi-agent jobs
//!
//! CLI entry point: submit, resume and inspect pipeline jobs.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{CommandFactory, FromArgMatches};
use colored::Colorize;
use eyre::{Context, Result, bail, eyre};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use jobdaemon::cli::{Cli, Command, OutputFormat, generate_after_help};
use jobdaemon::config::Config;
use jobdaemon::llm::{LlmClient, ReplayClient, create_client};
use jobdaemon::{
    BreakerRegistry, CheckpointStore, Job, JobFilter, JobManager, JobStatus, PipelineRunner, WriteQueue, jobs,
};
use knowledgestore::SqliteStore;

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    // Logging isn't initialized yet, so nothing here can be traced
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("jobdaemon")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    // Priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let log_file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("jobdaemon.log"))
        .context("Failed to open log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cmd = Cli::command().after_help(generate_after_help());
    let cli = Cli::from_arg_matches(&cmd.get_matches())?;

    // Log level comes from the config file before the full config load
    let config_log_level = Config::load_log_level(cli.config.as_ref());
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    info!(state_dir = %config.storage.state_dir.display(), "JobDaemon loaded config");

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Submit {
            file,
            name,
            max_runtime_secs,
        } => cmd_submit(&config, &file, name, max_runtime_secs).await,
        Command::List { status, limit, format } => cmd_list(&config, status.as_deref(), limit, format).await,
        Command::Show { id, lines } => cmd_show(&config, &id, lines).await,
        Command::Resume { id } => cmd_resume(&config, &id).await,
        Command::Checkpoints { format } => cmd_checkpoints(&config, format),
        Command::Recover => cmd_recover(&config).await,
    }
}

/// Every long-lived component, wired once per process
struct Runtime {
    manager: JobManager,
    writes: WriteQueue,
}

impl Runtime {
    fn open(config: &Config) -> Result<Self> {
        debug!("Runtime::open: called");
        let state_dir = &config.storage.state_dir;
        fs::create_dir_all(state_dir).context(format!("Failed to create state dir {}", state_dir.display()))?;

        let db_path = config.storage.knowledge_db_path();
        let store = SqliteStore::open(&db_path).context(format!("Failed to open knowledge store {}", db_path.display()))?;
        let writes = WriteQueue::start(Box::new(store), config.write_queue_config());

        let runner = PipelineRunner::new(
            config.pipeline_settings(),
            build_llm(config)?,
            Arc::new(BreakerRegistry::new(config.breaker_config())),
            writes.clone(),
            CheckpointStore::new(config.storage.checkpoints_dir()),
        );
        let manager = JobManager::open(state_dir, Arc::new(runner)).context("Failed to open job manager")?;
        Ok(Self { manager, writes })
    }

    async fn close(self, config: &Config) {
        debug!("Runtime::close: called");
        self.manager.shutdown(config.jobs.shutdown_timeout()).await;
        let stats = self.writes.stop(config.write_queue.stop_timeout()).await;
        info!(?stats, "Write queue stopped");
        if stats.dropped > 0 {
            eprintln!(
                "{} {} knowledge store write(s) were dropped; see {}",
                "warning:".yellow(),
                stats.dropped,
                jobdaemon::cli::get_log_path().display()
            );
        }
    }
}

/// The configured model client
///
/// With the replay provider and no `llm.replay-file`, jobs must bring their
/// own `replay_file`; the shared client then has nothing to serve.
fn build_llm(config: &Config) -> Result<Arc<dyn LlmClient>> {
    if config.llm.provider == "replay" && config.llm.replay_file.is_none() {
        warn!("No llm.replay-file configured; jobs must set replay_file");
        return Ok(Arc::new(ReplayClient::new(Vec::new(), config.llm.model.clone())));
    }
    create_client(&config.llm).context("Failed to create LLM client")
}

fn read_job_config(path: &Path) -> Result<Value> {
    let content = fs::read_to_string(path).context(format!("Failed to read job config {}", path.display()))?;
    // YAML is a superset of JSON, so one parser covers both
    let value: Value = serde_yaml::from_str(&content).context(format!("Failed to parse job config {}", path.display()))?;
    if !value.is_object() {
        bail!("Job config {} must be a mapping", path.display());
    }
    Ok(value)
}

async fn cmd_submit(config: &Config, file: &Path, name: Option<String>, max_runtime_secs: Option<u64>) -> Result<()> {
    debug!(file = %file.display(), ?name, ?max_runtime_secs, "cmd_submit: called");
    let mut job_config = read_job_config(file)?;
    if let Some(name) = name {
        job_config["name"] = json!(name);
    }
    if let Some(secs) = max_runtime_secs {
        job_config["max_runtime_secs"] = json!(secs);
    }

    let rt = Runtime::open(config)?;
    let stats = rt.manager.recover();
    if stats.interrupted > 0 {
        println!("Recovered {} interrupted job(s) as failed", stats.interrupted);
    }

    let job = rt.manager.create(job_config);
    println!("Submitted {} ({})", job.id.bold(), job.name());
    run_foreground(config, rt, &job.id).await
}

async fn cmd_resume(config: &Config, reference: &str) -> Result<()> {
    debug!(%reference, "cmd_resume: called");
    let rt = Runtime::open(config)?;
    rt.manager.recover();

    let id = rt.manager.resolve(reference)?;
    let job = rt.manager.resume(&id)?;
    println!("Resuming run {} as {}", job.run_id.bold(), job.id.bold());
    run_foreground(config, rt, &job.id).await
}

/// Start `id`, wait for it, and turn Ctrl-C into a cancellation request
async fn run_foreground(config: &Config, rt: Runtime, id: &str) -> Result<()> {
    debug!(%id, "run_foreground: called");
    if !rt.manager.start(id) {
        warn!(job_id = %id, "Job did not start");
    }

    let job = tokio::select! {
        job = rt.manager.wait(id) => job,
        _ = tokio::signal::ctrl_c() => {
            println!("\nCancelling {} (waiting for the current iteration)...", id);
            rt.manager.cancel(id);
            rt.manager.wait(id).await
        }
    };
    rt.close(config).await;

    let job = job.ok_or_else(|| eyre!("Job {} disappeared", id))?;
    print_outcome(&job);
    match job.status {
        JobStatus::Failed => Err(eyre!("Job {} failed: {}", job.id, job.error.as_deref().unwrap_or("unknown error"))),
        _ => Ok(()),
    }
}

fn colored_status(status: JobStatus) -> colored::ColoredString {
    let text = status.to_string();
    match status {
        JobStatus::Queued => text.normal(),
        JobStatus::Running => text.cyan(),
        JobStatus::Completed => text.green(),
        JobStatus::Failed => text.red(),
        JobStatus::Cancelled => text.yellow(),
    }
}

fn print_outcome(job: &Job) {
    println!("{} {}", job.id.bold(), colored_status(job.status));
    if let Some(summary) = &job.result_summary {
        if summary.get("outcome").and_then(Value::as_str) == Some("retry_loop_aborted") {
            println!("  {} {}", "retry loop:".yellow(), summary["abort_reason"].as_str().unwrap_or(""));
        }
        println!("  iterations: {}", summary["iterations"]);
        println!("  cost: ${:.4}", summary["cost_usd"].as_f64().unwrap_or(0.0));
        if let Some(files) = summary["files_written"].as_array() {
            println!("  files written: {}", files.len());
        }
    }
    if let Some(error) = &job.error {
        println!("  {} {}", "error:".red(), error);
    }
    println!("  log: {}", job.logs_path.display());
}

async fn cmd_list(config: &Config, status: Option<&str>, limit: Option<usize>, format: OutputFormat) -> Result<()> {
    debug!(?status, ?limit, %format, "cmd_list: called");
    let filter = JobFilter {
        status: status.map(str::parse::<JobStatus>).transpose().map_err(|e: String| eyre!(e))?,
        text: None,
    };

    let rt = Runtime::open(config)?;
    let jobs = rt.manager.list(&filter, limit);
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&jobs)?),
        OutputFormat::Text => {
            if jobs.is_empty() {
                println!("No jobs");
            }
            for job in &jobs {
                println!(
                    "{:<40} {:<10} {:<24} {}",
                    job.id,
                    colored_status(job.status),
                    job.created_at.format("%Y-%m-%d %H:%M:%S"),
                    job.name()
                );
            }
        }
    }
    rt.close(config).await;
    Ok(())
}

async fn cmd_show(config: &Config, reference: &str, lines: usize) -> Result<()> {
    debug!(%reference, lines, "cmd_show: called");
    let rt = Runtime::open(config)?;
    let shown = rt
        .manager
        .resolve(reference)
        .map_err(eyre::Report::from)
        .and_then(|id| rt.manager.get(&id).ok_or_else(|| eyre!("Job not found: {}", id)));
    rt.close(config).await;
    let job = shown?;

    println!("{}", serde_json::to_string_pretty(&job)?);
    let tail = jobs::tail(&job.logs_path, lines);
    if !tail.is_empty() {
        println!("\n{}", format!("--- {} (last {} lines) ---", job.logs_path.display(), tail.len()).dimmed());
        for line in tail {
            println!("{}", line);
        }
    }
    Ok(())
}

fn cmd_checkpoints(config: &Config, format: OutputFormat) -> Result<()> {
    debug!(%format, "cmd_checkpoints: called");
    let store = CheckpointStore::new(config.storage.checkpoints_dir());
    let checkpoints = store.list();
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&checkpoints)?),
        OutputFormat::Text => {
            if checkpoints.is_empty() {
                println!("No checkpoints in {}", store.dir().display());
            }
            for cp in &checkpoints {
                println!(
                    "{:<40} iteration {:<4} {:<8} ${:<8.4} {}",
                    cp.run_id,
                    cp.iteration_index,
                    cp.last_status,
                    cp.cost_accumulated,
                    cp.saved_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
    }
    Ok(())
}

async fn cmd_recover(config: &Config) -> Result<()> {
    debug!("cmd_recover: called");
    let rt = Runtime::open(config)?;
    let stats = rt.manager.recover();
    rt.close(config).await;
    println!(
        "Recovered {} interrupted job(s); {} queued, {} finished",
        stats.interrupted, stats.queued, stats.terminal
    );
    Ok(())
}
