//! PipelineRunner - drives the agent iteration loop for one job

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use eyre::{Context, Result, eyre};
use knowledgestore::{RunRecord, Snapshot};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::breaker::{BreakerError, BreakerRegistry};
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::jobs::{CancelReason, JobContext, JobOutcome, JobRunner};
use crate::llm::{CompletionRequest, CompletionResponse, LlmClient, Message, ReplayClient};
use crate::persist::{atomic_write, file_stem};
use crate::retry::{RetryLoopDetector, is_pass_status};
use crate::writes::{WriteOp, WriteOperation, WriteQueue};

use super::config::{DEFAULT_SYSTEM_PROMPT, PipelineJobConfig, PipelineSettings};
use super::report::{FileOutput, StepReport};

/// Why a model call did not produce a response
enum CallError {
    Cancelled(CancelReason),
    Failed(eyre::Report),
}

/// Progress of one run, restored from and saved to its checkpoint
struct RunState {
    run_id: String,
    iteration: u32,
    files_written: BTreeSet<String>,
    cost: f64,
    last_status: String,
    last_feedback: Value,
    resumed_from: Option<u32>,
    failed_writes: Arc<AtomicU64>,
}

impl RunState {
    fn fresh(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            iteration: 0,
            files_written: BTreeSet::new(),
            cost: 0.0,
            last_status: String::new(),
            last_feedback: Value::Null,
            resumed_from: None,
            failed_writes: Arc::new(AtomicU64::new(0)),
        }
    }

    fn resumed(checkpoint: &Checkpoint) -> Self {
        Self {
            run_id: checkpoint.run_id.clone(),
            iteration: checkpoint.iteration_index,
            files_written: checkpoint.files_written.clone(),
            cost: checkpoint.cost_accumulated,
            last_status: checkpoint.last_status.clone(),
            last_feedback: checkpoint.notes.get("last_feedback").cloned().unwrap_or(Value::Null),
            resumed_from: Some(checkpoint.iteration_index),
            failed_writes: Arc::new(AtomicU64::new(0)),
        }
    }

    fn summary(&self) -> Value {
        json!({
            "run_id": self.run_id,
            "iterations": self.iteration,
            "files_written": self.files_written,
            "cost_usd": self.cost,
            "last_status": self.last_status,
            "failed_writes": self.failed_writes.load(Ordering::Relaxed),
            "resumed_from": self.resumed_from,
        })
    }
}

/// The [`JobRunner`] for research pipeline jobs
///
/// Shares one model client, breaker registry, write queue and checkpoint
/// directory across every job the manager starts.
pub struct PipelineRunner {
    settings: PipelineSettings,
    llm: Arc<dyn LlmClient>,
    breakers: Arc<BreakerRegistry>,
    writes: WriteQueue,
    checkpoints: CheckpointStore,
}

impl PipelineRunner {
    pub fn new(
        settings: PipelineSettings,
        llm: Arc<dyn LlmClient>,
        breakers: Arc<BreakerRegistry>,
        writes: WriteQueue,
        checkpoints: CheckpointStore,
    ) -> Self {
        debug!(llm = %llm.name(), ?settings, "PipelineRunner::new: called");
        Self {
            settings,
            llm,
            breakers,
            writes,
            checkpoints,
        }
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    fn client_for(&self, job: &PipelineJobConfig) -> Result<Arc<dyn LlmClient>> {
        match &job.replay_file {
            Some(path) => {
                debug!(path = %path.display(), "PipelineRunner::client_for: per-job replay client");
                let client = ReplayClient::from_file(path, "replay")
                    .wrap_err_with(|| format!("Failed to load replay file {}", path.display()))?;
                Ok(Arc::new(client))
            }
            None => Ok(self.llm.clone()),
        }
    }

    fn output_dir(&self, job: &PipelineJobConfig, run_id: &str) -> PathBuf {
        job.output_dir
            .clone()
            .unwrap_or_else(|| self.settings.outputs_dir.join(file_stem(run_id)))
    }

    fn build_request(&self, job: &PipelineJobConfig, state: &RunState, iteration: u32, max: u32) -> CompletionRequest {
        let mut prompt = format!("Task:\n{}\n\nIteration {} of {}.", job.task.trim(), iteration, max);
        if !state.files_written.is_empty() {
            let files: Vec<&str> = state.files_written.iter().map(String::as_str).collect();
            prompt.push_str(&format!("\n\nFiles already written: {}", files.join(", ")));
        }
        if !state.last_feedback.is_null() {
            let feedback =
                serde_json::to_string_pretty(&state.last_feedback).unwrap_or_else(|_| state.last_feedback.to_string());
            prompt.push_str(&format!(
                "\n\nReview feedback from the previous iteration ({}):\n{}",
                state.last_status, feedback
            ));
        }

        CompletionRequest {
            system_prompt: job
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            messages: vec![Message::user(prompt)],
            max_tokens: self.settings.max_tokens,
        }
    }

    /// Call the model through its circuit breaker
    ///
    /// An open breaker is waited out, at most `max_breaker_waits` times.
    /// Retryable model errors are retried up to `max_call_retries` times.
    /// Both waits end early on cancellation.
    async fn call_model(
        &self,
        ctx: &JobContext,
        llm: &Arc<dyn LlmClient>,
        request: &CompletionRequest,
    ) -> std::result::Result<CompletionResponse, CallError> {
        let breaker = self.breakers.get(llm.name());
        let mut breaker_waits = 0u32;
        let mut retries = 0u32;

        loop {
            ctx.cancel.check().map_err(CallError::Cancelled)?;

            let req = request.clone();
            match breaker.call(|| llm.complete(req)).await {
                Ok(response) => return Ok(response),
                Err(BreakerError::Open { name, retry_after }) => {
                    breaker_waits += 1;
                    if breaker_waits > self.settings.max_breaker_waits {
                        return Err(CallError::Failed(eyre!(
                            "circuit breaker '{}' still open after {} waits",
                            name,
                            self.settings.max_breaker_waits
                        )));
                    }
                    warn!(job_id = %ctx.job_id, breaker = %name, ?retry_after, "Circuit open, waiting");
                    ctx.log.warn(format!("circuit '{}' open, waiting {:?}", name, retry_after));
                    ctx.cancel
                        .sleep(retry_after.max(Duration::from_millis(10)))
                        .await
                        .map_err(CallError::Cancelled)?;
                }
                Err(BreakerError::Inner(e)) if e.is_retryable() && retries < self.settings.max_call_retries => {
                    retries += 1;
                    let delay = e.retry_after().unwrap_or(self.settings.retry_delay);
                    warn!(job_id = %ctx.job_id, error = %e, attempt = retries, "Retryable model error");
                    ctx.log.warn(format!("model call failed ({}), retry {} in {:?}", e, retries, delay));
                    ctx.cancel.sleep(delay).await.map_err(CallError::Cancelled)?;
                }
                Err(BreakerError::Inner(e)) => {
                    return Err(CallError::Failed(eyre::Report::new(e).wrap_err("Model call failed")));
                }
            }
        }
    }

    /// Write report files that were not written on an earlier iteration
    fn write_files(&self, ctx: &JobContext, output_dir: &Path, files: &[FileOutput], state: &mut RunState) -> Result<()> {
        for file in files {
            let Some(rel) = normalize_relative(&file.path) else {
                warn!(job_id = %ctx.job_id, path = %file.path, "Refusing output path");
                ctx.log.warn(format!("refused output path '{}'", file.path));
                continue;
            };
            if state.files_written.contains(&rel) {
                debug!(path = %rel, "PipelineRunner::write_files: already written, skipping");
                continue;
            }
            let target = output_dir.join(&rel);
            atomic_write(&target, file.content.as_bytes())?;
            ctx.log.info(format!("wrote {}", target.display()));
            state.files_written.insert(rel);
        }
        Ok(())
    }

    async fn enqueue(&self, ctx: &JobContext, op: WriteOp, failed: &Arc<AtomicU64>) {
        let failed = failed.clone();
        let job_id = ctx.job_id.clone();
        let operation = WriteOperation::with_callback(op, move |result| {
            if let Err(e) = result {
                warn!(%job_id, error = %e, "Knowledge store write dropped");
                failed.fetch_add(1, Ordering::Relaxed);
            }
        });
        if let Err(e) = self.writes.enqueue(operation).await {
            ctx.log.warn(format!("write not queued: {}", e));
        }
    }

    async fn record_writes(&self, ctx: &JobContext, report: &StepReport, iteration: u32, cost: f64, state: &RunState) {
        for entity in &report.entities {
            self.enqueue(ctx, WriteOp::AddEntity(entity.clone()), &state.failed_writes).await;
        }
        for rel in &report.relationships {
            self.enqueue(ctx, WriteOp::AddRelationship(rel.clone()), &state.failed_writes).await;
        }
        let record = RunRecord {
            run_id: state.run_id.clone(),
            iteration,
            status: report.status.clone(),
            cost,
            detail: json!({
                "job_id": ctx.job_id,
                "feedback": report.feedback,
                "files": report.files.iter().map(|f| f.path.as_str()).collect::<Vec<_>>(),
            }),
        };
        self.enqueue(ctx, WriteOp::LogRun(record), &state.failed_writes).await;
    }

    fn save_checkpoint(&self, ctx: &JobContext, state: &RunState, detector: &RetryLoopDetector) {
        let mut checkpoint = Checkpoint::new(state.run_id.clone(), state.iteration);
        checkpoint.files_written = state.files_written.clone();
        checkpoint.cost_accumulated = state.cost;
        checkpoint.last_status = state.last_status.clone();
        checkpoint.retry_state = Some(detector.export());
        checkpoint.notes = json!({
            "job_id": ctx.job_id,
            "last_feedback": state.last_feedback,
        });
        if let Err(e) = self.checkpoints.save(&checkpoint) {
            warn!(run_id = %state.run_id, error = %e, "Failed to save checkpoint");
            ctx.log.warn(format!("checkpoint not saved: {}", e));
        }
    }

    fn stopped(&self, ctx: &JobContext, reason: CancelReason, state: &RunState) -> Result<JobOutcome> {
        info!(job_id = %ctx.job_id, %reason, iteration = state.iteration, "Pipeline stopped");
        ctx.log.info(format!("stopped: {}", reason));
        match reason {
            CancelReason::Requested => Ok(JobOutcome::Cancelled(state.summary())),
            CancelReason::DeadlineExceeded => Err(eyre!("deadline exceeded after {} iterations", state.iteration)),
        }
    }
}

#[async_trait]
impl JobRunner for PipelineRunner {
    async fn run(&self, ctx: JobContext) -> Result<JobOutcome> {
        debug!(job_id = %ctx.job_id, run_id = %ctx.run_id, "PipelineRunner::run: called");
        let job: PipelineJobConfig =
            serde_json::from_value(ctx.config.clone()).wrap_err("Invalid pipeline job config")?;
        let llm = self.client_for(&job)?;
        let max_iterations = job.max_iterations.unwrap_or(self.settings.max_iterations);
        let output_dir = self.output_dir(&job, &ctx.run_id);
        let mut detector = RetryLoopDetector::new(self.settings.retry_loop);

        let mut state = match self.checkpoints.load(&ctx.run_id) {
            Some(checkpoint) => {
                info!(run_id = %ctx.run_id, iteration = checkpoint.iteration_index, "Resuming from checkpoint");
                ctx.log.info(format!("resuming after iteration {}", checkpoint.iteration_index));
                if let Some(retry_state) = checkpoint.retry_state.clone() {
                    detector.restore(retry_state);
                }
                RunState::resumed(&checkpoint)
            }
            None => RunState::fresh(&ctx.run_id),
        };

        if is_pass_status(&state.last_status) {
            info!(run_id = %ctx.run_id, "Run already passed, nothing to resume");
            ctx.log.info("run already passed");
            return Ok(JobOutcome::Completed(state.summary()));
        }

        ctx.log.info(format!(
            "pipeline started: model={} max_iterations={} output_dir={}",
            llm.model(),
            max_iterations,
            output_dir.display()
        ));

        loop {
            let iteration = state.iteration + 1;
            if iteration > max_iterations {
                ctx.log.error(format!("max iterations ({}) reached without a pass", max_iterations));
                return Err(eyre!("max iterations ({}) reached without a pass", max_iterations));
            }
            if let Err(reason) = ctx.cancel.check() {
                return self.stopped(&ctx, reason, &state);
            }

            debug!(job_id = %ctx.job_id, %iteration, "PipelineRunner::run: iteration start");
            let request = self.build_request(&job, &state, iteration, max_iterations);
            let response = match self.call_model(&ctx, &llm, &request).await {
                Ok(response) => response,
                Err(CallError::Cancelled(reason)) => return self.stopped(&ctx, reason, &state),
                Err(CallError::Failed(e)) => {
                    ctx.log.error(format!("iteration {}: {:#}", iteration, e));
                    return Err(e);
                }
            };

            let cost = response.usage.cost_usd(llm.model());
            state.cost += cost;

            let report = StepReport::parse(&response.content).unwrap_or_else(|e| {
                warn!(job_id = %ctx.job_id, %iteration, error = %e, "Unparseable step report");
                StepReport::invalid(&e)
            });

            self.write_files(&ctx, &output_dir, &report.files, &mut state)
                .wrap_err_with(|| format!("Failed to write outputs for iteration {}", iteration))?;
            self.record_writes(&ctx, &report, iteration, cost, &state).await;

            state.iteration = iteration;
            state.last_status = report.status.clone();
            state.last_feedback = report.feedback.clone();

            let verdict = detector.check(&report.status, &report.feedback, iteration);
            self.save_checkpoint(&ctx, &state, &detector);
            ctx.log.info(format!(
                "iteration {} status={} cost=${:.4} files={}",
                iteration,
                report.status,
                cost,
                report.files.len()
            ));

            if report.is_pass() {
                let mut summary = state.summary();
                if let Some(text) = &report.summary {
                    summary["summary"] = json!(text);
                }
                let snapshot = Snapshot {
                    run_id: state.run_id.clone(),
                    label: "final".to_string(),
                    content: summary.clone(),
                };
                self.enqueue(&ctx, WriteOp::AddSnapshot(snapshot), &state.failed_writes).await;
                info!(job_id = %ctx.job_id, %iteration, "Pipeline passed");
                return Ok(JobOutcome::Completed(summary));
            }

            if verdict.should_abort {
                let reason = verdict.reason.unwrap_or_else(|| "retry loop detected".to_string());
                ctx.log.warn(format!("aborting: {}", reason));
                return Ok(JobOutcome::Aborted {
                    reason,
                    summary: state.summary(),
                });
            }
        }
    }
}

/// Relative path that stays inside the output directory
/// Canonical `a/b/c` form of a relative output path
///
/// `None` for empty, absolute or parent-escaping paths. `./a.md` and `a.md`
/// map to the same key.
fn normalize_relative(path: &str) -> Option<String> {
    let mut parts = Vec::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if parts.is_empty() { None } else { Some(parts.join("/")) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerConfig, CircuitState};
    use crate::jobs::{CancelContext, JobLog};
    use crate::llm::client::mock::MockLlmClient;
    use crate::writes::WriteQueueConfig;
    use knowledgestore::{SqliteStore, Table};
    use tempfile::{TempDir, tempdir};

    struct Harness {
        dir: TempDir,
        writes: WriteQueue,
        breakers: Arc<BreakerRegistry>,
        checkpoints: CheckpointStore,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_breakers(BreakerConfig::default())
        }

        fn with_breakers(config: BreakerConfig) -> Self {
            let dir = tempdir().unwrap();
            let store = SqliteStore::open(dir.path().join("knowledge.db")).unwrap();
            let writes = WriteQueue::start(Box::new(store), WriteQueueConfig::default());
            let checkpoints = CheckpointStore::new(dir.path().join("checkpoints"));
            Self {
                dir,
                writes,
                breakers: Arc::new(BreakerRegistry::new(config)),
                checkpoints,
            }
        }

        fn settings(&self) -> PipelineSettings {
            PipelineSettings {
                max_iterations: 5,
                retry_delay: Duration::from_millis(1),
                outputs_dir: self.dir.path().join("outputs"),
                ..Default::default()
            }
        }

        fn runner(&self, llm: Arc<MockLlmClient>) -> PipelineRunner {
            PipelineRunner::new(
                self.settings(),
                llm,
                self.breakers.clone(),
                self.writes.clone(),
                self.checkpoints.clone(),
            )
        }

        fn ctx(&self, run_id: &str, config: Value) -> JobContext {
            JobContext {
                job_id: format!("job-{}", run_id),
                run_id: run_id.to_string(),
                config,
                cancel: CancelContext::new(),
                log: Arc::new(JobLog::new(self.dir.path().join("logs").join(format!("{}.log", run_id)))),
            }
        }

        fn outputs(&self, run_id: &str) -> PathBuf {
            self.dir.path().join("outputs").join(run_id)
        }

        async fn reopen_store(&self) -> SqliteStore {
            self.writes.stop(Duration::from_secs(5)).await;
            SqliteStore::open(self.dir.path().join("knowledge.db")).unwrap()
        }
    }

    fn reply(report: Value) -> CompletionResponse {
        CompletionResponse::text(report.to_string())
    }

    fn task() -> Value {
        json!({"name": "survey", "task": "Survey widget makers"})
    }

    #[tokio::test]
    async fn test_passes_on_second_iteration() {
        let h = Harness::new();
        let llm = Arc::new(MockLlmClient::new(vec![
            reply(json!({
                "status": "fail",
                "feedback": {"issues": ["no sources"]},
                "entities": [{"id": "acme", "kind": "company", "name": "Acme"}],
                "files": [{"path": "draft.md", "content": "# Draft"}],
            })),
            reply(json!({
                "status": "pass",
                "entities": [{"id": "widgets", "kind": "product", "name": "Widgets"}],
                "relationships": [{"source": "acme", "target": "widgets", "kind": "sells"}],
                "files": [{"path": "report/final.md", "content": "# Final"}],
                "summary": "done",
            })),
        ]));
        let runner = h.runner(llm.clone());

        let outcome = runner.run(h.ctx("run-a", task())).await.unwrap();
        let JobOutcome::Completed(summary) = outcome else {
            panic!("expected completion, got {:?}", outcome);
        };
        assert_eq!(summary["iterations"], 2);
        assert_eq!(summary["summary"], "done");
        assert_eq!(summary["last_status"], "pass");
        assert_eq!(llm.call_count(), 2);

        // Second request carries the first iteration's feedback
        let second = &llm.requests()[1].messages[0].content;
        assert!(second.contains("no sources"));
        assert!(second.contains("draft.md"));

        assert_eq!(std::fs::read_to_string(h.outputs("run-a").join("draft.md")).unwrap(), "# Draft");
        assert_eq!(std::fs::read_to_string(h.outputs("run-a").join("report/final.md")).unwrap(), "# Final");

        let checkpoint = h.checkpoints.load("run-a").unwrap();
        assert_eq!(checkpoint.iteration_index, 2);
        assert_eq!(checkpoint.last_status, "pass");
        assert_eq!(checkpoint.files_written.len(), 2);

        let store = h.reopen_store().await;
        assert_eq!(store.count(Table::Entities).unwrap(), 2);
        assert_eq!(store.count(Table::Relationships).unwrap(), 1);
        assert_eq!(store.count(Table::Runs).unwrap(), 2);
        assert_eq!(store.count(Table::Snapshots).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_identical_feedback_aborts() {
        let h = Harness::new();
        let same = json!({"status": "fail", "feedback": {"issues": ["b", "a"]}});
        let reordered = json!({"status": "fail", "feedback": {"issues": ["a", "b"]}});
        let llm = Arc::new(MockLlmClient::new(vec![reply(same), reply(reordered)]));
        let runner = h.runner(llm.clone());

        let outcome = runner.run(h.ctx("run-loop", task())).await.unwrap();
        let JobOutcome::Aborted { reason, summary } = outcome else {
            panic!("expected abort, got {:?}", outcome);
        };
        assert!(reason.contains("2 times"));
        assert_eq!(summary["iterations"], 2);
        assert_eq!(llm.call_count(), 2);

        let checkpoint = h.checkpoints.load("run-loop").unwrap();
        assert_eq!(checkpoint.retry_state.unwrap().consecutive_repeat_count, 1);
    }

    #[tokio::test]
    async fn test_unparseable_output_counts_as_repeat() {
        let h = Harness::new();
        let llm = Arc::new(MockLlmClient::new(vec![
            CompletionResponse::text("I could not finish."),
            CompletionResponse::text("I could not finish."),
        ]));
        let runner = h.runner(llm);

        let outcome = runner.run(h.ctx("run-garbled", task())).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Aborted { .. }));
        assert_eq!(h.checkpoints.load("run-garbled").unwrap().last_status, "invalid");
    }

    #[tokio::test]
    async fn test_max_iterations_is_failure() {
        let h = Harness::new();
        let llm = Arc::new(MockLlmClient::new(vec![
            reply(json!({"status": "fail", "feedback": "one"})),
            reply(json!({"status": "fail", "feedback": "two"})),
        ]));
        let runner = h.runner(llm);

        let mut config = task();
        config["max_iterations"] = json!(2);
        let err = runner.run(h.ctx("run-max", config)).await.unwrap_err();
        assert!(err.to_string().contains("max iterations (2)"));
    }

    #[tokio::test]
    async fn test_resume_skips_written_files_and_restores_feedback() {
        let h = Harness::new();
        let mut checkpoint = Checkpoint::new("run-resume", 3);
        checkpoint.files_written.insert("a.md".to_string());
        checkpoint.cost_accumulated = 0.25;
        checkpoint.last_status = "fail".to_string();
        checkpoint.notes = json!({"last_feedback": "tighten the intro"});
        h.checkpoints.save(&checkpoint).unwrap();
        std::fs::create_dir_all(h.outputs("run-resume")).unwrap();
        std::fs::write(h.outputs("run-resume").join("a.md"), "old").unwrap();

        let llm = Arc::new(MockLlmClient::new(vec![reply(json!({
            "status": "pass",
            "files": [{"path": "a.md", "content": "new"}, {"path": "b.md", "content": "b"}],
        }))]));
        let runner = h.runner(llm.clone());

        let outcome = runner.run(h.ctx("run-resume", task())).await.unwrap();
        let JobOutcome::Completed(summary) = outcome else {
            panic!("expected completion, got {:?}", outcome);
        };
        assert_eq!(summary["resumed_from"], 3);
        assert_eq!(summary["iterations"], 4);
        assert!((summary["cost_usd"].as_f64().unwrap() - 0.25).abs() < 1e-9);

        let prompt = &llm.requests()[0].messages[0].content;
        assert!(prompt.contains("Iteration 4 of 5"));
        assert!(prompt.contains("tighten the intro"));

        assert_eq!(std::fs::read_to_string(h.outputs("run-resume").join("a.md")).unwrap(), "old");
        assert_eq!(std::fs::read_to_string(h.outputs("run-resume").join("b.md")).unwrap(), "b");
    }

    #[tokio::test]
    async fn test_resume_of_passed_run_does_nothing() {
        let h = Harness::new();
        let mut checkpoint = Checkpoint::new("run-done", 2);
        checkpoint.last_status = "pass".to_string();
        h.checkpoints.save(&checkpoint).unwrap();

        let llm = Arc::new(MockLlmClient::new(vec![]));
        let outcome = h.runner(llm.clone()).run(h.ctx("run-done", task())).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Completed(_)));
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_before_first_call() {
        let h = Harness::new();
        let llm = Arc::new(MockLlmClient::new(vec![reply(json!({"status": "pass"}))]));
        let ctx = h.ctx("run-cancel", task());
        ctx.cancel.cancel();

        let outcome = h.runner(llm.clone()).run(ctx).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Cancelled(_)));
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_deadline_is_failure() {
        let h = Harness::new();
        let llm = Arc::new(MockLlmClient::new(vec![]));
        let mut ctx = h.ctx("run-deadline", task());
        ctx.cancel = CancelContext::with_timeout(Duration::ZERO);

        let err = h.runner(llm).run(ctx).await.unwrap_err();
        assert!(err.to_string().contains("deadline exceeded"));
    }

    #[tokio::test]
    async fn test_retryable_error_is_retried() {
        let h = Harness::new();
        let llm = Arc::new(MockLlmClient::scripted(vec![Err(503), Ok(reply(json!({"status": "pass"})))]));

        let outcome = h.runner(llm.clone()).run(h.ctx("run-503", task())).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Completed(_)));
        assert_eq!(llm.call_count(), 2);
    }

    #[tokio::test]
    async fn test_client_error_fails_job() {
        let h = Harness::new();
        let llm = Arc::new(MockLlmClient::scripted(vec![Err(400)]));

        let err = h.runner(llm.clone()).run(h.ctx("run-400", task())).await.unwrap_err();
        assert!(format!("{:#}", err).contains("400"));
        assert_eq!(llm.call_count(), 1);
    }

    #[tokio::test]
    async fn test_waits_out_open_breaker() {
        let h = Harness::with_breakers(BreakerConfig::with_failure_threshold(1).open_timeout(Duration::from_millis(50)));
        let breaker = h.breakers.get("llm:mock");
        let _ = breaker.call_sync(|| Err::<(), _>("boom"));
        assert_eq!(breaker.state(), CircuitState::Open);

        let llm = Arc::new(MockLlmClient::new(vec![reply(json!({"status": "pass"}))]));
        let outcome = h.runner(llm.clone()).run(h.ctx("run-open", task())).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Completed(_)));
        assert_eq!(llm.call_count(), 1);
        assert!(breaker.stats().rejected >= 1);
    }

    #[tokio::test]
    async fn test_gives_up_on_breaker_that_stays_open() {
        let h = Harness::with_breakers(BreakerConfig::with_failure_threshold(1).open_timeout(Duration::from_secs(60)));
        let _ = h.breakers.get("llm:mock").call_sync(|| Err::<(), _>("boom"));

        let llm = Arc::new(MockLlmClient::new(vec![]));
        let mut runner = h.runner(llm.clone());
        runner.settings.max_breaker_waits = 0;

        let err = runner.run(h.ctx("run-stuck", task())).await.unwrap_err();
        assert!(err.to_string().contains("still open"));
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_unsafe_paths_are_refused() {
        let h = Harness::new();
        let llm = Arc::new(MockLlmClient::new(vec![reply(json!({
            "status": "pass",
            "files": [
                {"path": "../escape.md", "content": "x"},
                {"path": "/tmp/abs.md", "content": "x"},
                {"path": "ok.md", "content": "fine"},
            ],
        }))]));

        let outcome = h.runner(llm).run(h.ctx("run-paths", task())).await.unwrap();
        let JobOutcome::Completed(summary) = outcome else {
            panic!("expected completion");
        };
        assert_eq!(summary["files_written"], json!(["ok.md"]));
        assert!(!h.dir.path().join("outputs").join("escape.md").exists());
    }

    #[tokio::test]
    async fn test_invalid_job_config_fails() {
        let h = Harness::new();
        let llm = Arc::new(MockLlmClient::new(vec![]));
        let err = h.runner(llm).run(h.ctx("run-bad", json!({"name": "no task"}))).await.unwrap_err();
        assert!(err.to_string().contains("Invalid pipeline job config"));
    }

    #[test]
    fn test_normalize_relative() {
        assert_eq!(normalize_relative("a.md").as_deref(), Some("a.md"));
        assert_eq!(normalize_relative("./dir/a.md").as_deref(), Some("dir/a.md"));
        assert_eq!(normalize_relative("dir//./a.md").as_deref(), Some("dir/a.md"));
        assert_eq!(normalize_relative("./"), None);
        assert_eq!(normalize_relative(""), None);
        assert_eq!(normalize_relative("../a.md"), None);
        assert_eq!(normalize_relative("dir/../../a.md"), None);
        assert_eq!(normalize_relative("/etc/passwd"), None);
    }

    #[tokio::test]
    async fn test_dot_prefixed_path_is_the_same_file() {
        let h = Harness::new();
        let llm = Arc::new(MockLlmClient::new(vec![
            reply(json!({"status": "fail", "feedback": "one", "files": [{"path": "./a.md", "content": "v1"}]})),
            reply(json!({"status": "pass", "files": [{"path": "a.md", "content": "v2"}]})),
        ]));
        let runner = h.runner(llm);

        let outcome = runner.run(h.ctx("run-dot", task())).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Completed(_)));
        assert_eq!(std::fs::read_to_string(h.outputs("run-dot").join("a.md")).unwrap(), "v1");

        let checkpoint = h.checkpoints.load("run-dot").unwrap();
        assert_eq!(checkpoint.files_written.into_iter().collect::<Vec<_>>(), vec!["a.md".to_string()]);
    }

    #[tokio::test]
    async fn test_passed_status_completes() {
        let h = Harness::new();
        let passed = json!({"status": "passed", "feedback": "looks good"});
        let llm = Arc::new(MockLlmClient::new(vec![reply(passed.clone()), reply(passed)]));
        let runner = h.runner(llm.clone());

        let outcome = runner.run(h.ctx("run-passed", task())).await.unwrap();
        let JobOutcome::Completed(summary) = outcome else {
            panic!("expected completion, got {:?}", outcome);
        };
        assert_eq!(summary["iterations"], 1);
        assert_eq!(llm.call_count(), 1);

        // A resume of the same run sees the pass and does not call the model
        let again = Arc::new(MockLlmClient::new(vec![]));
        let outcome = h.runner(again.clone()).run(h.ctx("run-passed", task())).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Completed(_)));
        assert_eq!(again.call_count(), 0);
    }
}
