//! JobManager - lifecycle, background execution and durable job state
//!
//! The JobManager is responsible for:
//! - Creating jobs and assigning ids
//! - Spawning one tokio task per started job
//! - Turning worker results, errors and panics into terminal statuses
//! - Cooperative cancellation
//! - Rewriting the state file atomically on every mutation
//!
//! All mutations go through one update lock that is held across the change
//! and the state-file rewrite, so the file on disk is always a consistent
//! snapshot. Reads (`get`, `list`) only take the map's read lock.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use fs2::FileExt;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{CancelContext, JobContext, JobError, JobLog, JobOutcome, JobRunner};
use crate::domain::{IdResolver, Job, JobFilter, JobStatus, JobUpdate, generate_id};
use crate::persist::atomic_write_json;

const STATE_FILE: &str = "jobs.json";
const LOCK_FILE: &str = "jobs.lock";

/// On-disk layout of the state file
#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    jobs: Vec<Job>,
}

/// Outcome of [`JobManager::recover`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryStats {
    /// Jobs that were running when the previous process died, now failed
    pub interrupted: usize,
    /// Jobs still waiting to be started
    pub queued: usize,
    /// Jobs already in a terminal state
    pub terminal: usize,
}

struct Inner {
    state_dir: PathBuf,
    state_path: PathBuf,
    logs_dir: PathBuf,
    jobs: RwLock<HashMap<String, Job>>,
    update_lock: Mutex<()>,
    cancels: Mutex<HashMap<String, CancelContext>>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    // Flips to true once the worker has recorded its terminal status
    done: Mutex<HashMap<String, watch::Receiver<bool>>>,
    runner: Arc<dyn JobRunner>,
    persist_failures: AtomicU64,
    // Held for the manager's lifetime; dropping it releases the advisory lock
    _lock: File,
}

/// Handle to the job manager; clone freely
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<Inner>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl JobManager {
    /// Open (or create) the job state under `state_dir`
    ///
    /// Takes an exclusive lock on `<state_dir>/jobs.lock`; a second manager on
    /// the same directory fails with [`JobError::AlreadyLocked`].
    pub fn open(state_dir: impl AsRef<Path>, runner: Arc<dyn JobRunner>) -> Result<Self, JobError> {
        let state_dir = state_dir.as_ref().to_path_buf();
        debug!(state_dir = %state_dir.display(), "JobManager::open: called");
        let logs_dir = state_dir.join("logs");
        std::fs::create_dir_all(&logs_dir).map_err(|e| JobError::Io {
            path: logs_dir.clone(),
            source: e,
        })?;

        let lock_path = state_dir.join(LOCK_FILE);
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| JobError::Io {
                path: lock_path.clone(),
                source: e,
            })?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(JobError::AlreadyLocked(lock_path));
        }

        let state_path = state_dir.join(STATE_FILE);
        let jobs = load_state(&state_path)?;
        info!(state_path = %state_path.display(), count = jobs.len(), "JobManager opened");

        Ok(Self {
            inner: Arc::new(Inner {
                state_dir,
                state_path,
                logs_dir,
                jobs: RwLock::new(jobs),
                update_lock: Mutex::new(()),
                cancels: Mutex::new(HashMap::new()),
                tasks: Mutex::new(HashMap::new()),
                done: Mutex::new(HashMap::new()),
                runner,
                persist_failures: AtomicU64::new(0),
                _lock: lock_file,
            }),
        })
    }

    pub fn state_dir(&self) -> &Path {
        &self.inner.state_dir
    }

    pub fn state_path(&self) -> &Path {
        &self.inner.state_path
    }

    /// State-file writes that failed since open
    pub fn persist_failures(&self) -> u64 {
        self.inner.persist_failures.load(Ordering::Relaxed)
    }

    /// Record a new queued job; does not start it
    pub fn create(&self, config: Value) -> Job {
        debug!("JobManager::create: called");
        let _guard = lock(&self.inner.update_lock);
        let name = config.get("name").and_then(Value::as_str).unwrap_or_default().to_string();

        let (job, all) = {
            let mut jobs = self.write_jobs();
            let mut id = generate_id("job", &name);
            while jobs.contains_key(&id) {
                id = generate_id("job", &name);
            }
            let job = Job::with_id(id, config, &self.inner.logs_dir);
            jobs.insert(job.id.clone(), job.clone());
            (job, snapshot_of(&jobs))
        };
        self.persist(&all);

        JobLog::new(&job.logs_path).info(format!("created job {} (run {})", job.id, job.run_id));
        info!(job_id = %job.id, "Job created");
        job
    }

    /// Queue a new job that continues a finished job's run
    ///
    /// The new job gets the old config plus the old `run_id`, so its worker
    /// loads the run's checkpoint. The old job is left untouched.
    pub fn resume(&self, id: &str) -> Result<Job, JobError> {
        debug!(%id, "JobManager::resume: called");
        let old = self.get(id).ok_or_else(|| JobError::NotFound(id.to_string()))?;
        if !old.is_terminal() {
            return Err(JobError::NotResumable {
                id: old.id,
                status: old.status,
            });
        }

        let mut config = old.config.clone();
        if let Some(map) = config.as_object_mut() {
            map.insert("run_id".to_string(), json!(old.run_id));
            map.insert("resumed_from_job".to_string(), json!(old.id));
        }
        let job = self.create(config);
        info!(job_id = %job.id, from = %old.id, run_id = %job.run_id, "Job resumed");
        Ok(job)
    }

    /// Start a queued job's worker
    ///
    /// Returns false if the job is unknown or not queued. A queued job whose
    /// cancellation was already requested is moved to `cancelled` instead.
    /// Must be called from within a tokio runtime.
    pub fn start(&self, id: &str) -> bool {
        debug!(%id, "JobManager::start: called");
        let _guard = lock(&self.inner.update_lock);

        let (job, all) = {
            let mut jobs = self.write_jobs();
            let Some(job) = jobs.get_mut(id) else {
                debug!(%id, "JobManager::start: unknown job");
                return false;
            };
            if job.status != JobStatus::Queued {
                debug!(%id, status = %job.status, "JobManager::start: not queued");
                return false;
            }
            let update = if job.cancel_requested {
                JobUpdate::cancelled(json!({ "reason": "cancelled before start" }))
            } else {
                JobUpdate::status(JobStatus::Running)
            };
            if let Err(e) = job.apply(update) {
                error!(%id, error = %e, "JobManager::start: transition refused");
                return false;
            }
            let job = job.clone();
            (job, snapshot_of(&jobs))
        };
        self.persist(&all);

        let log = Arc::new(JobLog::new(&job.logs_path));
        if job.status == JobStatus::Cancelled {
            log.info("cancelled before start");
            info!(job_id = %job.id, "Job cancelled before start");
            return false;
        }

        let cancel = match job.config.get("max_runtime_secs").and_then(Value::as_u64) {
            Some(secs) => CancelContext::with_timeout(Duration::from_secs(secs)),
            None => CancelContext::new(),
        };
        lock(&self.inner.cancels).insert(job.id.clone(), cancel.clone());

        let ctx = JobContext {
            job_id: job.id.clone(),
            run_id: job.run_id.clone(),
            config: job.config.clone(),
            cancel,
            log: log.clone(),
        };
        log.info("started");

        let (done_tx, done_rx) = watch::channel(false);
        lock(&self.inner.done).insert(job.id.clone(), done_rx);

        let manager = self.clone();
        let runner = self.inner.runner.clone();
        let handle = tokio::spawn(async move {
            run_worker(manager, runner, ctx).await;
            done_tx.send_replace(true);
        });
        lock(&self.inner.tasks).insert(job.id.clone(), handle);
        info!(job_id = %job.id, "Job started");
        true
    }

    /// Request cooperative cancellation
    ///
    /// A queued job moves straight to `cancelled`. A running job gets its
    /// flag set and its worker's context triggered; the worker decides when
    /// to stop. Returns false for unknown or terminal jobs.
    pub fn cancel(&self, id: &str) -> bool {
        debug!(%id, "JobManager::cancel: called");
        let _guard = lock(&self.inner.update_lock);

        let (job, all) = {
            let mut jobs = self.write_jobs();
            let Some(job) = jobs.get_mut(id) else {
                return false;
            };
            let update = match job.status {
                JobStatus::Queued => JobUpdate {
                    status: Some(JobStatus::Cancelled),
                    result_summary: Some(json!({ "reason": "cancelled before start" })),
                    cancel_requested: Some(true),
                    ..Default::default()
                },
                JobStatus::Running => JobUpdate::cancel_requested(),
                _ => {
                    debug!(%id, status = %job.status, "JobManager::cancel: already terminal");
                    return false;
                }
            };
            if let Err(e) = job.apply(update) {
                warn!(%id, error = %e, "JobManager::cancel: refused");
                return false;
            }
            (job.clone(), snapshot_of(&jobs))
        };
        self.persist(&all);

        if let Some(cancel) = lock(&self.inner.cancels).get(id) {
            cancel.cancel();
        }
        JobLog::new(&job.logs_path).info("cancel requested");
        info!(job_id = %id, status = %job.status, "Job cancel requested");
        true
    }

    /// The sole mutation path for status and result fields
    pub fn update(&self, id: &str, update: JobUpdate) -> Result<Job, JobError> {
        debug!(%id, ?update, "JobManager::update: called");
        let _guard = lock(&self.inner.update_lock);
        let (job, all) = {
            let mut jobs = self.write_jobs();
            let job = jobs.get_mut(id).ok_or_else(|| JobError::NotFound(id.to_string()))?;
            job.apply(update)?;
            (job.clone(), snapshot_of(&jobs))
        };
        self.persist(&all);
        Ok(job)
    }

    /// Attach a post-hoc annotation; allowed on terminal jobs
    pub fn annotate(&self, id: &str, key: &str, value: Value) -> Result<Job, JobError> {
        debug!(%id, %key, "JobManager::annotate: called");
        let _guard = lock(&self.inner.update_lock);
        let (job, all) = {
            let mut jobs = self.write_jobs();
            let job = jobs.get_mut(id).ok_or_else(|| JobError::NotFound(id.to_string()))?;
            job.annotate(key, value);
            (job.clone(), snapshot_of(&jobs))
        };
        self.persist(&all);
        Ok(job)
    }

    pub fn get(&self, id: &str) -> Option<Job> {
        self.read_jobs().get(id).cloned()
    }

    /// Jobs matching `filter`, newest first
    pub fn list(&self, filter: &JobFilter, limit: Option<usize>) -> Vec<Job> {
        debug!(?filter, ?limit, "JobManager::list: called");
        let mut out: Vec<Job> = self.read_jobs().values().filter(|j| filter.matches(j)).cloned().collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        if let Some(limit) = limit {
            out.truncate(limit);
        }
        out
    }

    /// Resolve a full id, id prefix or name fragment to one job id
    pub fn resolve(&self, reference: &str) -> Result<String, JobError> {
        let names: HashMap<String, String> = self
            .read_jobs()
            .values()
            .map(|j| (j.id.clone(), j.name().to_string()))
            .collect();
        match IdResolver::new(&names).resolve(reference) {
            Ok(Some(id)) => Ok(id),
            Ok(None) => Err(JobError::NotFound(reference.to_string())),
            Err(candidates) => Err(JobError::Ambiguous {
                reference: reference.to_string(),
                candidates,
            }),
        }
    }

    /// Mark jobs left `running` by a dead process as failed
    pub fn recover(&self) -> RecoveryStats {
        debug!("JobManager::recover: called");
        let live: Vec<String> = lock(&self.inner.tasks).keys().cloned().collect();
        let _guard = lock(&self.inner.update_lock);

        let mut stats = RecoveryStats::default();
        let mut interrupted = Vec::new();
        let all = {
            let mut jobs = self.write_jobs();
            for job in jobs.values_mut() {
                match job.status {
                    JobStatus::Running if !live.contains(&job.id) => {
                        match job.apply(JobUpdate::failed("interrupted: process exited while the job was running")) {
                            Ok(()) => {
                                stats.interrupted += 1;
                                interrupted.push(job.logs_path.clone());
                                info!(job_id = %job.id, "Recovered interrupted job as failed");
                            }
                            Err(e) => warn!(job_id = %job.id, error = %e, "JobManager::recover: refused"),
                        }
                    }
                    JobStatus::Queued => stats.queued += 1,
                    s if s.is_terminal() => stats.terminal += 1,
                    _ => {}
                }
            }
            snapshot_of(&jobs)
        };
        if stats.interrupted > 0 {
            self.persist(&all);
        }
        for path in interrupted {
            JobLog::new(path).error("interrupted: marked failed during recovery");
        }
        stats
    }

    /// Wait for a started job's worker to finish
    ///
    /// Safe to drop mid-wait and call again; the worker's handle stays with
    /// the manager so `shutdown` still sees it.
    pub async fn wait(&self, id: &str) -> Option<Job> {
        debug!(%id, "JobManager::wait: called");
        let done = lock(&self.inner.done).get(id).cloned();
        if let Some(mut done) = done
            && done.wait_for(|finished| *finished).await.is_err()
        {
            warn!(job_id = %id, "Job worker went away before recording a result");
        }
        self.get(id)
    }

    /// Number of workers still registered
    pub fn active_count(&self) -> usize {
        let mut tasks = lock(&self.inner.tasks);
        tasks.retain(|_, handle| !handle.is_finished());
        tasks.len()
    }

    /// Cancel every running job and wait up to `timeout` for the workers
    ///
    /// Workers that outlive the timeout are aborted and recorded as failed.
    pub async fn shutdown(&self, timeout: Duration) {
        let running: Vec<String> = lock(&self.inner.tasks).keys().cloned().collect();
        info!(count = running.len(), "Shutting down JobManager");
        for id in &running {
            self.cancel(id);
        }

        let handles: Vec<(String, JoinHandle<()>)> = lock(&self.inner.tasks).drain().collect();
        let deadline = tokio::time::Instant::now() + timeout;
        for (id, mut handle) in handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(_) => debug!(job_id = %id, "JobManager::shutdown: worker exited"),
                Err(_) => {
                    warn!(job_id = %id, "Aborting job worker after shutdown timeout");
                    handle.abort();
                    lock(&self.inner.done).remove(&id);
                    if let Err(e) = self.update(&id, JobUpdate::failed("aborted: shutdown timeout")) {
                        debug!(job_id = %id, error = %e, "JobManager::shutdown: worker finished while aborting");
                    }
                }
            }
        }
        info!("JobManager shutdown complete");
    }

    fn read_jobs(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Job>> {
        self.inner.jobs.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_jobs(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Job>> {
        self.inner.jobs.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Rewrite the state file; callers hold the update lock
    fn persist(&self, jobs: &[Job]) {
        let state = StateFileRef { jobs };
        if let Err(e) = atomic_write_json(&self.inner.state_path, &state) {
            self.inner.persist_failures.fetch_add(1, Ordering::Relaxed);
            error!(error = %e, "Failed to persist job state; in-memory state stays authoritative");
        }
    }

    fn forget_worker(&self, id: &str) {
        lock(&self.inner.cancels).remove(id);
        lock(&self.inner.done).remove(id);
    }
}

#[derive(Serialize)]
struct StateFileRef<'a> {
    jobs: &'a [Job],
}

fn snapshot_of(jobs: &HashMap<String, Job>) -> Vec<Job> {
    let mut all: Vec<Job> = jobs.values().cloned().collect();
    all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    all
}

fn load_state(path: &Path) -> Result<HashMap<String, Job>, JobError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => {
            return Err(JobError::Io {
                path: path.to_path_buf(),
                source: e,
            });
        }
    };
    let state: StateFile = serde_json::from_str(&content).map_err(|e| JobError::StateFile {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    Ok(state.jobs.into_iter().map(|j| (j.id.clone(), j)).collect())
}

/// Run one worker and record how it ended
async fn run_worker(manager: JobManager, runner: Arc<dyn JobRunner>, ctx: JobContext) {
    let job_id = ctx.job_id.clone();
    let log = ctx.log.clone();
    debug!(%job_id, "run_worker: called");

    let result = AssertUnwindSafe(runner.run(ctx)).catch_unwind().await;
    let update = match result {
        Ok(Ok(JobOutcome::Completed(summary))) => {
            log.info("completed");
            JobUpdate::completed(summary)
        }
        Ok(Ok(JobOutcome::Cancelled(summary))) => {
            log.info("cancelled");
            JobUpdate::cancelled(summary)
        }
        Ok(Ok(JobOutcome::Aborted { reason, summary })) => {
            log.warn(format!("retry loop aborted: {}", reason));
            JobUpdate::completed(JobOutcome::aborted_summary(&reason, summary))
        }
        Ok(Err(e)) => {
            let message = format!("{:#}", e);
            log.error(format!("failed: {}", message));
            JobUpdate::failed(message)
        }
        Err(panic) => {
            let message = format!("worker panicked: {}", panic_message(panic.as_ref()));
            log.error(&message);
            JobUpdate::failed(message)
        }
    };

    match manager.update(&job_id, update) {
        Ok(job) => info!(%job_id, status = %job.status, "Job finished"),
        Err(e) => error!(%job_id, error = %e, "Failed to record job result"),
    }
    manager.forget_worker(&job_id);
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tempfile::tempdir;

    /// Runner driven by the job config: `{"mode": "ok" | "err" | "panic" | "wait"}`
    struct ScriptedRunner;

    #[async_trait]
    impl JobRunner for ScriptedRunner {
        async fn run(&self, ctx: JobContext) -> eyre::Result<JobOutcome> {
            match ctx.config.get("mode").and_then(Value::as_str).unwrap_or("ok") {
                "ok" => Ok(JobOutcome::Completed(json!({"echo": ctx.config["value"].clone()}))),
                "err" => Err(eyre::eyre!("worker exploded")),
                "panic" => panic!("worker panicked on purpose"),
                "abort" => Ok(JobOutcome::Aborted {
                    reason: "same feedback twice".to_string(),
                    summary: json!({"iterations": 2}),
                }),
                _ => loop {
                    if ctx.cancel.check().is_err() {
                        return Ok(JobOutcome::Cancelled(json!({"stopped": true})));
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                },
            }
        }
    }

    fn manager(dir: &Path) -> JobManager {
        JobManager::open(dir, Arc::new(ScriptedRunner)).unwrap()
    }

    fn read_state(dir: &Path) -> Vec<Job> {
        let content = std::fs::read_to_string(dir.join(STATE_FILE)).unwrap();
        serde_json::from_str::<StateFile>(&content).unwrap().jobs
    }

    #[tokio::test]
    async fn test_create_persists_queued_job() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        let job = mgr.create(json!({"name": "Market Survey"}));

        assert_eq!(job.status, JobStatus::Queued);
        let on_disk = read_state(dir.path());
        assert_eq!(on_disk.len(), 1);
        assert_eq!(on_disk[0].id, job.id);
        assert!(job.logs_path.exists());
    }

    #[tokio::test]
    async fn test_start_runs_to_completion() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        let job = mgr.create(json!({"mode": "ok", "value": 42}));

        assert!(mgr.start(&job.id));
        assert!(!mgr.start(&job.id), "second start must be refused");

        let done = mgr.wait(&job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.result_summary, Some(json!({"echo": 42})));
        assert!(done.started_at.is_some() && done.finished_at.is_some());
        assert_eq!(read_state(dir.path())[0].status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_error_and_panic_become_failed() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        let err_job = mgr.create(json!({"mode": "err"}));
        let panic_job = mgr.create(json!({"mode": "panic"}));
        mgr.start(&err_job.id);
        mgr.start(&panic_job.id);

        let err_job = mgr.wait(&err_job.id).await.unwrap();
        assert_eq!(err_job.status, JobStatus::Failed);
        assert!(err_job.error.unwrap().contains("worker exploded"));

        let panic_job = mgr.wait(&panic_job.id).await.unwrap();
        assert_eq!(panic_job.status, JobStatus::Failed);
        assert!(panic_job.error.unwrap().contains("panicked on purpose"));
    }

    #[tokio::test]
    async fn test_abort_is_completed_with_marker() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        let job = mgr.create(json!({"mode": "abort"}));
        mgr.start(&job.id);
        let job = mgr.wait(&job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result_summary.unwrap()["outcome"], "retry_loop_aborted");
    }

    #[tokio::test]
    async fn test_cancel_queued_and_running() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());

        let queued = mgr.create(json!({}));
        assert!(mgr.cancel(&queued.id));
        let queued = mgr.get(&queued.id).unwrap();
        assert_eq!(queued.status, JobStatus::Cancelled);
        assert!(queued.cancel_requested);
        assert!(!mgr.start(&queued.id));
        assert!(!mgr.cancel(&queued.id), "terminal jobs cannot be cancelled");

        let running = mgr.create(json!({"mode": "wait"}));
        assert!(mgr.start(&running.id));
        assert!(mgr.cancel(&running.id));
        let done = mgr.wait(&running.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Cancelled);
        assert_eq!(done.result_summary, Some(json!({"stopped": true})));
    }

    #[tokio::test]
    async fn test_wait_survives_being_dropped() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        let job = mgr.create(json!({"mode": "wait"}));
        mgr.start(&job.id);

        let done = tokio::select! {
            job = mgr.wait(&job.id) => job,
            _ = tokio::time::sleep(Duration::from_millis(20)) => {
                assert!(mgr.cancel(&job.id));
                mgr.wait(&job.id).await
            }
        };
        assert_eq!(done.unwrap().status, JobStatus::Cancelled);
        assert_eq!(read_state(dir.path())[0].status, JobStatus::Cancelled);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_after_dropped_wait_still_awaits_worker() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        let job = mgr.create(json!({"mode": "wait"}));
        mgr.start(&job.id);

        let timed_out = tokio::time::timeout(Duration::from_millis(20), mgr.wait(&job.id)).await;
        assert!(timed_out.is_err());
        assert_eq!(mgr.active_count(), 1);

        mgr.shutdown(Duration::from_secs(5)).await;
        assert_eq!(mgr.get(&job.id).unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_start_observes_flag_set_while_queued() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        let job = mgr.create(json!({"mode": "ok"}));
        mgr.update(&job.id, JobUpdate::cancel_requested()).unwrap();

        assert!(!mgr.start(&job.id));
        assert_eq!(mgr.get(&job.id).unwrap().status, JobStatus::Cancelled);
        assert_eq!(mgr.active_count(), 0);
    }

    #[tokio::test]
    async fn test_deadline_from_config() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        let job = mgr.create(json!({"mode": "wait", "max_runtime_secs": 0}));
        mgr.start(&job.id);
        let job = mgr.wait(&job.id).await.unwrap();
        // The scripted runner reports any cancel reason as cancelled
        assert_eq!(job.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_update_validates_transitions() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        let job = mgr.create(json!({}));
        let err = mgr.update(&job.id, JobUpdate::completed(json!({}))).unwrap_err();
        assert!(matches!(err, JobError::Transition(_)));
        assert!(matches!(
            mgr.update("missing", JobUpdate::default()),
            Err(JobError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_annotate_terminal_job() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        let job = mgr.create(json!({"mode": "ok"}));
        mgr.start(&job.id);
        mgr.wait(&job.id).await;

        let job = mgr.annotate(&job.id, "quality", json!({"score": 0.9})).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(read_state(dir.path())[0].annotations["quality"]["score"], 0.9);
    }

    #[tokio::test]
    async fn test_reopen_and_recover() {
        let dir = tempdir().unwrap();
        let (running_id, queued_id) = {
            let mgr = manager(dir.path());
            let running = mgr.create(json!({}));
            let queued = mgr.create(json!({}));
            mgr.update(&running.id, JobUpdate::status(JobStatus::Running)).unwrap();
            (running.id, queued.id)
        };

        let mgr = manager(dir.path());
        let stats = mgr.recover();
        assert_eq!(
            stats,
            RecoveryStats {
                interrupted: 1,
                queued: 1,
                terminal: 0
            }
        );
        let recovered = mgr.get(&running_id).unwrap();
        assert_eq!(recovered.status, JobStatus::Failed);
        assert!(recovered.error.unwrap().starts_with("interrupted"));
        assert_eq!(mgr.get(&queued_id).unwrap().status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn test_resume_reuses_run_id() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        let first = mgr.create(json!({"name": "survey", "mode": "err"}));
        assert!(matches!(mgr.resume(&first.id), Err(JobError::NotResumable { .. })));

        mgr.start(&first.id);
        assert_eq!(mgr.wait(&first.id).await.unwrap().status, JobStatus::Failed);

        let second = mgr.resume(&first.id).unwrap();
        assert_ne!(second.id, first.id);
        assert_eq!(second.run_id, first.run_id);
        assert_eq!(second.status, JobStatus::Queued);
        assert_eq!(second.config["resumed_from_job"], json!(first.id));
        assert!(matches!(mgr.resume("missing"), Err(JobError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_second_manager_is_locked_out() {
        let dir = tempdir().unwrap();
        let _first = manager(dir.path());
        let second = JobManager::open(dir.path(), Arc::new(ScriptedRunner));
        assert!(matches!(second, Err(JobError::AlreadyLocked(_))));
    }

    #[tokio::test]
    async fn test_torn_write_leaves_previous_state_loadable() {
        let dir = tempdir().unwrap();
        let (kept, before) = {
            let mgr = manager(dir.path());
            let kept = mgr.create(json!({"name": "kept"}));
            (kept, std::fs::read_to_string(dir.path().join(STATE_FILE)).unwrap())
        };

        // A crash between writing the temp file and the rename
        let torn = &before.as_bytes()[..before.len() / 2];
        std::fs::write(dir.path().join(".tmpX7k2Qa"), torn).unwrap();

        let mgr = manager(dir.path());
        assert_eq!(std::fs::read_to_string(dir.path().join(STATE_FILE)).unwrap(), before);
        assert_eq!(mgr.get(&kept.id).unwrap().status, JobStatus::Queued);

        let next = mgr.create(json!({"name": "after"}));
        let on_disk = read_state(dir.path());
        assert_eq!(on_disk.len(), 2);
        assert!(on_disk.iter().any(|j| j.id == next.id));
    }

    #[tokio::test]
    async fn test_corrupt_state_file_is_reported() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(STATE_FILE), "{ nope").unwrap();
        let result = JobManager::open(dir.path(), Arc::new(ScriptedRunner));
        assert!(matches!(result, Err(JobError::StateFile { .. })));
    }

    #[tokio::test]
    async fn test_list_newest_first_with_filter() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        let a = mgr.create(json!({"name": "alpha"}));
        std::thread::sleep(Duration::from_millis(2));
        let b = mgr.create(json!({"name": "beta"}));
        mgr.cancel(&a.id);

        let all = mgr.list(&JobFilter::default(), None);
        assert_eq!(all.iter().map(|j| j.id.as_str()).collect::<Vec<_>>(), vec![b.id.as_str(), a.id.as_str()]);
        assert_eq!(mgr.list(&JobFilter::status(JobStatus::Cancelled), None).len(), 1);
        assert_eq!(mgr.list(&JobFilter::default(), Some(1)).len(), 1);
        assert_eq!(mgr.resolve("beta").unwrap(), b.id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_cancels_running_jobs() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        let job = mgr.create(json!({"mode": "wait"}));
        mgr.start(&job.id);

        mgr.shutdown(Duration::from_secs(5)).await;
        assert_eq!(mgr.get(&job.id).unwrap().status, JobStatus::Cancelled);
        assert_eq!(mgr.active_count(), 0);
    }
}
