//! The runner: one long-lived control loop per namespace.
//!
//! The loop subscribes to namespace snapshots, asks the scheduler which
//! jobs are ready, and launches one agent process per newly ready job.
//! Each job is supervised in its own task, which records the outcome, runs
//! the feedback loop, and finally reports back over a channel so the loop
//! can drop the job from its running map.
//!
//! ```text
//! subscribe ─> snapshot ─> scheduler::ready ─> intake ─> spawn job task
//!                                                           │
//!            running map <── JobDone <── feedback <── finish_job
//! ```
//!
//! The running map is owned by the loop and only touched from it.

pub mod process;
pub mod supervise;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use foreman_db::models::{AssignmentStatus, Job, JobStatus, JobType, Namespace, NamespaceSnapshot};

use crate::feedback::FeedbackController;
use crate::harness::{CommandOptions, HarnessRegistry, StreamHandler};
use crate::prompt;
use crate::scheduler;
use crate::store::WorkStore;

use supervise::{Launch, Limits, Outcome};

/// Attempts at recording a job's outcome before giving up.
const FINISH_ATTEMPTS: u32 = 3;

/// Delay before the first retry; doubled after each failure.
const FINISH_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Configuration for a [`Runner`].
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Wall-time limit per job.
    pub job_timeout: Duration,
    /// Time between SIGTERM and SIGKILL for a timed-out job.
    pub kill_grace: Duration,
    /// Pause before re-subscribing after the snapshot stream broke.
    pub restart_backoff: Duration,
    /// How long shutdown waits for in-flight jobs.
    pub drain_timeout: Duration,
    /// Maximum stored result size in bytes.
    pub result_limit: usize,
    /// Fail jobs left `running` by a previous runner on startup.
    pub fail_orphans_on_start: bool,
    /// Exported to agents as `FOREMAN_DATABASE_URL`.
    pub database_url: Option<String>,
    /// Harness for pm and retrospect jobs; `None` reuses the finished
    /// job's harness.
    pub feedback_harness: Option<String>,
    /// Model and extra arguments per harness name.
    pub harness_options: HashMap<String, CommandOptions>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            job_timeout: Duration::from_secs(30 * 60),
            kill_grace: Duration::from_secs(5),
            restart_backoff: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(10),
            result_limit: 64 * 1024,
            fail_orphans_on_start: true,
            database_url: None,
            feedback_harness: None,
            harness_options: HashMap::new(),
        }
    }
}

impl RunnerConfig {
    fn limits(&self) -> Limits {
        Limits {
            timeout: self.job_timeout,
            grace: self.kill_grace,
            result_limit: self.result_limit,
        }
    }
}

/// Bookkeeping for one in-flight job.
#[derive(Debug)]
struct RunningJob {
    pid: Option<u32>,
    handle: JoinHandle<()>,
    started: Instant,
}

/// Sent by a job task once it is completely done.
#[derive(Debug)]
struct JobDone {
    job_id: Uuid,
}

enum LoopEvent {
    Cancelled,
    Finished(Option<JobDone>),
    Update(Option<Result<NamespaceSnapshot>>),
}

/// Why [`Runner::serve`] returned without an error.
enum ServeEnd {
    Cancelled,
    StreamEnded,
}

/// Everything a job task needs once launched.
struct JobTask {
    store: Arc<dyn WorkStore>,
    feedback: Arc<FeedbackController>,
    job: Job,
    launched: std::result::Result<(tokio::process::Child, Box<dyn StreamHandler>), String>,
    limits: Limits,
    /// The group's successor pointer when the job started.
    next_at_launch: Option<Uuid>,
}

/// Executes the jobs of one namespace.
pub struct Runner {
    store: Arc<dyn WorkStore>,
    registry: Arc<HarnessRegistry>,
    namespace: Namespace,
    config: RunnerConfig,
    feedback: Arc<FeedbackController>,
    running: HashMap<Uuid, RunningJob>,
    done_tx: mpsc::UnboundedSender<JobDone>,
    done_rx: mpsc::UnboundedReceiver<JobDone>,
}

impl Runner {
    pub fn new(
        store: Arc<dyn WorkStore>,
        registry: Arc<HarnessRegistry>,
        namespace: Namespace,
        config: RunnerConfig,
    ) -> Self {
        let feedback = Arc::new(FeedbackController::new(
            Arc::clone(&store),
            config.feedback_harness.clone(),
        ));
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        Self {
            store,
            registry,
            namespace,
            config,
            feedback,
            running: HashMap::new(),
            done_tx,
            done_rx,
        }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Run until `cancel` fires, then drain in-flight jobs.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let ns = self.namespace.name.clone();
        tracing::info!(namespace = %ns, "runner starting");

        if self.config.fail_orphans_on_start {
            if let Err(e) = self.recover_orphans().await {
                tracing::warn!(namespace = %ns, error = %e, "orphan recovery failed");
            }
        }

        loop {
            match self.serve(&cancel).await {
                Ok(ServeEnd::Cancelled) => break,
                Ok(ServeEnd::StreamEnded) => {
                    tracing::warn!(namespace = %ns, "snapshot stream ended, restarting");
                }
                Err(e) => {
                    tracing::warn!(namespace = %ns, error = %e, "serve loop failed, restarting");
                }
            }
            if self.backoff(&cancel).await {
                break;
            }
        }

        self.drain().await;
        tracing::info!(namespace = %ns, "runner stopped");
        Ok(())
    }

    /// Consume one subscription until it breaks or `cancel` fires.
    async fn serve(&mut self, cancel: &CancellationToken) -> Result<ServeEnd> {
        let mut updates = self.store.subscribe(self.namespace.id).await?;
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => LoopEvent::Cancelled,
                done = self.done_rx.recv() => LoopEvent::Finished(done),
                update = updates.next() => LoopEvent::Update(update),
            };
            match event {
                LoopEvent::Cancelled => return Ok(ServeEnd::Cancelled),
                LoopEvent::Finished(Some(done)) => self.on_finished(done),
                // The loop holds a sender, so the channel never closes.
                LoopEvent::Finished(None) => {}
                LoopEvent::Update(Some(Ok(snapshot))) => self.intake(&snapshot).await,
                LoopEvent::Update(Some(Err(e))) => return Err(e),
                LoopEvent::Update(None) => return Ok(ServeEnd::StreamEnded),
            }
        }
    }

    /// Wait out the restart backoff while still retiring finished jobs.
    /// Returns `true` if cancelled meanwhile.
    async fn backoff(&mut self, cancel: &CancellationToken) -> bool {
        let sleep = tokio::time::sleep(self.config.restart_backoff);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return true,
                _ = &mut sleep => return false,
                Some(done) = self.done_rx.recv() => self.on_finished(done),
            }
        }
    }

    async fn drain(&mut self) {
        if self.running.is_empty() {
            return;
        }
        tracing::info!(
            namespace = %self.namespace.name,
            in_flight = self.running.len(),
            "draining in-flight jobs"
        );
        let deadline = tokio::time::Instant::now() + self.config.drain_timeout;
        while !self.running.is_empty() {
            match tokio::time::timeout_at(deadline, self.done_rx.recv()).await {
                Ok(Some(done)) => self.on_finished(done),
                _ => break,
            }
        }
        for (job_id, entry) in self.running.drain() {
            tracing::warn!(
                job_id = %job_id,
                pid = entry.pid,
                elapsed_secs = entry.started.elapsed().as_secs(),
                "drain timeout expired, abandoning job"
            );
            #[cfg(unix)]
            {
                if let Some(pid) = entry.pid {
                    let _ = process::signal_group(pid, libc::SIGKILL);
                }
            }
            entry.handle.abort();
        }
    }

    fn on_finished(&mut self, done: JobDone) {
        if let Some(entry) = self.running.remove(&done.job_id) {
            tracing::debug!(
                job_id = %done.job_id,
                elapsed_secs = entry.started.elapsed().as_secs(),
                "job retired"
            );
        }
    }

    /// Fail jobs the store shows as running that no process of ours owns.
    async fn recover_orphans(&mut self) -> Result<()> {
        let running = self.store.list_running_jobs(self.namespace.id).await?;
        for mut job in running {
            if self.running.contains_key(&job.id) {
                continue;
            }
            let result = match job.started_at {
                Some(at) => format!(
                    "Orphaned: job was running (since {at}) when the runner started and has no live process"
                ),
                None => "Orphaned: job was running when the runner started and has no live process"
                    .to_string(),
            };
            let rows = self
                .store
                .finish_job(job.id, JobStatus::Failed, &result, job.resume_token.as_deref())
                .await?;
            if rows == 0 {
                continue;
            }
            tracing::warn!(job_id = %job.id, assignment_id = %job.assignment_id, "failed orphaned job");
            job.status = JobStatus::Failed;
            job.result = Some(result);
            if let Err(e) = self.feedback.on_job_finished(&job, false).await {
                tracing::error!(job_id = %job.id, error = %e, "feedback for orphaned job failed");
            }
        }
        Ok(())
    }

    async fn intake(&mut self, snapshot: &NamespaceSnapshot) {
        for job in scheduler::ready(snapshot) {
            if self.running.contains_key(&job.id) {
                continue;
            }
            let job_id = job.id;
            if let Err(e) = self.launch(snapshot, job).await {
                tracing::error!(job_id = %job_id, error = %e, "failed to launch job");
            }
        }
    }

    async fn launch(&mut self, snapshot: &NamespaceSnapshot, mut job: Job) -> Result<()> {
        let Some(assignment) = snapshot.assignment(job.assignment_id) else {
            return Ok(());
        };
        let prompt = prompt::render(&job, assignment);

        if self.store.start_job(job.id, &prompt).await? == 0 {
            tracing::debug!(job_id = %job.id, "job already claimed, skipping");
            return Ok(());
        }
        job.status = JobStatus::Running;
        job.prompt = Some(prompt.clone());

        if assignment.status == AssignmentStatus::Pending {
            if let Err(e) = self
                .store
                .transition_assignment(
                    assignment.id,
                    &[AssignmentStatus::Pending],
                    AssignmentStatus::Active,
                    None,
                )
                .await
            {
                tracing::warn!(assignment_id = %assignment.id, error = %e, "failed to activate assignment");
            }
        }

        // Fresh read: the snapshot may predate a concurrent tail append.
        let next_at_launch = match self.store.get_group(job.group_id).await {
            Ok(Some(group)) => group.next_group_id,
            _ => snapshot.group(job.group_id).and_then(|g| g.next_group_id),
        };

        let launched = match self.registry.get(&job.harness) {
            None => Err(format!(
                "Unknown harness '{}' (registered: {})",
                job.harness,
                self.registry.list().join(", ")
            )),
            Some(harness) => {
                let launch = Launch {
                    command: harness.build_command(&prompt, &self.command_options(snapshot, &job)),
                    working_dir: self.namespace.project_path.as_ref().map(PathBuf::from),
                    env: self.agent_env(&job, next_at_launch),
                };
                supervise::spawn_agent(&launch)
                    .map(|child| (child, harness.stream_handler()))
                    .map_err(|e| format!("Failed to launch agent: {e}"))
            }
        };
        let pid = launched.as_ref().ok().and_then(|(child, _)| child.id());

        tracing::info!(
            job_id = %job.id,
            assignment_id = %job.assignment_id,
            job_type = %job.job_type,
            harness = %job.harness,
            pid,
            "job started"
        );

        let task = JobTask {
            store: Arc::clone(&self.store),
            feedback: Arc::clone(&self.feedback),
            next_at_launch,
            job,
            launched,
            limits: self.config.limits(),
        };
        let job_id = task.job.id;
        let done_tx = self.done_tx.clone();
        let handle = tokio::spawn(async move {
            if AssertUnwindSafe(run_job(task)).catch_unwind().await.is_err() {
                tracing::error!(job_id = %job_id, "job task panicked");
            }
            let _ = done_tx.send(JobDone { job_id });
        });

        self.running.insert(
            job_id,
            RunningJob {
                pid,
                handle,
                started: Instant::now(),
            },
        );
        Ok(())
    }

    fn command_options(&self, snapshot: &NamespaceSnapshot, job: &Job) -> CommandOptions {
        let mut options = self
            .config
            .harness_options
            .get(&job.harness)
            .cloned()
            .unwrap_or_default();
        options.resume_token = resume_token_for(snapshot, job);
        options
    }

    fn agent_env(&self, job: &Job, next_at_launch: Option<Uuid>) -> Vec<(String, String)> {
        let mut env = vec![
            ("FOREMAN_NAMESPACE".to_string(), self.namespace.name.clone()),
            ("FOREMAN_ASSIGNMENT_ID".to_string(), job.assignment_id.to_string()),
            ("FOREMAN_JOB_ID".to_string(), job.id.to_string()),
            ("FOREMAN_JOB_TYPE".to_string(), job.job_type.to_string()),
        ];
        // Groups linked with `--after-current` go before this one.
        if let Some(next) = next_at_launch {
            env.push(("FOREMAN_NEXT_GROUP_ID".to_string(), next.to_string()));
        }
        if let Some(url) = &self.config.database_url {
            env.push(("FOREMAN_DATABASE_URL".to_string(), url.clone()));
        }
        env
    }
}

/// A retrospect job continues the session of the failed job it follows when
/// both run on the same harness.
fn resume_token_for(snapshot: &NamespaceSnapshot, job: &Job) -> Option<String> {
    if job.job_type != JobType::Retrospect {
        return None;
    }
    let previous = snapshot
        .groups
        .iter()
        .find(|g| g.next_group_id == Some(job.group_id))?;
    snapshot
        .jobs_in_group(previous.id)
        .filter(|j| j.status == JobStatus::Failed && j.harness == job.harness)
        .find_map(|j| j.resume_token.clone())
}

/// Supervise, record, and feed back one job.
async fn run_job(task: JobTask) {
    let JobTask {
        store,
        feedback,
        mut job,
        launched,
        limits,
        next_at_launch,
    } = task;

    let outcome = match launched {
        Ok((child, handler)) => supervise::supervise(child, handler, limits).await,
        Err(message) => Outcome::failed(message),
    };

    tracing::info!(
        job_id = %job.id,
        status = %outcome.status,
        result_len = outcome.result.len(),
        "job finished"
    );

    match record_outcome(store.as_ref(), job.id, &outcome).await {
        Some(1) => {}
        Some(_) => {
            tracing::warn!(job_id = %job.id, "job was no longer running, outcome not recorded");
            return;
        }
        None => return,
    }

    match store.get_group(job.group_id).await {
        Ok(Some(group)) if group.next_group_id != next_at_launch => {
            tracing::info!(job_id = %job.id, "job linked its own successor, skipping feedback");
            return;
        }
        Ok(_) => {}
        Err(e) => {
            tracing::error!(job_id = %job.id, error = %e, "failed to re-read job group, skipping feedback");
            return;
        }
    }

    let success = outcome.is_success();
    job.status = outcome.status;
    job.result = Some(outcome.result);
    job.resume_token = outcome.resume_token;
    if let Err(e) = feedback.on_job_finished(&job, success).await {
        tracing::error!(job_id = %job.id, error = %e, "feedback failed");
    }
}

/// Write the terminal state with bounded exponential backoff. Returns the
/// affected row count, or `None` once every attempt failed.
async fn record_outcome(store: &dyn WorkStore, job_id: Uuid, outcome: &Outcome) -> Option<u64> {
    let mut delay = FINISH_RETRY_DELAY;
    for attempt in 1..=FINISH_ATTEMPTS {
        match store
            .finish_job(
                job_id,
                outcome.status,
                &outcome.result,
                outcome.resume_token.as_deref(),
            )
            .await
        {
            Ok(rows) => return Some(rows),
            Err(e) if attempt < FINISH_ATTEMPTS => {
                tracing::warn!(job_id = %job_id, attempt, error = %e, "failed to record job outcome, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => {
                tracing::error!(
                    job_id = %job_id,
                    intended_status = %outcome.status,
                    error = %e,
                    "giving up recording job outcome; store still shows the job running"
                );
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use foreman_db::models::{NewAssignment, NewJob};

    async fn failed_then_retrospect(
        failed_harness: &str,
        retro_harness: &str,
    ) -> (NamespaceSnapshot, Job, Job) {
        let store = MemoryStore::new();
        let ns = store.create_namespace("resume", None).await.unwrap();
        let (_, head, jobs) = store
            .create_assignment(
                &NewAssignment {
                    namespace_id: ns.id,
                    north_star: "n".into(),
                    independent: false,
                    priority: 0,
                },
                &[NewJob::new(JobType::Implement, failed_harness)],
            )
            .await
            .unwrap();
        store.start_job(jobs[0].id, "p").await.unwrap();
        store
            .finish_job(jobs[0].id, JobStatus::Failed, "boom", Some("sess-1"))
            .await
            .unwrap();
        let (_, retro) = store
            .insert_group_after(
                head.unwrap().id,
                &[NewJob::new(JobType::Retrospect, retro_harness)],
            )
            .await
            .unwrap();
        let snap = store.snapshot(ns.id).await.unwrap();
        let failed = snap.job(jobs[0].id).unwrap().clone();
        (snap, failed, retro[0].clone())
    }

    #[tokio::test]
    async fn retrospect_resumes_failed_session_on_same_harness() {
        let (snap, failed, retro) = failed_then_retrospect("codex", "codex").await;
        assert_eq!(resume_token_for(&snap, &retro).as_deref(), Some("sess-1"));
        assert_eq!(resume_token_for(&snap, &failed), None);
    }

    #[tokio::test]
    async fn retrospect_on_another_harness_starts_fresh() {
        let (snap, _, retro) = failed_then_retrospect("codex", "claude-code").await;
        assert_eq!(resume_token_for(&snap, &retro), None);
    }

    #[test]
    fn default_config_matches_documented_values() {
        let config = RunnerConfig::default();
        assert_eq!(config.job_timeout, Duration::from_secs(1800));
        assert_eq!(config.kill_grace, Duration::from_secs(5));
        assert_eq!(config.restart_backoff, Duration::from_secs(5));
        assert_eq!(config.drain_timeout, Duration::from_secs(10));
        assert_eq!(config.result_limit, 65536);
        assert!(config.fail_orphans_on_start);
    }
}
