//! Feedback loop: grows an assignment's chain from job outcomes.
//!
//! | outcome                      | action                                        |
//! |------------------------------|-----------------------------------------------|
//! | failure (not retrospect)     | splice a `retrospect` group after the job     |
//! | failure of a retrospect      | block the assignment                          |
//! | success (ordinary/retrospect)| log artifact, append a `pm` group at the tail |
//! | success of a pm              | log decision, block / complete / nothing      |
//!
//! A status the controller writes is always guarded on `pending | active`,
//! so an assignment an operator blocked (or one already complete) is never
//! overridden.

use std::sync::Arc;

use anyhow::{Context, Result};
use uuid::Uuid;

use foreman_db::models::{AssignmentStatus, Job, JobStatus, JobType, NewJob};

use crate::store::WorkStore;

/// Marker a pm job writes to ask for a human.
pub const BLOCKED_MARKER: &str = "BLOCKED:";

/// Longest excerpt of a job result carried into a log line or context.
const EXCERPT_CHARS: usize = 2000;

const OPEN: [AssignmentStatus; 2] = [AssignmentStatus::Pending, AssignmentStatus::Active];

/// What the controller did for one finished job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedbackAction {
    /// A retrospect group was spliced in after the failed job's group.
    RecoveryQueued { group_id: Uuid },
    /// The assignment was marked blocked.
    Blocked { reason: String },
    /// A pm group was appended at the tail.
    ReviewQueued { group_id: Uuid },
    /// Other jobs in the same group are still running or pending.
    AwaitingSiblings,
    /// The group already has a successor.
    SuccessorPresent,
    /// The assignment was marked complete.
    Completed,
    /// A pm finished without appending, but other jobs are still open.
    OutstandingWork,
    /// Nothing to do: the assignment is closed or changed underneath us.
    Skipped,
}

/// Decides what to append after a job finishes.
pub struct FeedbackController {
    store: Arc<dyn WorkStore>,
    /// Harness for the pm and retrospect jobs the controller creates.
    /// `None` reuses the finished job's harness.
    feedback_harness: Option<String>,
}

impl FeedbackController {
    pub fn new(store: Arc<dyn WorkStore>, feedback_harness: Option<String>) -> Self {
        Self {
            store,
            feedback_harness,
        }
    }

    /// React to `job` reaching a terminal state. `job.result` must hold the
    /// result that was written.
    pub async fn on_job_finished(&self, job: &Job, success: bool) -> Result<FeedbackAction> {
        let assignment = self
            .store
            .get_assignment(job.assignment_id)
            .await?
            .with_context(|| format!("assignment {} not found", job.assignment_id))?;

        if assignment.status == AssignmentStatus::Complete {
            tracing::debug!(job_id = %job.id, "assignment already complete, no feedback");
            return Ok(FeedbackAction::Skipped);
        }

        let action = match (success, job.job_type) {
            (false, JobType::Retrospect) => self.on_retrospect_failed(job).await?,
            (false, _) => self.on_failure(job).await?,
            (true, JobType::Pm) => self.on_pm_success(job).await?,
            (true, _) => self.on_success(job).await?,
        };

        tracing::info!(
            job_id = %job.id,
            assignment_id = %job.assignment_id,
            job_type = %job.job_type,
            success,
            action = ?action,
            "feedback applied"
        );
        Ok(action)
    }

    fn harness_for(&self, job: &Job) -> String {
        self.feedback_harness
            .clone()
            .unwrap_or_else(|| job.harness.clone())
    }

    async fn on_failure(&self, job: &Job) -> Result<FeedbackAction> {
        let context = format!(
            "The {} job {} failed.\n\nResult excerpt:\n{}",
            job.job_type,
            job.id,
            excerpt(job.result.as_deref().unwrap_or(""), EXCERPT_CHARS),
        );
        let retrospect = NewJob::new(JobType::Retrospect, self.harness_for(job)).with_context(context);
        let (group, _) = self
            .store
            .insert_group_after(job.group_id, &[retrospect])
            .await
            .with_context(|| format!("failed to queue recovery for job {}", job.id))?;
        Ok(FeedbackAction::RecoveryQueued { group_id: group.id })
    }

    async fn on_retrospect_failed(&self, job: &Job) -> Result<FeedbackAction> {
        let reason = format!(
            "Retrospect failed: {}",
            one_line(job.result.as_deref().unwrap_or("no result"), 500)
        );
        self.block(job.assignment_id, reason).await
    }

    async fn on_success(&self, job: &Job) -> Result<FeedbackAction> {
        self.store
            .append_artifact(job.assignment_id, &log_line(job))
            .await?;

        let siblings = self.store.list_jobs_for_group(job.group_id).await?;
        if siblings.iter().any(|j| !j.status.is_terminal()) {
            return Ok(FeedbackAction::AwaitingSiblings);
        }

        let pm = NewJob::new(JobType::Pm, self.harness_for(job)).with_context(format!(
            "Review the outcome of the {} group that just finished and decide what comes next.",
            job.job_type
        ));
        // Atomic: refuses when anything was linked after this group.
        match self.store.append_group_if_tail(job.group_id, &[pm]).await? {
            Some((group, _)) => Ok(FeedbackAction::ReviewQueued { group_id: group.id }),
            None => Ok(FeedbackAction::SuccessorPresent),
        }
    }

    async fn on_pm_success(&self, job: &Job) -> Result<FeedbackAction> {
        let result = job.result.as_deref().unwrap_or("");
        self.store
            .append_decision(job.assignment_id, &log_line(job))
            .await?;

        if let Some(reason) = parse_blocked_reason(result) {
            return self.block(job.assignment_id, reason).await;
        }

        let group = self
            .store
            .get_group(job.group_id)
            .await?
            .with_context(|| format!("job group {} not found", job.group_id))?;
        if group.next_group_id.is_some() {
            return Ok(FeedbackAction::SuccessorPresent);
        }

        // Re-list everything: work may have been linked concurrently.
        let jobs = self.store.list_jobs_for_assignment(job.assignment_id).await?;
        if jobs
            .iter()
            .any(|j| matches!(j.status, JobStatus::Pending | JobStatus::Running))
        {
            return Ok(FeedbackAction::OutstandingWork);
        }

        let rows = self
            .store
            .transition_assignment(job.assignment_id, &OPEN, AssignmentStatus::Complete, None)
            .await?;
        if rows == 0 {
            return Ok(FeedbackAction::Skipped);
        }
        Ok(FeedbackAction::Completed)
    }

    async fn block(&self, assignment_id: Uuid, reason: String) -> Result<FeedbackAction> {
        let rows = self
            .store
            .transition_assignment(
                assignment_id,
                &OPEN,
                AssignmentStatus::Blocked,
                Some(&reason),
            )
            .await?;
        if rows == 0 {
            return Ok(FeedbackAction::Skipped);
        }
        tracing::warn!(assignment_id = %assignment_id, reason = %reason, "assignment blocked");
        Ok(FeedbackAction::Blocked { reason })
    }
}

/// Extract the reason from the first `BLOCKED: <reason>` line of a pm
/// result. Leading list or emphasis markup is tolerated.
pub fn parse_blocked_reason(result: &str) -> Option<String> {
    result.lines().find_map(|line| {
        let line = line.trim_start_matches(|c: char| c.is_whitespace() || matches!(c, '*' | '-' | '>' | '`'));
        let rest = line.strip_prefix(BLOCKED_MARKER)?;
        let reason = rest.trim().trim_end_matches(['*', '`']).trim();
        if reason.is_empty() {
            Some("pm requested human input without giving a reason".to_string())
        } else {
            Some(reason.to_string())
        }
    })
}

/// `[type job-id] result`, flattened to one line.
fn log_line(job: &Job) -> String {
    format!(
        "[{} {}] {}",
        job.job_type,
        job.id,
        one_line(job.result.as_deref().unwrap_or(""), EXCERPT_CHARS)
    )
}

/// Collapse whitespace runs (newlines included) and cap the length.
fn one_line(s: &str, max: usize) -> String {
    let flat = s.split_whitespace().collect::<Vec<_>>().join(" ");
    match flat.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...", &flat[..cut]),
        None => flat,
    }
}

/// The last `max` chars of `s`.
fn excerpt(s: &str, max: usize) -> &str {
    let count = s.chars().count();
    if count <= max {
        return s;
    }
    match s.char_indices().nth(count - max) {
        Some((start, _)) => &s[start..],
        None => s,
    }
}
