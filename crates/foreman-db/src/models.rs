use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of an assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Pending,
    Active,
    Blocked,
    Complete,
}

impl AssignmentStatus {
    /// Whether new jobs of an assignment in this status may be admitted.
    pub fn is_schedulable(self) -> bool {
        matches!(self, Self::Pending | Self::Active)
    }
}

impl fmt::Display for AssignmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Blocked => "blocked",
            Self::Complete => "complete",
        };
        f.write_str(s)
    }
}

impl FromStr for AssignmentStatus {
    type Err = AssignmentStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "blocked" => Ok(Self::Blocked),
            "complete" => Ok(Self::Complete),
            other => Err(AssignmentStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`AssignmentStatus`] string.
#[derive(Debug, Clone)]
pub struct AssignmentStatusParseError(pub String);

impl fmt::Display for AssignmentStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid assignment status: {:?}", self.0)
    }
}

impl std::error::Error for AssignmentStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Complete,
    Failed,
}

impl JobStatus {
    /// `complete` or `failed`: the job will never change status again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for JobStatus {
    type Err = JobStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            other => Err(JobStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`JobStatus`] string.
#[derive(Debug, Clone)]
pub struct JobStatusParseError(pub String);

impl fmt::Display for JobStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid job status: {:?}", self.0)
    }
}

impl std::error::Error for JobStatusParseError {}

// ---------------------------------------------------------------------------

/// Kind of work a job performs.
///
/// `Pm` (review/decision) and `Retrospect` (failure diagnosis) are the two
/// types the feedback loop appends on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Plan,
    Implement,
    Review,
    Uat,
    Verify,
    Research,
    Pm,
    Retrospect,
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Plan => "plan",
            Self::Implement => "implement",
            Self::Review => "review",
            Self::Uat => "uat",
            Self::Verify => "verify",
            Self::Research => "research",
            Self::Pm => "pm",
            Self::Retrospect => "retrospect",
        };
        f.write_str(s)
    }
}

impl FromStr for JobType {
    type Err = JobTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plan" => Ok(Self::Plan),
            "implement" => Ok(Self::Implement),
            "review" => Ok(Self::Review),
            "uat" => Ok(Self::Uat),
            "verify" => Ok(Self::Verify),
            "research" => Ok(Self::Research),
            "pm" => Ok(Self::Pm),
            "retrospect" => Ok(Self::Retrospect),
            other => Err(JobTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`JobType`] string.
#[derive(Debug, Clone)]
pub struct JobTypeParseError(pub String);

impl fmt::Display for JobTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid job type: {:?}", self.0)
    }
}

impl std::error::Error for JobTypeParseError {}

// ---------------------------------------------------------------------------

/// Aggregate status of a job group, derived from its jobs. Never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    /// Nothing has started yet.
    Pending,
    /// At least one job is running, or some jobs are done and others not.
    Running,
    /// Every job is terminal and none failed.
    Complete,
    /// Every job is terminal and at least one failed.
    Failed,
}

impl GroupStatus {
    /// Derive a group's status from the statuses of its jobs.
    ///
    /// An empty group counts as complete so it never stalls its chain.
    pub fn derive(statuses: impl IntoIterator<Item = JobStatus>) -> Self {
        let mut any = false;
        let mut all_pending = true;
        let mut all_terminal = true;
        let mut any_failed = false;
        for status in statuses {
            any = true;
            all_pending &= status == JobStatus::Pending;
            all_terminal &= status.is_terminal();
            any_failed |= status == JobStatus::Failed;
        }
        if !any {
            return Self::Complete;
        }
        match (all_terminal, any_failed, all_pending) {
            (true, true, _) => Self::Failed,
            (true, false, _) => Self::Complete,
            (false, _, true) => Self::Pending,
            (false, _, false) => Self::Running,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

impl fmt::Display for GroupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// Isolation boundary for one external project.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Namespace {
    pub id: Uuid,
    pub name: String,
    pub project_path: Option<String>,
    pub pending_count: i64,
    pub active_count: i64,
    pub blocked_count: i64,
    pub complete_count: i64,
    pub created_at: DateTime<Utc>,
}

/// One human-level objective with its own chain of job groups.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Assignment {
    pub id: Uuid,
    pub namespace_id: Uuid,
    pub north_star: String,
    pub status: AssignmentStatus,
    pub independent: bool,
    pub priority: i32,
    pub artifacts: String,
    pub decisions: String,
    pub blocked_reason: Option<String>,
    pub head_group_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One link in an assignment's chain. Its jobs run in parallel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct JobGroup {
    pub id: Uuid,
    pub assignment_id: Uuid,
    pub namespace_id: Uuid,
    pub next_group_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// One unit of work executed by exactly one agent process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Job {
    pub id: Uuid,
    pub group_id: Uuid,
    pub assignment_id: Uuid,
    pub namespace_id: Uuid,
    pub job_type: JobType,
    pub harness: String,
    pub context: Option<String>,
    pub status: JobStatus,
    pub result: Option<String>,
    pub prompt: Option<String>,
    pub resume_token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Fields for a job that is about to be inserted as part of a new group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJob {
    pub job_type: JobType,
    pub harness: String,
    pub context: Option<String>,
}

impl NewJob {
    pub fn new(job_type: JobType, harness: impl Into<String>) -> Self {
        Self {
            job_type,
            harness: harness.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

/// Fields for a new assignment. The head group is created alongside it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAssignment {
    pub namespace_id: Uuid,
    pub north_star: String,
    pub independent: bool,
    pub priority: i32,
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Point-in-time view of every scheduling-relevant record in one namespace.
///
/// This is what the store pushes to subscribers and what the scheduler
/// evaluates. Collections are ordered by creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceSnapshot {
    pub namespace: Namespace,
    pub assignments: Vec<Assignment>,
    pub groups: Vec<JobGroup>,
    pub jobs: Vec<Job>,
}

impl NamespaceSnapshot {
    pub fn assignment(&self, id: Uuid) -> Option<&Assignment> {
        self.assignments.iter().find(|a| a.id == id)
    }

    pub fn group(&self, id: Uuid) -> Option<&JobGroup> {
        self.groups.iter().find(|g| g.id == id)
    }

    pub fn job(&self, id: Uuid) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id == id)
    }

    /// Jobs belonging to a group, in creation order.
    pub fn jobs_in_group(&self, group_id: Uuid) -> impl Iterator<Item = &Job> {
        self.jobs.iter().filter(move |j| j.group_id == group_id)
    }

    pub fn group_status(&self, group_id: Uuid) -> GroupStatus {
        GroupStatus::derive(self.jobs_in_group(group_id).map(|j| j.status))
    }

    /// Walk an assignment's chain from its head.
    ///
    /// Stops at the tail, at a dangling pointer, or at the first group seen
    /// twice, so a corrupted chain can never loop forever.
    pub fn chain(&self, assignment_id: Uuid) -> Vec<&JobGroup> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = self
            .assignment(assignment_id)
            .and_then(|a| a.head_group_id);
        while let Some(id) = cursor {
            if !seen.insert(id) {
                break;
            }
            let Some(group) = self.group(id) else {
                break;
            };
            chain.push(group);
            cursor = group.next_group_id;
        }
        chain
    }

    /// Whether any job of the assignment is currently running.
    pub fn has_running_job(&self, assignment_id: Uuid) -> bool {
        self.jobs
            .iter()
            .any(|j| j.assignment_id == assignment_id && j.status == JobStatus::Running)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
