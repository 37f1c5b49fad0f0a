//! The work store contract consumed by the runner and feedback loop.
//!
//! A store owns every Namespace, Assignment, JobGroup and Job record. Besides
//! typed reads and writes it exposes [`WorkStore::subscribe`], a push stream
//! that re-delivers a namespace snapshot whenever anything in it changes.
//!
//! ```text
//! write ──> store ──notify──> subscribe() ──> NamespaceSnapshot ──> scheduler
//! ```
//!
//! Two implementations ship: [`PgStore`] (PostgreSQL, LISTEN/NOTIFY) and
//! [`MemoryStore`] (in-process, watch channel).

pub mod memory;
pub mod postgres;

use std::pin::Pin;

use anyhow::Result;
use async_trait::async_trait;
use futures::Stream;
use uuid::Uuid;

use foreman_db::models::{
    Assignment, AssignmentStatus, Job, JobGroup, JobStatus, Namespace, NamespaceSnapshot,
    NewAssignment, NewJob,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Stream of namespace snapshots. An `Err` item means the subscription is
/// broken and will yield nothing further.
pub type SnapshotStream = Pin<Box<dyn Stream<Item = Result<NamespaceSnapshot>> + Send>>;

/// A newly created group together with its jobs.
pub type CreatedGroup = (JobGroup, Vec<Job>);

/// Durable, observable storage for the work graph.
///
/// Status writes are optimistic: methods returning `u64` report the number
/// of rows they changed, and 0 means the guard status did not match.
#[async_trait]
pub trait WorkStore: Send + Sync {
    // -- namespaces ---------------------------------------------------------

    async fn create_namespace(&self, name: &str, project_path: Option<&str>) -> Result<Namespace>;

    async fn namespace_by_name(&self, name: &str) -> Result<Option<Namespace>>;

    async fn list_namespaces(&self) -> Result<Vec<Namespace>>;

    /// Current snapshot of one namespace. Errors if it does not exist.
    async fn snapshot(&self, namespace_id: Uuid) -> Result<NamespaceSnapshot>;

    /// Subscribe to a namespace. The first item is the current snapshot;
    /// each later item follows one or more changes.
    async fn subscribe(&self, namespace_id: Uuid) -> Result<SnapshotStream>;

    // -- assignments --------------------------------------------------------

    /// Create an assignment and, when `head_jobs` is non-empty, its head
    /// group, in one atomic step.
    async fn create_assignment(
        &self,
        new: &NewAssignment,
        head_jobs: &[NewJob],
    ) -> Result<(Assignment, Option<JobGroup>, Vec<Job>)>;

    async fn get_assignment(&self, id: Uuid) -> Result<Option<Assignment>>;

    async fn list_assignments(&self, namespace_id: Uuid) -> Result<Vec<Assignment>>;

    /// Move an assignment to `to` if its status is one of `from`, storing
    /// `reason` as its blocked reason.
    async fn transition_assignment(
        &self,
        id: Uuid,
        from: &[AssignmentStatus],
        to: AssignmentStatus,
        reason: Option<&str>,
    ) -> Result<u64>;

    async fn append_artifact(&self, assignment_id: Uuid, line: &str) -> Result<()>;

    async fn append_decision(&self, assignment_id: Uuid, line: &str) -> Result<()>;

    // -- groups -------------------------------------------------------------

    async fn get_group(&self, id: Uuid) -> Result<Option<JobGroup>>;

    /// Splice a group right after `after_group_id`.
    async fn insert_group_after(&self, after_group_id: Uuid, jobs: &[NewJob])
    -> Result<CreatedGroup>;

    /// Walk the chain from `from_group_id` to the group just before
    /// `boundary` (the tail when `None`) and splice a group there. Repeated
    /// calls with the same boundary keep their call order.
    async fn insert_group_before(
        &self,
        from_group_id: Uuid,
        boundary: Option<Uuid>,
        jobs: &[NewJob],
    ) -> Result<CreatedGroup>;

    /// Append after `after_group_id` only if it is still the tail.
    async fn append_group_if_tail(
        &self,
        after_group_id: Uuid,
        jobs: &[NewJob],
    ) -> Result<Option<CreatedGroup>>;

    /// Append at the tail of the chain, or as the head of an empty chain.
    async fn append_group_at_tail(&self, assignment_id: Uuid, jobs: &[NewJob])
    -> Result<CreatedGroup>;

    // -- jobs ---------------------------------------------------------------

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>>;

    async fn list_jobs_for_assignment(&self, assignment_id: Uuid) -> Result<Vec<Job>>;

    async fn list_jobs_for_group(&self, group_id: Uuid) -> Result<Vec<Job>>;

    async fn list_running_jobs(&self, namespace_id: Uuid) -> Result<Vec<Job>>;

    /// `pending -> running`, recording the prompt.
    async fn start_job(&self, id: Uuid, prompt: &str) -> Result<u64>;

    /// `running -> complete | failed`, recording result and resume token.
    async fn finish_job(
        &self,
        id: Uuid,
        status: JobStatus,
        result: &str,
        resume_token: Option<&str>,
    ) -> Result<u64>;
}

// Compile-time assertion: WorkStore must be usable as `dyn WorkStore`.
const _: () = {
    fn _assert_object_safe(_: &dyn WorkStore) {}
};
