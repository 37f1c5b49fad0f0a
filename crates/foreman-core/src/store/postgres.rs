//! PostgreSQL-backed [`WorkStore`].
//!
//! Writes delegate to `foreman_db::queries`. Subscriptions hold a dedicated
//! `LISTEN` connection on [`pool::CHANGE_CHANNEL`]; the schema triggers
//! publish the namespace id of every changed row, and each matching
//! notification reloads the namespace snapshot. A lost `LISTEN` connection
//! ends the stream with an error.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use foreman_db::models::{
    Assignment, AssignmentStatus, Job, JobGroup, JobStatus, Namespace, NamespaceSnapshot,
    NewAssignment, NewJob,
};
use foreman_db::pool;
use foreman_db::queries::{assignments, job_groups, jobs, namespaces, snapshot};

use super::{CreatedGroup, SnapshotStream, WorkStore};

/// [`WorkStore`] over a PostgreSQL pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

async fn load(pool: &PgPool, namespace_id: Uuid) -> Result<NamespaceSnapshot> {
    snapshot::load_snapshot(pool, namespace_id)
        .await?
        .with_context(|| format!("namespace {namespace_id} not found"))
}

#[async_trait]
impl WorkStore for PgStore {
    async fn create_namespace(&self, name: &str, project_path: Option<&str>) -> Result<Namespace> {
        namespaces::insert_namespace(&self.pool, name, project_path).await
    }

    async fn namespace_by_name(&self, name: &str) -> Result<Option<Namespace>> {
        namespaces::get_namespace_by_name(&self.pool, name).await
    }

    async fn list_namespaces(&self) -> Result<Vec<Namespace>> {
        namespaces::list_namespaces(&self.pool).await
    }

    async fn snapshot(&self, namespace_id: Uuid) -> Result<NamespaceSnapshot> {
        load(&self.pool, namespace_id).await
    }

    async fn subscribe(&self, namespace_id: Uuid) -> Result<SnapshotStream> {
        // Listen before the first load so no change can slip in between.
        let mut listener = pool::connect_listener(&self.pool).await?;
        let pool = self.pool.clone();
        let wanted = namespace_id.to_string();

        let stream = async_stream::try_stream! {
            yield load(&pool, namespace_id).await?;
            loop {
                // `recv` would reconnect silently and drop whatever was
                // published meanwhile; end the stream so the caller
                // re-subscribes and reloads instead.
                let note = listener
                    .try_recv()
                    .await
                    .context("change listener failed")?
                    .context("change listener lost its connection")?;
                if note.payload() != wanted {
                    continue;
                }
                debug!(namespace_id = %namespace_id, "change notification");
                yield load(&pool, namespace_id).await?;
            }
        };
        Ok(Box::pin(stream))
    }

    async fn create_assignment(
        &self,
        new: &NewAssignment,
        head_jobs: &[NewJob],
    ) -> Result<(Assignment, Option<JobGroup>, Vec<Job>)> {
        assignments::create_assignment(&self.pool, new, head_jobs).await
    }

    async fn get_assignment(&self, id: Uuid) -> Result<Option<Assignment>> {
        assignments::get_assignment(&self.pool, id).await
    }

    async fn list_assignments(&self, namespace_id: Uuid) -> Result<Vec<Assignment>> {
        assignments::list_assignments_for_namespace(&self.pool, namespace_id).await
    }

    async fn transition_assignment(
        &self,
        id: Uuid,
        from: &[AssignmentStatus],
        to: AssignmentStatus,
        reason: Option<&str>,
    ) -> Result<u64> {
        assignments::transition_assignment_status(&self.pool, id, from, to, reason).await
    }

    async fn append_artifact(&self, assignment_id: Uuid, line: &str) -> Result<()> {
        assignments::append_artifact(&self.pool, assignment_id, line).await
    }

    async fn append_decision(&self, assignment_id: Uuid, line: &str) -> Result<()> {
        assignments::append_decision(&self.pool, assignment_id, line).await
    }

    async fn get_group(&self, id: Uuid) -> Result<Option<JobGroup>> {
        job_groups::get_job_group(&self.pool, id).await
    }

    async fn insert_group_after(
        &self,
        after_group_id: Uuid,
        jobs: &[NewJob],
    ) -> Result<CreatedGroup> {
        job_groups::insert_group_after(&self.pool, after_group_id, jobs).await
    }

    async fn insert_group_before(
        &self,
        from_group_id: Uuid,
        boundary: Option<Uuid>,
        jobs: &[NewJob],
    ) -> Result<CreatedGroup> {
        job_groups::insert_group_before(&self.pool, from_group_id, boundary, jobs).await
    }

    async fn append_group_if_tail(
        &self,
        after_group_id: Uuid,
        jobs: &[NewJob],
    ) -> Result<Option<CreatedGroup>> {
        job_groups::append_group_if_tail(&self.pool, after_group_id, jobs).await
    }

    async fn append_group_at_tail(
        &self,
        assignment_id: Uuid,
        jobs: &[NewJob],
    ) -> Result<CreatedGroup> {
        job_groups::append_group_at_tail(&self.pool, assignment_id, jobs).await
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        jobs::get_job(&self.pool, id).await
    }

    async fn list_jobs_for_assignment(&self, assignment_id: Uuid) -> Result<Vec<Job>> {
        jobs::list_jobs_for_assignment(&self.pool, assignment_id).await
    }

    async fn list_jobs_for_group(&self, group_id: Uuid) -> Result<Vec<Job>> {
        jobs::list_jobs_for_group(&self.pool, group_id).await
    }

    async fn list_running_jobs(&self, namespace_id: Uuid) -> Result<Vec<Job>> {
        jobs::list_running_jobs(&self.pool, namespace_id).await
    }

    async fn start_job(&self, id: Uuid, prompt: &str) -> Result<u64> {
        jobs::start_job(&self.pool, id, prompt).await
    }

    async fn finish_job(
        &self,
        id: Uuid,
        status: JobStatus,
        result: &str,
        resume_token: Option<&str>,
    ) -> Result<u64> {
        jobs::finish_job(&self.pool, id, status, result, resume_token).await
    }
}
