//! Database query functions for the `jobs` table.
//!
//! Job status changes are optimistic: every write is guarded by the status
//! the caller expects, and the number of rows affected tells the caller
//! whether it won.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Job, JobStatus};

/// Fetch a single job by ID.
pub async fn get_job(pool: &PgPool, id: Uuid) -> Result<Option<Job>> {
    let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch job")?;

    Ok(job)
}

/// List all jobs of an assignment, ordered by creation time.
pub async fn list_jobs_for_assignment(pool: &PgPool, assignment_id: Uuid) -> Result<Vec<Job>> {
    let jobs = sqlx::query_as::<_, Job>(
        "SELECT * FROM jobs WHERE assignment_id = $1 ORDER BY created_at ASC, id ASC",
    )
    .bind(assignment_id)
    .fetch_all(pool)
    .await
    .context("failed to list jobs for assignment")?;

    Ok(jobs)
}

/// List all jobs of a group, ordered by creation time.
pub async fn list_jobs_for_group(pool: &PgPool, group_id: Uuid) -> Result<Vec<Job>> {
    let jobs = sqlx::query_as::<_, Job>(
        "SELECT * FROM jobs WHERE group_id = $1 ORDER BY created_at ASC, id ASC",
    )
    .bind(group_id)
    .fetch_all(pool)
    .await
    .context("failed to list jobs for group")?;

    Ok(jobs)
}

/// List every job of a namespace that is currently marked running.
pub async fn list_running_jobs(pool: &PgPool, namespace_id: Uuid) -> Result<Vec<Job>> {
    let jobs = sqlx::query_as::<_, Job>(
        "SELECT * FROM jobs WHERE namespace_id = $1 AND status = 'running' \
         ORDER BY started_at ASC NULLS LAST, id ASC",
    )
    .bind(namespace_id)
    .fetch_all(pool)
    .await
    .context("failed to list running jobs")?;

    Ok(jobs)
}

/// Transition a job from `pending` to `running`, recording the rendered
/// prompt and the start time.
///
/// Returns rows affected: 0 means the job was no longer pending.
pub async fn start_job(pool: &PgPool, id: Uuid, prompt: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE jobs SET status = 'running', prompt = $1, started_at = NOW() \
         WHERE id = $2 AND status = 'pending'",
    )
    .bind(prompt)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to start job")?;

    Ok(result.rows_affected())
}

/// Transition a job from `running` to a terminal status, recording its
/// result, resume token and completion time.
///
/// Returns rows affected: 0 means the job was not running.
pub async fn finish_job(
    pool: &PgPool,
    id: Uuid,
    status: JobStatus,
    result: &str,
    resume_token: Option<&str>,
) -> Result<u64> {
    if !status.is_terminal() {
        anyhow::bail!("cannot finish job {id} with non-terminal status {status}");
    }

    let outcome = sqlx::query(
        "UPDATE jobs SET status = $1, result = $2, resume_token = $3, completed_at = NOW() \
         WHERE id = $4 AND status = 'running'",
    )
    .bind(status)
    .bind(result)
    .bind(resume_token)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to finish job")?;

    Ok(outcome.rows_affected())
}
