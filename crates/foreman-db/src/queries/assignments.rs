//! Database query functions for the `assignments` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Assignment, AssignmentStatus, Job, JobGroup, NewAssignment, NewJob};
use crate::queries::job_groups::insert_group_with_jobs;

/// Insert an assignment together with its head group and that group's jobs,
/// atomically.
///
/// An empty `head_jobs` slice creates the assignment with no chain at all;
/// groups can be appended later.
pub async fn create_assignment(
    pool: &PgPool,
    new: &NewAssignment,
    head_jobs: &[NewJob],
) -> Result<(Assignment, Option<JobGroup>, Vec<Job>)> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let assignment = sqlx::query_as::<_, Assignment>(
        "INSERT INTO assignments (namespace_id, north_star, independent, priority) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(new.namespace_id)
    .bind(&new.north_star)
    .bind(new.independent)
    .bind(new.priority)
    .fetch_one(&mut *tx)
    .await
    .context("failed to insert assignment")?;

    if head_jobs.is_empty() {
        tx.commit().await.context("failed to commit assignment")?;
        return Ok((assignment, None, Vec::new()));
    }

    let (group, jobs) =
        insert_group_with_jobs(&mut tx, assignment.id, assignment.namespace_id, None, head_jobs)
            .await?;

    let assignment = sqlx::query_as::<_, Assignment>(
        "UPDATE assignments SET head_group_id = $1 WHERE id = $2 RETURNING *",
    )
    .bind(group.id)
    .bind(assignment.id)
    .fetch_one(&mut *tx)
    .await
    .context("failed to set head group")?;

    tx.commit().await.context("failed to commit assignment")?;
    Ok((assignment, Some(group), jobs))
}

/// Fetch a single assignment by ID.
pub async fn get_assignment(pool: &PgPool, id: Uuid) -> Result<Option<Assignment>> {
    let assignment = sqlx::query_as::<_, Assignment>("SELECT * FROM assignments WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch assignment")?;

    Ok(assignment)
}

/// List all assignments of a namespace, ordered by creation time.
pub async fn list_assignments_for_namespace(
    pool: &PgPool,
    namespace_id: Uuid,
) -> Result<Vec<Assignment>> {
    let assignments = sqlx::query_as::<_, Assignment>(
        "SELECT * FROM assignments WHERE namespace_id = $1 ORDER BY created_at ASC, id ASC",
    )
    .bind(namespace_id)
    .fetch_all(pool)
    .await
    .context("failed to list assignments for namespace")?;

    Ok(assignments)
}

/// Unconditionally set an assignment's status. `blocked_reason` is stored
/// as given, so passing `None` clears it.
pub async fn update_assignment_status(
    pool: &PgPool,
    id: Uuid,
    status: AssignmentStatus,
    blocked_reason: Option<&str>,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE assignments SET status = $1, blocked_reason = $2, updated_at = NOW() \
         WHERE id = $3",
    )
    .bind(status)
    .bind(blocked_reason)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to update assignment status")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("assignment {id} not found");
    }

    Ok(())
}

/// Move an assignment to `to` only if its current status is one of `from`.
///
/// Returns the number of rows affected: 1 on success, 0 if the assignment
/// was not in an expected status (or does not exist).
pub async fn transition_assignment_status(
    pool: &PgPool,
    id: Uuid,
    from: &[AssignmentStatus],
    to: AssignmentStatus,
    blocked_reason: Option<&str>,
) -> Result<u64> {
    let from: Vec<String> = from.iter().map(ToString::to_string).collect();
    let result = sqlx::query(
        "UPDATE assignments SET status = $1, blocked_reason = $2, updated_at = NOW() \
         WHERE id = $3 AND status = ANY($4)",
    )
    .bind(to)
    .bind(blocked_reason)
    .bind(id)
    .bind(&from)
    .execute(pool)
    .await
    .with_context(|| format!("failed to transition assignment {id} to {to}"))?;

    Ok(result.rows_affected())
}

/// Append one line to the assignment's artifact log.
pub async fn append_artifact(pool: &PgPool, id: Uuid, line: &str) -> Result<()> {
    append_line(pool, id, "artifacts", line).await
}

/// Append one line to the assignment's decision log.
pub async fn append_decision(pool: &PgPool, id: Uuid, line: &str) -> Result<()> {
    append_line(pool, id, "decisions", line).await
}

async fn append_line(pool: &PgPool, id: Uuid, column: &'static str, line: &str) -> Result<()> {
    // Single statement so concurrent appends never lose a line.
    let query = format!(
        "UPDATE assignments SET {column} = {column} || $1 || E'\\n', updated_at = NOW() \
         WHERE id = $2"
    );
    let result = sqlx::query(&query)
        .bind(line)
        .bind(id)
        .execute(pool)
        .await
        .with_context(|| format!("failed to append to {column}"))?;

    if result.rows_affected() == 0 {
        anyhow::bail!("assignment {id} not found");
    }

    Ok(())
}
