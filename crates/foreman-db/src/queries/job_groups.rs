//! Database query functions for the `job_groups` table.
//!
//! Groups are never edited after creation except for their `next_group_id`
//! pointer, which is how the chain grows. Every chain edit runs in a
//! transaction that row-locks the predecessor group, so two writers cannot
//! both attach a successor to the same tail.

use anyhow::{Context, Result, bail};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::models::{Job, JobGroup, NewJob};

/// Fetch a single group by ID.
pub async fn get_job_group(pool: &PgPool, id: Uuid) -> Result<Option<JobGroup>> {
    sqlx::query_as::<_, JobGroup>("SELECT * FROM job_groups WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch job group")
}

/// List every group of an assignment in creation order (not chain order).
pub async fn list_groups_for_assignment(pool: &PgPool, assignment_id: Uuid) -> Result<Vec<JobGroup>> {
    sqlx::query_as::<_, JobGroup>(
        "SELECT * FROM job_groups WHERE assignment_id = $1 ORDER BY created_at ASC, id ASC",
    )
    .bind(assignment_id)
    .fetch_all(pool)
    .await
    .context("failed to list job groups for assignment")
}

/// Insert a group and its jobs on an open connection or transaction.
pub(crate) async fn insert_group_with_jobs(
    conn: &mut PgConnection,
    assignment_id: Uuid,
    namespace_id: Uuid,
    next_group_id: Option<Uuid>,
    jobs: &[NewJob],
) -> Result<(JobGroup, Vec<Job>)> {
    let group = sqlx::query_as::<_, JobGroup>(
        "INSERT INTO job_groups (assignment_id, namespace_id, next_group_id) \
         VALUES ($1, $2, $3) \
         RETURNING *",
    )
    .bind(assignment_id)
    .bind(namespace_id)
    .bind(next_group_id)
    .fetch_one(&mut *conn)
    .await
    .context("failed to insert job group")?;

    let mut inserted = Vec::with_capacity(jobs.len());
    for job in jobs {
        let row = sqlx::query_as::<_, Job>(
            "INSERT INTO jobs (group_id, assignment_id, namespace_id, job_type, harness, context) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING *",
        )
        .bind(group.id)
        .bind(assignment_id)
        .bind(namespace_id)
        .bind(job.job_type)
        .bind(&job.harness)
        .bind(job.context.as_deref())
        .fetch_one(&mut *conn)
        .await
        .context("failed to insert job")?;
        inserted.push(row);
    }

    Ok((group, inserted))
}

async fn lock_group(conn: &mut PgConnection, id: Uuid) -> Result<JobGroup> {
    sqlx::query_as::<_, JobGroup>("SELECT * FROM job_groups WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .context("failed to lock job group")?
        .with_context(|| format!("job group {id} not found"))
}

async fn set_next(conn: &mut PgConnection, id: Uuid, next: Uuid) -> Result<()> {
    sqlx::query("UPDATE job_groups SET next_group_id = $1 WHERE id = $2")
        .bind(next)
        .bind(id)
        .execute(&mut *conn)
        .await
        .context("failed to link job group")?;
    Ok(())
}

/// Splice a new group directly after `after_group_id`, inheriting its old
/// successor.
pub async fn insert_group_after(
    pool: &PgPool,
    after_group_id: Uuid,
    jobs: &[NewJob],
) -> Result<(JobGroup, Vec<Job>)> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;
    let after = lock_group(&mut tx, after_group_id).await?;
    let (group, inserted) = insert_group_with_jobs(
        &mut tx,
        after.assignment_id,
        after.namespace_id,
        after.next_group_id,
        jobs,
    )
    .await?;
    set_next(&mut tx, after.id, group.id).await?;
    tx.commit().await.context("failed to commit group splice")?;
    Ok((group, inserted))
}

/// Walk the chain from `from_group_id` to the group just before `boundary`
/// (the tail when `None`) and splice a new group there. Every visited group
/// stays locked until commit, so concurrent splices serialize.
pub async fn insert_group_before(
    pool: &PgPool,
    from_group_id: Uuid,
    boundary: Option<Uuid>,
    jobs: &[NewJob],
) -> Result<(JobGroup, Vec<Job>)> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;
    let mut at = lock_group(&mut tx, from_group_id).await?;
    let mut hops = 0usize;
    while let Some(next) = at.next_group_id {
        if Some(next) == boundary {
            break;
        }
        hops += 1;
        if hops > 10_000 {
            bail!("chain starting at {from_group_id} does not terminate");
        }
        at = lock_group(&mut tx, next).await?;
    }
    let (group, inserted) = insert_group_with_jobs(
        &mut tx,
        at.assignment_id,
        at.namespace_id,
        at.next_group_id,
        jobs,
    )
    .await?;
    set_next(&mut tx, at.id, group.id).await?;
    tx.commit().await.context("failed to commit group splice")?;
    Ok((group, inserted))
}

/// Append a new group after `after_group_id` only if that group is still the
/// tail of its chain. Returns `None` when another writer got there first.
pub async fn append_group_if_tail(
    pool: &PgPool,
    after_group_id: Uuid,
    jobs: &[NewJob],
) -> Result<Option<(JobGroup, Vec<Job>)>> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;
    let after = lock_group(&mut tx, after_group_id).await?;
    if after.next_group_id.is_some() {
        tx.rollback().await.context("failed to roll back")?;
        return Ok(None);
    }
    let (group, inserted) =
        insert_group_with_jobs(&mut tx, after.assignment_id, after.namespace_id, None, jobs)
            .await?;
    set_next(&mut tx, after.id, group.id).await?;
    tx.commit().await.context("failed to commit group append")?;
    Ok(Some((group, inserted)))
}

/// Append a new group at the tail of an assignment's chain. An assignment
/// without any groups gets the new group as its head.
pub async fn append_group_at_tail(
    pool: &PgPool,
    assignment_id: Uuid,
    jobs: &[NewJob],
) -> Result<(JobGroup, Vec<Job>)> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let (namespace_id, head): (Uuid, Option<Uuid>) = sqlx::query_as(
        "SELECT namespace_id, head_group_id FROM assignments WHERE id = $1 FOR UPDATE",
    )
    .bind(assignment_id)
    .fetch_optional(&mut *tx)
    .await
    .context("failed to lock assignment")?
    .with_context(|| format!("assignment {assignment_id} not found"))?;

    let Some(head) = head else {
        let (group, inserted) =
            insert_group_with_jobs(&mut tx, assignment_id, namespace_id, None, jobs).await?;
        sqlx::query("UPDATE assignments SET head_group_id = $1, updated_at = NOW() WHERE id = $2")
            .bind(group.id)
            .bind(assignment_id)
            .execute(&mut *tx)
            .await
            .context("failed to set head group")?;
        tx.commit().await.context("failed to commit group append")?;
        return Ok((group, inserted));
    };

    // Walk the chain under lock to find the tail.
    let mut tail = lock_group(&mut tx, head).await?;
    let mut hops = 0usize;
    while let Some(next) = tail.next_group_id {
        hops += 1;
        if hops > 10_000 {
            bail!("chain of assignment {assignment_id} does not terminate");
        }
        tail = lock_group(&mut tx, next).await?;
    }

    let (group, inserted) =
        insert_group_with_jobs(&mut tx, assignment_id, namespace_id, None, jobs).await?;
    set_next(&mut tx, tail.id, group.id).await?;
    tx.commit().await.context("failed to commit group append")?;
    Ok((group, inserted))
}
