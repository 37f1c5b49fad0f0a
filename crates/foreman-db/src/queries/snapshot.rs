//! Consistent whole-namespace reads.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Assignment, Job, JobGroup, Namespace, NamespaceSnapshot};

/// Load every scheduling-relevant row of a namespace from one consistent
/// view of the database.
///
/// Returns `None` if the namespace does not exist.
pub async fn load_snapshot(pool: &PgPool, namespace_id: Uuid) -> Result<Option<NamespaceSnapshot>> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;
    sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
        .execute(&mut *tx)
        .await
        .context("failed to set snapshot isolation")?;

    let Some(namespace) = sqlx::query_as::<_, Namespace>("SELECT * FROM namespaces WHERE id = $1")
        .bind(namespace_id)
        .fetch_optional(&mut *tx)
        .await
        .context("failed to fetch namespace")?
    else {
        tx.rollback().await.context("failed to end snapshot")?;
        return Ok(None);
    };

    let assignments = sqlx::query_as::<_, Assignment>(
        "SELECT * FROM assignments WHERE namespace_id = $1 ORDER BY created_at ASC, id ASC",
    )
    .bind(namespace_id)
    .fetch_all(&mut *tx)
    .await
    .context("failed to load assignments")?;

    let groups = sqlx::query_as::<_, JobGroup>(
        "SELECT * FROM job_groups WHERE namespace_id = $1 ORDER BY created_at ASC, id ASC",
    )
    .bind(namespace_id)
    .fetch_all(&mut *tx)
    .await
    .context("failed to load job groups")?;

    let jobs = sqlx::query_as::<_, Job>(
        "SELECT * FROM jobs WHERE namespace_id = $1 ORDER BY created_at ASC, id ASC",
    )
    .bind(namespace_id)
    .fetch_all(&mut *tx)
    .await
    .context("failed to load jobs")?;

    tx.commit().await.context("failed to end snapshot")?;

    Ok(Some(NamespaceSnapshot {
        namespace,
        assignments,
        groups,
        jobs,
    }))
}
