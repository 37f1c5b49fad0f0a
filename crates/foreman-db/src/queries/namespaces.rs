//! Database query functions for the `namespaces` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::Namespace;

/// Insert a new namespace. Names are unique.
pub async fn insert_namespace(
    pool: &PgPool,
    name: &str,
    project_path: Option<&str>,
) -> Result<Namespace> {
    sqlx::query_as::<_, Namespace>(
        "INSERT INTO namespaces (name, project_path) VALUES ($1, $2) RETURNING *",
    )
    .bind(name)
    .bind(project_path)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert namespace {name:?}"))
}

pub async fn get_namespace(pool: &PgPool, id: Uuid) -> Result<Option<Namespace>> {
    sqlx::query_as::<_, Namespace>("SELECT * FROM namespaces WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch namespace")
}

pub async fn get_namespace_by_name(pool: &PgPool, name: &str) -> Result<Option<Namespace>> {
    sqlx::query_as::<_, Namespace>("SELECT * FROM namespaces WHERE name = $1")
        .bind(name)
        .fetch_optional(pool)
        .await
        .context("failed to fetch namespace by name")
}

/// List all namespaces, alphabetically.
pub async fn list_namespaces(pool: &PgPool) -> Result<Vec<Namespace>> {
    sqlx::query_as::<_, Namespace>("SELECT * FROM namespaces ORDER BY name ASC")
        .fetch_all(pool)
        .await
        .context("failed to list namespaces")
}
