//! Persistence layer: models, connection pool, migrations and queries.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
