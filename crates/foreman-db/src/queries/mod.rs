//! Query functions, one module per table, plus the namespace snapshot loader.

pub mod assignments;
pub mod job_groups;
pub mod jobs;
pub mod namespaces;
pub mod snapshot;
