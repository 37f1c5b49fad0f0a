//! `foreman group append`: link a new job group into an assignment's chain.
//!
//! Operators append at the tail of a chain. A running agent uses
//! `--after-current`, which links the group behind the group of the job
//! named by `FOREMAN_JOB_ID`, ahead of `FOREMAN_NEXT_GROUP_ID` (that group's
//! successor when the job started). Repeated calls keep their order, and
//! the runner observes the job as having linked its own successor.

use anyhow::{Context, Result, bail};
use uuid::Uuid;

use foreman_core::store::{CreatedGroup, WorkStore};
use foreman_db::models::{AssignmentStatus, NewJob};

/// Where the new group goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendTarget {
    Tail { assignment_id: Uuid },
    AfterJob {
        assignment_id: Uuid,
        job_id: Uuid,
        /// The successor of the job's group at launch; `None` for the tail.
        boundary: Option<Uuid>,
    },
}

impl AppendTarget {
    /// Build the target from the CLI flags, reading the agent environment
    /// through `env` for `--after-current`.
    pub fn from_args(
        assignment: Option<&str>,
        after_current: bool,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        if after_current {
            let job_id = env_id(&env, "FOREMAN_JOB_ID")?;
            let assignment_id = match assignment {
                Some(raw) => parse(raw, "assignment ID")?,
                None => env_id(&env, "FOREMAN_ASSIGNMENT_ID")?,
            };
            let boundary = match env("FOREMAN_NEXT_GROUP_ID").filter(|v| !v.trim().is_empty()) {
                Some(raw) => Some(parse(&raw, "FOREMAN_NEXT_GROUP_ID")?),
                None => None,
            };
            return Ok(Self::AfterJob {
                assignment_id,
                job_id,
                boundary,
            });
        }
        match assignment {
            Some(raw) => Ok(Self::Tail {
                assignment_id: parse(raw, "assignment ID")?,
            }),
            None => bail!("pass --assignment <id> or --after-current"),
        }
    }

    fn assignment_id(self) -> Uuid {
        match self {
            Self::Tail { assignment_id } | Self::AfterJob { assignment_id, .. } => assignment_id,
        }
    }
}

fn env_id(env: &impl Fn(&str) -> Option<String>, var: &str) -> Result<Uuid> {
    let raw = env(var).with_context(|| {
        format!("--after-current needs {var}; it is set for agents launched by `foreman run`")
    })?;
    parse(&raw, var)
}

fn parse(raw: &str, what: &str) -> Result<Uuid> {
    Uuid::parse_str(raw.trim()).with_context(|| format!("invalid {what}: {raw}"))
}

/// Append `jobs` as one group at `target`.
pub async fn append_group(
    store: &dyn WorkStore,
    target: AppendTarget,
    jobs: &[NewJob],
) -> Result<CreatedGroup> {
    if jobs.is_empty() {
        bail!("a group needs at least one --job");
    }
    let assignment_id = target.assignment_id();
    let assignment = store
        .get_assignment(assignment_id)
        .await?
        .with_context(|| format!("assignment {assignment_id} not found"))?;
    if assignment.status == AssignmentStatus::Complete {
        bail!("assignment {assignment_id} is complete; create a new assignment instead");
    }

    let created = match target {
        AppendTarget::Tail { assignment_id } => {
            store.append_group_at_tail(assignment_id, jobs).await?
        }
        AppendTarget::AfterJob {
            assignment_id,
            job_id,
            boundary,
        } => {
            let job = store
                .get_job(job_id)
                .await?
                .with_context(|| format!("job {job_id} not found"))?;
            if job.assignment_id != assignment_id {
                bail!("job {job_id} does not belong to assignment {assignment_id}");
            }
            store.insert_group_before(job.group_id, boundary, jobs).await?
        }
    };

    tracing::info!(
        assignment_id = %assignment_id,
        group_id = %created.0.id,
        jobs = created.1.len(),
        "group appended"
    );
    Ok(created)
}
