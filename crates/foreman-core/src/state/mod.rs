//! Assignment status transitions.
//!
//! Validates operator- and feedback-driven status changes against the
//! allowed transition graph and applies them with an optimistic guard on
//! the current status.

use thiserror::Error;
use uuid::Uuid;

use foreman_db::models::{Assignment, AssignmentStatus};

use crate::store::WorkStore;

/// Reasons a status transition was refused.
#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("invalid assignment transition: {from} -> {to}")]
    Invalid {
        from: AssignmentStatus,
        to: AssignmentStatus,
    },

    #[error("blocking an assignment requires a reason")]
    MissingReason,

    #[error("assignment {0} not found")]
    NotFound(Uuid),

    #[error("assignment {id} changed concurrently (expected status {expected})")]
    Conflict {
        id: Uuid,
        expected: AssignmentStatus,
    },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// The assignment state machine.
///
/// ```text
/// pending  -> active | blocked | complete
/// active   -> blocked | complete
/// blocked  -> active | pending   (unblock)
/// complete    (terminal)
/// ```
pub struct AssignmentStateMachine;

impl AssignmentStateMachine {
    pub fn is_valid_transition(from: AssignmentStatus, to: AssignmentStatus) -> bool {
        use AssignmentStatus::*;
        matches!(
            (from, to),
            (Pending, Active)
                | (Pending, Blocked)
                | (Pending, Complete)
                | (Active, Blocked)
                | (Active, Complete)
                | (Blocked, Active)
                | (Blocked, Pending)
        )
    }

    /// Move an assignment to `to`.
    ///
    /// `reason` is required (and non-blank) when `to` is blocked and is
    /// ignored otherwise, so leaving blocked always clears the old reason.
    pub async fn transition(
        store: &dyn WorkStore,
        id: Uuid,
        to: AssignmentStatus,
        reason: Option<&str>,
    ) -> Result<Assignment, TransitionError> {
        let current = store
            .get_assignment(id)
            .await?
            .ok_or(TransitionError::NotFound(id))?;
        let from = current.status;

        if !Self::is_valid_transition(from, to) {
            return Err(TransitionError::Invalid { from, to });
        }

        let reason = match to {
            AssignmentStatus::Blocked => match reason.map(str::trim) {
                Some(r) if !r.is_empty() => Some(r),
                _ => return Err(TransitionError::MissingReason),
            },
            _ => None,
        };

        let rows = store.transition_assignment(id, &[from], to, reason).await?;
        if rows == 0 {
            return Err(TransitionError::Conflict { id, expected: from });
        }

        store
            .get_assignment(id)
            .await?
            .ok_or(TransitionError::NotFound(id))
    }

    /// Release a blocked assignment. It resumes as active when any of its
    /// jobs ever started, otherwise as pending.
    pub async fn unblock(store: &dyn WorkStore, id: Uuid) -> Result<Assignment, TransitionError> {
        let jobs = store.list_jobs_for_assignment(id).await?;
        let to = if jobs.iter().any(|j| j.started_at.is_some()) {
            AssignmentStatus::Active
        } else {
            AssignmentStatus::Pending
        };
        Self::transition(store, id, to, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use foreman_db::models::{JobType, NewAssignment, NewJob};
    use AssignmentStatus::*;

    #[test]
    fn valid_edges() {
        assert!(AssignmentStateMachine::is_valid_transition(Pending, Active));
        assert!(AssignmentStateMachine::is_valid_transition(Active, Complete));
        assert!(AssignmentStateMachine::is_valid_transition(Blocked, Pending));
        assert!(AssignmentStateMachine::is_valid_transition(Active, Blocked));
    }

    #[test]
    fn complete_is_terminal() {
        for to in [Pending, Active, Blocked, Complete] {
            assert!(!AssignmentStateMachine::is_valid_transition(Complete, to));
        }
    }

    #[test]
    fn active_cannot_go_back_to_pending() {
        assert!(!AssignmentStateMachine::is_valid_transition(Active, Pending));
        assert!(!AssignmentStateMachine::is_valid_transition(Active, Active));
    }

    async fn store_with_assignment(with_job: bool) -> (MemoryStore, Uuid, Vec<Uuid>) {
        let store = MemoryStore::new();
        let ns = store.create_namespace("ns", None).await.unwrap();
        let jobs = if with_job {
            vec![NewJob::new(JobType::Implement, "claude-code")]
        } else {
            vec![]
        };
        let (a, _, created) = store
            .create_assignment(
                &NewAssignment {
                    namespace_id: ns.id,
                    north_star: "goal".into(),
                    independent: false,
                    priority: 0,
                },
                &jobs,
            )
            .await
            .unwrap();
        (store, a.id, created.into_iter().map(|j| j.id).collect())
    }

    #[tokio::test]
    async fn block_requires_reason() {
        let (store, id, _) = store_with_assignment(false).await;
        let err = AssignmentStateMachine::transition(&store, id, Blocked, Some("  "))
            .await
            .unwrap_err();
        assert!(matches!(err, TransitionError::MissingReason));

        let a = AssignmentStateMachine::transition(&store, id, Blocked, Some("waiting on API key"))
            .await
            .unwrap();
        assert_eq!(a.status, Blocked);
        assert_eq!(a.blocked_reason.as_deref(), Some("waiting on API key"));
    }

    #[tokio::test]
    async fn unblock_without_started_jobs_returns_to_pending() {
        let (store, id, _) = store_with_assignment(true).await;
        AssignmentStateMachine::transition(&store, id, Blocked, Some("hold"))
            .await
            .unwrap();
        let a = AssignmentStateMachine::unblock(&store, id).await.unwrap();
        assert_eq!(a.status, Pending);
        assert!(a.blocked_reason.is_none());
    }

    #[tokio::test]
    async fn unblock_after_work_started_returns_to_active() {
        let (store, id, jobs) = store_with_assignment(true).await;
        store.start_job(jobs[0], "prompt").await.unwrap();
        AssignmentStateMachine::transition(&store, id, Blocked, Some("hold"))
            .await
            .unwrap();
        let a = AssignmentStateMachine::unblock(&store, id).await.unwrap();
        assert_eq!(a.status, Active);
    }

    #[tokio::test]
    async fn invalid_and_missing_are_reported() {
        let (store, id, _) = store_with_assignment(false).await;
        let err = AssignmentStateMachine::unblock(&store, id).await.unwrap_err();
        assert!(matches!(
            err,
            TransitionError::Invalid {
                from: Pending,
                to: Pending
            }
        ));

        let missing = Uuid::new_v4();
        let err = AssignmentStateMachine::transition(&store, missing, Active, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TransitionError::NotFound(x) if x == missing));
    }
}
