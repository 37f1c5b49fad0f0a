//! Readiness and admission: which jobs may start right now.
//!
//! [`ready`] is a pure function of a [`NamespaceSnapshot`]. A job is ready
//! when it is pending, its assignment is pending or active, its group is
//! the assignment's current group, and admission control lets its
//! assignment run.
//!
//! Admission control:
//!
//! - independent assignments are always admitted;
//! - a non-independent assignment is admitted only when no *other*
//!   non-independent assignment has a running job;
//! - when none is running and several compete, the one with the lowest
//!   `priority` wins, then the oldest, then the lowest id.

use std::collections::HashSet;

use uuid::Uuid;

use foreman_db::models::{Assignment, Job, JobGroup, JobStatus, NamespaceSnapshot};

/// An assignment whose current group still has pending jobs.
#[derive(Debug)]
struct Candidate<'a> {
    assignment: &'a Assignment,
    jobs: Vec<&'a Job>,
}

/// The first group in an assignment's chain that is not yet all-terminal.
///
/// Returns `None` when every group in the chain is finished (or the chain
/// is empty).
pub fn current_group(snapshot: &NamespaceSnapshot, assignment_id: Uuid) -> Option<&JobGroup> {
    snapshot
        .chain(assignment_id)
        .into_iter()
        .find(|g| !snapshot.group_status(g.id).is_terminal())
}

/// Jobs eligible to start, in assignment creation order then job creation
/// order. Identical snapshots always yield identical output.
pub fn ready(snapshot: &NamespaceSnapshot) -> Vec<Job> {
    let mut assignments: Vec<&Assignment> = snapshot.assignments.iter().collect();
    // Stable: ties keep snapshot order.
    assignments.sort_by_key(|a| a.created_at);

    let candidates: Vec<Candidate<'_>> = assignments
        .into_iter()
        .filter(|a| a.status.is_schedulable())
        .filter_map(|assignment| {
            let group = current_group(snapshot, assignment.id)?;
            let mut jobs: Vec<&Job> = snapshot
                .jobs_in_group(group.id)
                .filter(|j| j.status == JobStatus::Pending)
                .collect();
            if jobs.is_empty() {
                return None;
            }
            jobs.sort_by_key(|j| j.created_at);
            Some(Candidate { assignment, jobs })
        })
        .collect();

    // Non-independent assignments holding a running job, whatever their
    // own status.
    let running: HashSet<Uuid> = snapshot
        .assignments
        .iter()
        .filter(|a| !a.independent && snapshot.has_running_job(a.id))
        .map(|a| a.id)
        .collect();

    let winner = if running.is_empty() {
        candidates
            .iter()
            .filter(|c| !c.assignment.independent)
            .min_by_key(|c| (c.assignment.priority, c.assignment.created_at, c.assignment.id))
            .map(|c| c.assignment.id)
    } else {
        None
    };

    let admitted = |c: &Candidate<'_>| {
        if c.assignment.independent {
            return true;
        }
        if running.is_empty() {
            return winner == Some(c.assignment.id);
        }
        running.len() == 1 && running.contains(&c.assignment.id)
    };

    candidates
        .iter()
        .filter(|c| admitted(c))
        .flat_map(|c| c.jobs.iter().map(|j| (*j).clone()))
        .collect()
}
