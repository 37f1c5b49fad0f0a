//! In-process [`WorkStore`] for tests and ephemeral runs.
//!
//! All records live behind one mutex. Every successful write bumps a
//! version counter on a `watch` channel, and each subscription maps that
//! channel to fresh namespace snapshots. Bursts of writes coalesce into a
//! single snapshot when the subscriber is slower than the writers.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::WatchStream;
use uuid::Uuid;

use foreman_db::models::{
    Assignment, AssignmentStatus, Job, JobGroup, JobStatus, Namespace, NamespaceSnapshot,
    NewAssignment, NewJob,
};

use super::{CreatedGroup, SnapshotStream, WorkStore};

#[derive(Debug, Default)]
struct State {
    namespaces: Vec<Namespace>,
    assignments: Vec<Assignment>,
    groups: Vec<JobGroup>,
    jobs: Vec<Job>,
}

impl State {
    fn snapshot(&self, namespace_id: Uuid) -> Result<NamespaceSnapshot> {
        let namespace = self
            .namespaces
            .iter()
            .find(|n| n.id == namespace_id)
            .cloned()
            .with_context(|| format!("namespace {namespace_id} not found"))?;
        Ok(NamespaceSnapshot {
            namespace,
            assignments: self
                .assignments
                .iter()
                .filter(|a| a.namespace_id == namespace_id)
                .cloned()
                .collect(),
            groups: self
                .groups
                .iter()
                .filter(|g| g.namespace_id == namespace_id)
                .cloned()
                .collect(),
            jobs: self
                .jobs
                .iter()
                .filter(|j| j.namespace_id == namespace_id)
                .cloned()
                .collect(),
        })
    }

    fn assignment_mut(&mut self, id: Uuid) -> Result<&mut Assignment> {
        self.assignments
            .iter_mut()
            .find(|a| a.id == id)
            .with_context(|| format!("assignment {id} not found"))
    }

    fn group_mut(&mut self, id: Uuid) -> Result<&mut JobGroup> {
        self.groups
            .iter_mut()
            .find(|g| g.id == id)
            .with_context(|| format!("job group {id} not found"))
    }

    fn refresh_counts(&mut self, namespace_id: Uuid) {
        let count = |status: AssignmentStatus| {
            self.assignments
                .iter()
                .filter(|a| a.namespace_id == namespace_id && a.status == status)
                .count() as i64
        };
        let (pending, active, blocked, complete) = (
            count(AssignmentStatus::Pending),
            count(AssignmentStatus::Active),
            count(AssignmentStatus::Blocked),
            count(AssignmentStatus::Complete),
        );
        if let Some(ns) = self.namespaces.iter_mut().find(|n| n.id == namespace_id) {
            ns.pending_count = pending;
            ns.active_count = active;
            ns.blocked_count = blocked;
            ns.complete_count = complete;
        }
    }

    fn insert_group(
        &mut self,
        assignment_id: Uuid,
        namespace_id: Uuid,
        next_group_id: Option<Uuid>,
        jobs: &[NewJob],
    ) -> CreatedGroup {
        let now = Utc::now();
        let group = JobGroup {
            id: Uuid::new_v4(),
            assignment_id,
            namespace_id,
            next_group_id,
            created_at: now,
        };
        let created: Vec<Job> = jobs
            .iter()
            .map(|new| Job {
                id: Uuid::new_v4(),
                group_id: group.id,
                assignment_id,
                namespace_id,
                job_type: new.job_type,
                harness: new.harness.clone(),
                context: new.context.clone(),
                status: JobStatus::Pending,
                result: None,
                prompt: None,
                resume_token: None,
                created_at: now,
                started_at: None,
                completed_at: None,
            })
            .collect();
        self.groups.push(group.clone());
        self.jobs.extend(created.iter().cloned());
        (group, created)
    }

    fn tail_of(&self, head: Uuid) -> Result<Uuid> {
        self.last_before(head, None)
    }

    /// Walk from `start` to the last group whose successor is not
    /// `boundary`. With no boundary this is the tail.
    fn last_before(&self, start: Uuid, boundary: Option<Uuid>) -> Result<Uuid> {
        let mut seen = HashSet::new();
        let mut cursor = start;
        loop {
            if !seen.insert(cursor) {
                bail!("chain starting at {start} does not terminate");
            }
            let group = self
                .groups
                .iter()
                .find(|g| g.id == cursor)
                .with_context(|| format!("job group {cursor} not found"))?;
            match group.next_group_id {
                Some(next) if Some(next) != boundary => cursor = next,
                _ => return Ok(cursor),
            }
        }
    }
}

/// In-memory [`WorkStore`]. Cloning yields another handle to the same data.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    changes: Arc<watch::Sender<u64>>,
    finish_failures: Arc<AtomicU32>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self {
            state: Arc::new(Mutex::new(State::default())),
            changes: Arc::new(tx),
            finish_failures: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Make the next `n` calls to [`WorkStore::finish_job`] fail without
    /// writing anything.
    pub fn fail_next_finishes(&self, n: u32) {
        self.finish_failures.store(n, Ordering::SeqCst);
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        self.changes.send_modify(|version| *version += 1);
    }

    /// Run a write against the state and publish a change if it succeeded.
    fn write<R>(&self, f: impl FnOnce(&mut State) -> Result<R>) -> Result<R> {
        let out = f(&mut self.lock())?;
        self.notify();
        Ok(out)
    }
}

#[async_trait]
impl WorkStore for MemoryStore {
    async fn create_namespace(&self, name: &str, project_path: Option<&str>) -> Result<Namespace> {
        self.write(|state| {
            if state.namespaces.iter().any(|n| n.name == name) {
                bail!("namespace {name:?} already exists");
            }
            let ns = Namespace {
                id: Uuid::new_v4(),
                name: name.to_owned(),
                project_path: project_path.map(str::to_owned),
                pending_count: 0,
                active_count: 0,
                blocked_count: 0,
                complete_count: 0,
                created_at: Utc::now(),
            };
            state.namespaces.push(ns.clone());
            Ok(ns)
        })
    }

    async fn namespace_by_name(&self, name: &str) -> Result<Option<Namespace>> {
        Ok(self.lock().namespaces.iter().find(|n| n.name == name).cloned())
    }

    async fn list_namespaces(&self) -> Result<Vec<Namespace>> {
        let mut all = self.lock().namespaces.clone();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }

    async fn snapshot(&self, namespace_id: Uuid) -> Result<NamespaceSnapshot> {
        self.lock().snapshot(namespace_id)
    }

    async fn subscribe(&self, namespace_id: Uuid) -> Result<SnapshotStream> {
        // Fail fast on an unknown namespace.
        self.lock().snapshot(namespace_id)?;
        let state = Arc::clone(&self.state);
        let stream = WatchStream::new(self.changes.subscribe()).map(move |_| {
            state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .snapshot(namespace_id)
        });
        Ok(Box::pin(stream))
    }

    async fn create_assignment(
        &self,
        new: &NewAssignment,
        head_jobs: &[NewJob],
    ) -> Result<(Assignment, Option<JobGroup>, Vec<Job>)> {
        self.write(|state| {
            if !state.namespaces.iter().any(|n| n.id == new.namespace_id) {
                bail!("namespace {} not found", new.namespace_id);
            }
            let now = Utc::now();
            let mut assignment = Assignment {
                id: Uuid::new_v4(),
                namespace_id: new.namespace_id,
                north_star: new.north_star.clone(),
                status: AssignmentStatus::Pending,
                independent: new.independent,
                priority: new.priority,
                artifacts: String::new(),
                decisions: String::new(),
                blocked_reason: None,
                head_group_id: None,
                created_at: now,
                updated_at: now,
            };
            let (group, jobs) = if head_jobs.is_empty() {
                (None, Vec::new())
            } else {
                let (group, jobs) =
                    state.insert_group(assignment.id, assignment.namespace_id, None, head_jobs);
                assignment.head_group_id = Some(group.id);
                (Some(group), jobs)
            };
            state.assignments.push(assignment.clone());
            state.refresh_counts(assignment.namespace_id);
            Ok((assignment, group, jobs))
        })
    }

    async fn get_assignment(&self, id: Uuid) -> Result<Option<Assignment>> {
        Ok(self.lock().assignments.iter().find(|a| a.id == id).cloned())
    }

    async fn list_assignments(&self, namespace_id: Uuid) -> Result<Vec<Assignment>> {
        Ok(self
            .lock()
            .assignments
            .iter()
            .filter(|a| a.namespace_id == namespace_id)
            .cloned()
            .collect())
    }

    async fn transition_assignment(
        &self,
        id: Uuid,
        from: &[AssignmentStatus],
        to: AssignmentStatus,
        reason: Option<&str>,
    ) -> Result<u64> {
        let mut state = self.lock();
        let Some(assignment) = state.assignments.iter_mut().find(|a| a.id == id) else {
            return Ok(0);
        };
        if !from.contains(&assignment.status) {
            return Ok(0);
        }
        assignment.status = to;
        assignment.blocked_reason = reason.map(str::to_owned);
        assignment.updated_at = Utc::now();
        let namespace_id = assignment.namespace_id;
        state.refresh_counts(namespace_id);
        drop(state);
        self.notify();
        Ok(1)
    }

    async fn append_artifact(&self, assignment_id: Uuid, line: &str) -> Result<()> {
        self.write(|state| {
            let a = state.assignment_mut(assignment_id)?;
            a.artifacts.push_str(line);
            a.artifacts.push('\n');
            a.updated_at = Utc::now();
            Ok(())
        })
    }

    async fn append_decision(&self, assignment_id: Uuid, line: &str) -> Result<()> {
        self.write(|state| {
            let a = state.assignment_mut(assignment_id)?;
            a.decisions.push_str(line);
            a.decisions.push('\n');
            a.updated_at = Utc::now();
            Ok(())
        })
    }

    async fn get_group(&self, id: Uuid) -> Result<Option<JobGroup>> {
        Ok(self.lock().groups.iter().find(|g| g.id == id).cloned())
    }

    async fn insert_group_after(
        &self,
        after_group_id: Uuid,
        jobs: &[NewJob],
    ) -> Result<CreatedGroup> {
        self.write(|state| {
            let after = state.group_mut(after_group_id)?.clone();
            let created =
                state.insert_group(after.assignment_id, after.namespace_id, after.next_group_id, jobs);
            state.group_mut(after_group_id)?.next_group_id = Some(created.0.id);
            Ok(created)
        })
    }

    async fn insert_group_before(
        &self,
        from_group_id: Uuid,
        boundary: Option<Uuid>,
        jobs: &[NewJob],
    ) -> Result<CreatedGroup> {
        self.write(|state| {
            let at = state.last_before(from_group_id, boundary)?;
            let after = state.group_mut(at)?.clone();
            let created =
                state.insert_group(after.assignment_id, after.namespace_id, after.next_group_id, jobs);
            state.group_mut(at)?.next_group_id = Some(created.0.id);
            Ok(created)
        })
    }

    async fn append_group_if_tail(
        &self,
        after_group_id: Uuid,
        jobs: &[NewJob],
    ) -> Result<Option<CreatedGroup>> {
        let mut state = self.lock();
        let after = state.group_mut(after_group_id)?.clone();
        if after.next_group_id.is_some() {
            return Ok(None);
        }
        let created = state.insert_group(after.assignment_id, after.namespace_id, None, jobs);
        state.group_mut(after_group_id)?.next_group_id = Some(created.0.id);
        drop(state);
        self.notify();
        Ok(Some(created))
    }

    async fn append_group_at_tail(
        &self,
        assignment_id: Uuid,
        jobs: &[NewJob],
    ) -> Result<CreatedGroup> {
        self.write(|state| {
            let assignment = state.assignment_mut(assignment_id)?.clone();
            match assignment.head_group_id {
                None => {
                    let created =
                        state.insert_group(assignment_id, assignment.namespace_id, None, jobs);
                    let a = state.assignment_mut(assignment_id)?;
                    a.head_group_id = Some(created.0.id);
                    a.updated_at = Utc::now();
                    Ok(created)
                }
                Some(head) => {
                    let tail = state.tail_of(head)?;
                    let created =
                        state.insert_group(assignment_id, assignment.namespace_id, None, jobs);
                    state.group_mut(tail)?.next_group_id = Some(created.0.id);
                    Ok(created)
                }
            }
        })
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self.lock().jobs.iter().find(|j| j.id == id).cloned())
    }

    async fn list_jobs_for_assignment(&self, assignment_id: Uuid) -> Result<Vec<Job>> {
        Ok(self
            .lock()
            .jobs
            .iter()
            .filter(|j| j.assignment_id == assignment_id)
            .cloned()
            .collect())
    }

    async fn list_jobs_for_group(&self, group_id: Uuid) -> Result<Vec<Job>> {
        Ok(self
            .lock()
            .jobs
            .iter()
            .filter(|j| j.group_id == group_id)
            .cloned()
            .collect())
    }

    async fn list_running_jobs(&self, namespace_id: Uuid) -> Result<Vec<Job>> {
        Ok(self
            .lock()
            .jobs
            .iter()
            .filter(|j| j.namespace_id == namespace_id && j.status == JobStatus::Running)
            .cloned()
            .collect())
    }

    async fn start_job(&self, id: Uuid, prompt: &str) -> Result<u64> {
        let mut state = self.lock();
        let Some(job) = state
            .jobs
            .iter_mut()
            .find(|j| j.id == id && j.status == JobStatus::Pending)
        else {
            return Ok(0);
        };
        job.status = JobStatus::Running;
        job.prompt = Some(prompt.to_owned());
        job.started_at = Some(Utc::now());
        drop(state);
        self.notify();
        Ok(1)
    }

    async fn finish_job(
        &self,
        id: Uuid,
        status: JobStatus,
        result: &str,
        resume_token: Option<&str>,
    ) -> Result<u64> {
        if !status.is_terminal() {
            bail!("cannot finish job {id} with non-terminal status {status}");
        }
        let inject = self
            .finish_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if inject {
            bail!("injected finish_job failure for job {id}");
        }

        let mut state = self.lock();
        let Some(job) = state
            .jobs
            .iter_mut()
            .find(|j| j.id == id && j.status == JobStatus::Running)
        else {
            return Ok(0);
        };
        job.status = status;
        job.result = Some(result.to_owned());
        job.resume_token = resume_token.map(str::to_owned);
        job.completed_at = Some(Utc::now());
        drop(state);
        self.notify();
        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_db::models::JobType;

    async fn seeded() -> (MemoryStore, Namespace, Assignment, JobGroup, Vec<Job>) {
        let store = MemoryStore::new();
        let ns = store.create_namespace("mem", None).await.unwrap();
        let (a, g, jobs) = store
            .create_assignment(
                &NewAssignment {
                    namespace_id: ns.id,
                    north_star: "build".into(),
                    independent: false,
                    priority: 0,
                },
                &[NewJob::new(JobType::Implement, "claude-code")],
            )
            .await
            .unwrap();
        (store, ns, a, g.unwrap(), jobs)
    }

    #[tokio::test]
    async fn duplicate_namespace_is_rejected() {
        let store = MemoryStore::new();
        store.create_namespace("a", None).await.unwrap();
        assert!(store.create_namespace("a", None).await.is_err());
    }

    #[tokio::test]
    async fn subscribe_yields_current_then_changes() {
        let (store, ns, a, _, _) = seeded().await;
        let mut sub = store.subscribe(ns.id).await.unwrap();

        let first = sub.next().await.unwrap().unwrap();
        assert_eq!(first.assignments.len(), 1);
        assert!(first.assignments[0].artifacts.is_empty());

        store.append_artifact(a.id, "note").await.unwrap();
        let second = sub.next().await.unwrap().unwrap();
        assert_eq!(second.assignments[0].artifacts, "note\n");
    }

    #[tokio::test]
    async fn counts_track_transitions() {
        let (store, ns, a, _, _) = seeded().await;
        let n = store
            .transition_assignment(a.id, &[AssignmentStatus::Pending], AssignmentStatus::Active, None)
            .await
            .unwrap();
        assert_eq!(n, 1);
        let snap = store.snapshot(ns.id).await.unwrap();
        assert_eq!(snap.namespace.pending_count, 0);
        assert_eq!(snap.namespace.active_count, 1);
    }

    #[tokio::test]
    async fn job_transitions_are_guarded() {
        let (store, _, _, _, jobs) = seeded().await;
        let id = jobs[0].id;
        assert_eq!(store.finish_job(id, JobStatus::Complete, "x", None).await.unwrap(), 0);
        assert_eq!(store.start_job(id, "p").await.unwrap(), 1);
        assert_eq!(store.start_job(id, "p").await.unwrap(), 0);
        assert_eq!(store.finish_job(id, JobStatus::Failed, "x", None).await.unwrap(), 1);
        assert_eq!(store.finish_job(id, JobStatus::Complete, "y", None).await.unwrap(), 0);
        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn injected_finish_failures_are_consumed() {
        let (store, _, _, _, jobs) = seeded().await;
        let id = jobs[0].id;
        store.start_job(id, "p").await.unwrap();
        store.fail_next_finishes(1);
        assert!(store.finish_job(id, JobStatus::Complete, "x", None).await.is_err());
        assert_eq!(store.finish_job(id, JobStatus::Complete, "x", None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn chain_edits_keep_single_links() {
        let (store, ns, a, head, _) = seeded().await;
        let pm = [NewJob::new(JobType::Pm, "claude-code")];

        let (tail, _) = store.append_group_if_tail(head.id, &pm).await.unwrap().unwrap();
        assert!(store.append_group_if_tail(head.id, &pm).await.unwrap().is_none());

        let retro = [NewJob::new(JobType::Retrospect, "claude-code")];
        let (middle, _) = store.insert_group_after(head.id, &retro).await.unwrap();
        let (last, _) = store.append_group_at_tail(a.id, &pm).await.unwrap();

        let snap = store.snapshot(ns.id).await.unwrap();
        let chain: Vec<Uuid> = snap.chain(a.id).iter().map(|g| g.id).collect();
        assert_eq!(chain, vec![head.id, middle.id, tail.id, last.id]);
    }

    #[tokio::test]
    async fn insert_before_boundary_keeps_call_order() {
        let (store, ns, a, head, _) = seeded().await;
        let (boundary, _) = store
            .append_group_at_tail(a.id, &[NewJob::new(JobType::Uat, "codex")])
            .await
            .unwrap();

        let (first, _) = store
            .insert_group_before(head.id, Some(boundary.id), &[NewJob::new(JobType::Implement, "codex")])
            .await
            .unwrap();
        let (second, _) = store
            .insert_group_before(head.id, Some(boundary.id), &[NewJob::new(JobType::Review, "codex")])
            .await
            .unwrap();
        let (at_tail, _) = store
            .insert_group_before(boundary.id, None, &[NewJob::new(JobType::Verify, "codex")])
            .await
            .unwrap();

        let snap = store.snapshot(ns.id).await.unwrap();
        let chain: Vec<Uuid> = snap.chain(a.id).iter().map(|g| g.id).collect();
        assert_eq!(chain, vec![head.id, first.id, second.id, boundary.id, at_tail.id]);
    }
}
