//! `PgStore` tests: the `WorkStore` contract and LISTEN/NOTIFY-driven
//! subscriptions against a real PostgreSQL.

use std::sync::Arc;
use std::time::Duration;

use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use foreman_core::harness::HarnessRegistry;
use foreman_core::harness::registry::HarnessBinaries;
use foreman_core::runner::{Runner, RunnerConfig};
use foreman_core::store::{PgStore, SnapshotStream, WorkStore};
use foreman_db::models::{
    AssignmentStatus, JobStatus, JobType, NamespaceSnapshot, NewAssignment, NewJob,
};
use foreman_test_utils::{create_test_db, drop_test_db};

async fn next_snapshot(stream: &mut SnapshotStream) -> NamespaceSnapshot {
    tokio::time::timeout(Duration::from_secs(10), stream.next())
        .await
        .expect("no snapshot within 10s")
        .expect("stream ended")
        .expect("snapshot error")
}

fn new_assignment(namespace_id: uuid::Uuid, independent: bool) -> NewAssignment {
    NewAssignment {
        namespace_id,
        north_star: "keep the lights on".into(),
        independent,
        priority: 0,
    }
}

#[tokio::test]
async fn subscription_redelivers_on_change() {
    let (pool, db_name) = create_test_db().await;
    let store = PgStore::new(pool.clone());
    let ns = store.create_namespace("sub", None).await.expect("namespace");
    let other = store.create_namespace("other", None).await.expect("namespace");

    let mut updates = store.subscribe(ns.id).await.expect("subscribe");
    let first = next_snapshot(&mut updates).await;
    assert!(first.assignments.is_empty());

    // A write in another namespace must not wake this subscription with
    // foreign data.
    store
        .create_assignment(&new_assignment(other.id, true), &[])
        .await
        .expect("other assignment");

    let (a, _, jobs) = store
        .create_assignment(
            &new_assignment(ns.id, false),
            &[NewJob::new(JobType::Plan, "claude-code")],
        )
        .await
        .expect("assignment");

    let mut snap = next_snapshot(&mut updates).await;
    while snap.assignments.is_empty() || snap.jobs.is_empty() {
        snap = next_snapshot(&mut updates).await;
    }
    assert_eq!(snap.assignments.len(), 1);
    assert_eq!(snap.assignments[0].id, a.id);
    assert_eq!(snap.jobs[0].id, jobs[0].id);
    assert_eq!(snap.namespace.pending_count, 1);

    store.start_job(jobs[0].id, "plan it").await.expect("start");
    let mut snap = next_snapshot(&mut updates).await;
    while snap.jobs[0].status != JobStatus::Running {
        snap = next_snapshot(&mut updates).await;
    }
    assert!(snap.has_running_job(a.id));

    drop(updates);
    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn lost_listener_connection_breaks_the_subscription() {
    let (pool, db_name) = create_test_db().await;
    let store = PgStore::new(pool.clone());
    let ns = store.create_namespace("drop", None).await.expect("namespace");

    let mut updates = store.subscribe(ns.id).await.expect("subscribe");
    next_snapshot(&mut updates).await;

    let terminated: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM ( \
           SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
           WHERE datname = current_database() AND pid <> pg_backend_pid() \
             AND query ILIKE 'LISTEN%' \
         ) t",
    )
    .fetch_one(&pool)
    .await
    .expect("terminate listener");
    assert_eq!(terminated, 1);

    let item = tokio::time::timeout(Duration::from_secs(10), updates.next())
        .await
        .expect("subscription did not notice the lost connection");
    assert!(matches!(item, Some(Err(_))), "expected an error item");

    drop(updates);
    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn snapshot_of_unknown_namespace_errors() {
    let (pool, db_name) = create_test_db().await;
    let store = PgStore::new(pool.clone());

    assert!(store.snapshot(uuid::Uuid::new_v4()).await.is_err());
    assert!(store.namespace_by_name("missing").await.expect("lookup").is_none());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn transitions_and_running_jobs_round_trip() {
    let (pool, db_name) = create_test_db().await;
    let store = PgStore::new(pool.clone());
    let ns = store.create_namespace("rt", Some("/srv/app")).await.expect("namespace");
    let (a, head, jobs) = store
        .create_assignment(
            &new_assignment(ns.id, true),
            &[
                NewJob::new(JobType::Implement, "codex"),
                NewJob::new(JobType::Implement, "gemini").with_context("second half"),
            ],
        )
        .await
        .expect("assignment");
    let head = head.expect("head group");

    assert_eq!(store.start_job(jobs[1].id, "go").await.expect("start"), 1);
    let running = store.list_running_jobs(ns.id).await.expect("running");
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].context.as_deref(), Some("second half"));

    let moved = store
        .transition_assignment(
            a.id,
            &[AssignmentStatus::Pending, AssignmentStatus::Active],
            AssignmentStatus::Blocked,
            Some("waiting"),
        )
        .await
        .expect("transition");
    assert_eq!(moved, 1);

    let in_group = store.list_jobs_for_group(head.id).await.expect("group jobs");
    assert_eq!(in_group.len(), 2);
    let group = store.get_group(head.id).await.expect("group").expect("exists");
    assert!(group.next_group_id.is_none());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[cfg(unix)]
#[tokio::test]
async fn runner_drives_assignment_to_completion() {
    use std::os::unix::fs::PermissionsExt;

    let (pool, db_name) = create_test_db().await;
    let store = PgStore::new(pool.clone());
    let dir = tempfile::TempDir::new().expect("tempdir");
    let agent = dir.path().join("fake-claude");
    std::fs::write(
        &agent,
        r#"#!/bin/sh
printf '{"type":"result","subtype":"success","is_error":false,"result":"%s done"}\n' "$FOREMAN_JOB_TYPE"
"#,
    )
    .expect("write agent");
    std::fs::set_permissions(&agent, std::fs::Permissions::from_mode(0o755)).expect("chmod");

    let ns = store
        .create_namespace("e2e", Some(&dir.path().display().to_string()))
        .await
        .expect("namespace");
    let (a, _, _) = store
        .create_assignment(
            &new_assignment(ns.id, false),
            &[NewJob::new(JobType::Implement, "claude-code")],
        )
        .await
        .expect("assignment");

    let registry = HarnessRegistry::with_builtins(&HarnessBinaries {
        claude: Some(agent.display().to_string()),
        ..Default::default()
    });
    let runner = Runner::new(
        Arc::new(store.clone()),
        Arc::new(registry),
        ns.clone(),
        RunnerConfig {
            job_timeout: Duration::from_secs(10),
            restart_backoff: Duration::from_millis(100),
            ..Default::default()
        },
    );
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(runner.run(cancel.clone()));

    let deadline = std::time::Instant::now() + Duration::from_secs(30);
    let assignment = loop {
        let current = store.get_assignment(a.id).await.expect("get").expect("exists");
        if current.status == AssignmentStatus::Complete {
            break current;
        }
        assert!(std::time::Instant::now() < deadline, "assignment never completed");
        tokio::time::sleep(Duration::from_millis(100)).await;
    };
    cancel.cancel();
    handle.await.expect("join").expect("runner");

    assert!(assignment.artifacts.contains("implement done"));
    assert!(assignment.decisions.contains("pm done"));
    let jobs = store.list_jobs_for_assignment(a.id).await.expect("jobs");
    assert_eq!(jobs.len(), 2);
    assert!(jobs.iter().all(|j| j.status == JobStatus::Complete));

    pool.close().await;
    drop_test_db(&db_name).await;
}
