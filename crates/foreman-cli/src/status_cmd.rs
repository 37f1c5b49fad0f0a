//! `foreman status` command: namespace overview, or one namespace in detail.

use anyhow::Result;
use chrono::{DateTime, Utc};

use foreman_core::scheduler;
use foreman_core::store::WorkStore;
use foreman_db::models::{AssignmentStatus, JobStatus, NamespaceSnapshot};

use crate::namespace_cmds::resolve_namespace;

/// When `namespace` is `Some`, shows that namespace's assignments, running
/// jobs and what the scheduler would admit next. When `None`, summarizes
/// every namespace.
pub async fn run_status(store: &dyn WorkStore, namespace: Option<&str>) -> Result<()> {
    match namespace {
        Some(name) => {
            let ns = resolve_namespace(store, name).await?;
            let snapshot = store.snapshot(ns.id).await?;
            print!("{}", render_namespace_status(&snapshot, Utc::now()));
        }
        None => {
            let namespaces = store.list_namespaces().await?;
            if namespaces.is_empty() {
                println!("No namespaces found.");
                return Ok(());
            }
            for ns in &namespaces {
                println!(
                    "{:<24} pending={} active={} blocked={} complete={}",
                    ns.name, ns.pending_count, ns.active_count, ns.blocked_count, ns.complete_count
                );
            }
        }
    }
    Ok(())
}

fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - since).num_seconds().max(0);
    match secs {
        s if s < 60 => format!("{s}s"),
        s if s < 3600 => format!("{}m{:02}s", s / 60, s % 60),
        s => format!("{}h{:02}m", s / 3600, (s % 3600) / 60),
    }
}

fn render_namespace_status(snapshot: &NamespaceSnapshot, now: DateTime<Utc>) -> String {
    let ns = &snapshot.namespace;
    let mut out = format!("Namespace: {} ({})\n", ns.name, ns.id);
    out.push_str(&format!(
        "Assignments: pending={} active={} blocked={} complete={}\n",
        ns.pending_count, ns.active_count, ns.blocked_count, ns.complete_count
    ));

    let open: Vec<_> = snapshot
        .assignments
        .iter()
        .filter(|a| a.status != AssignmentStatus::Complete)
        .collect();
    if !open.is_empty() {
        out.push_str("\nOpen assignments:\n");
        for a in open {
            let current = scheduler::current_group(snapshot, a.id)
                .map(|g| {
                    snapshot
                        .jobs_in_group(g.id)
                        .map(|j| j.job_type.to_string())
                        .collect::<Vec<_>>()
                        .join("+")
                })
                .unwrap_or_else(|| "-".to_string());
            out.push_str(&format!(
                "  {} [{}] prio={} now={}",
                a.id, a.status, a.priority, current
            ));
            if let Some(reason) = &a.blocked_reason {
                out.push_str(&format!(" blocked: {reason}"));
            }
            out.push('\n');
        }
    }

    let running: Vec<_> = snapshot
        .jobs
        .iter()
        .filter(|j| j.status == JobStatus::Running)
        .collect();
    out.push_str(&format!("\nRunning jobs: {}\n", running.len()));
    for job in running {
        let age = job
            .started_at
            .map(|t| elapsed(t, now))
            .unwrap_or_else(|| "?".to_string());
        out.push_str(&format!(
            "  * {} {} via {} ({age})\n",
            job.id, job.job_type, job.harness
        ));
    }

    let ready = scheduler::ready(snapshot);
    out.push_str(&format!("\nReady to start: {}\n", ready.len()));
    for job in &ready {
        out.push_str(&format!(
            "  . {} {} via {} (assignment {})\n",
            job.id, job.job_type, job.harness, job.assignment_id
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_core::store::MemoryStore;
    use foreman_db::models::{JobType, NewAssignment, NewJob};

    #[test]
    fn elapsed_formats() {
        let now = Utc::now();
        assert_eq!(elapsed(now - chrono::Duration::seconds(42), now), "42s");
        assert_eq!(elapsed(now - chrono::Duration::seconds(125), now), "2m05s");
        assert_eq!(elapsed(now - chrono::Duration::seconds(7300), now), "2h01m");
        assert_eq!(elapsed(now + chrono::Duration::seconds(5), now), "0s");
    }

    #[tokio::test]
    async fn shows_running_and_ready_jobs() {
        let store = MemoryStore::new();
        let ns = store.create_namespace("web", None).await.unwrap();
        let new = |independent| NewAssignment {
            namespace_id: ns.id,
            north_star: "n".into(),
            independent,
            priority: 0,
        };
        let (_, _, running) = store
            .create_assignment(&new(false), &[NewJob::new(JobType::Implement, "codex")])
            .await
            .unwrap();
        store
            .create_assignment(&new(true), &[NewJob::new(JobType::Research, "gemini")])
            .await
            .unwrap();
        store.start_job(running[0].id, "p").await.unwrap();

        let snapshot = store.snapshot(ns.id).await.unwrap();
        let text = render_namespace_status(&snapshot, Utc::now());
        assert!(text.starts_with("Namespace: web"));
        assert!(text.contains("Running jobs: 1"));
        assert!(text.contains("implement via codex"));
        assert!(text.contains("Ready to start: 1"));
        assert!(text.contains("research via gemini"));
        assert!(text.contains("now=implement"));
    }
}
