//! `foreman assignment` subcommands.

use anyhow::{Context, Result, bail};
use uuid::Uuid;

use foreman_core::state::AssignmentStateMachine;
use foreman_core::store::WorkStore;
use foreman_db::models::{
    Assignment, AssignmentStatus, JobStatus, NamespaceSnapshot, NewAssignment, NewJob,
};

use crate::AssignmentCommands;
use crate::namespace_cmds::resolve_namespace;

pub async fn run_assignment_command(
    command: AssignmentCommands,
    store: &dyn WorkStore,
) -> Result<()> {
    match command {
        AssignmentCommands::Create {
            namespace,
            north_star,
            independent,
            priority,
            jobs,
        } => {
            let assignment =
                create_assignment(store, &namespace, &north_star, independent, priority, &jobs)
                    .await?;
            println!("Created assignment {}", assignment.id);
            println!(
                "  {} job(s) in the head group, {}",
                jobs.len(),
                if independent { "independent" } else { "exclusive" }
            );
        }
        AssignmentCommands::Show { id } => {
            let id = parse_id(&id)?;
            let assignment = get_assignment(store, id).await?;
            let snapshot = store.snapshot(assignment.namespace_id).await?;
            print!("{}", render_assignment(&snapshot, &assignment));
        }
        AssignmentCommands::List { namespace } => {
            let ns = resolve_namespace(store, &namespace).await?;
            let assignments = store.list_assignments(ns.id).await?;
            print!("{}", render_assignment_list(&assignments));
        }
        AssignmentCommands::Block { id, reason } => {
            let id = parse_id(&id)?;
            let a = AssignmentStateMachine::transition(
                store,
                id,
                AssignmentStatus::Blocked,
                Some(&reason),
            )
            .await?;
            println!("Assignment {} blocked: {}", a.id, a.blocked_reason.unwrap_or_default());
        }
        AssignmentCommands::Unblock { id } => {
            let id = parse_id(&id)?;
            let a = AssignmentStateMachine::unblock(store, id).await?;
            println!("Assignment {} is {} again.", a.id, a.status);
        }
    }
    Ok(())
}

pub fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw.trim()).with_context(|| format!("invalid assignment ID: {raw}"))
}

async fn get_assignment(store: &dyn WorkStore, id: Uuid) -> Result<Assignment> {
    store
        .get_assignment(id)
        .await?
        .with_context(|| format!("assignment {id} not found"))
}

async fn create_assignment(
    store: &dyn WorkStore,
    namespace: &str,
    north_star: &str,
    independent: bool,
    priority: i32,
    jobs: &[NewJob],
) -> Result<Assignment> {
    if north_star.trim().is_empty() {
        bail!("the north star must not be empty");
    }
    if jobs.is_empty() {
        bail!("an assignment needs at least one --job for its head group");
    }
    let ns = resolve_namespace(store, namespace).await?;
    let (assignment, _, _) = store
        .create_assignment(
            &NewAssignment {
                namespace_id: ns.id,
                north_star: north_star.trim().to_string(),
                independent,
                priority,
            },
            jobs,
        )
        .await?;
    tracing::info!(assignment_id = %assignment.id, namespace = %ns.name, "assignment created");
    Ok(assignment)
}

fn status_icon(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Pending => ".",
        JobStatus::Running => "*",
        JobStatus::Complete => "+",
        JobStatus::Failed => "!",
    }
}

/// Detailed view: header, logs, then the chain group by group.
fn render_assignment(snapshot: &NamespaceSnapshot, a: &Assignment) -> String {
    let mut out = format!("Assignment: {}\n", a.id);
    out.push_str(&format!("Namespace: {}\n", snapshot.namespace.name));
    out.push_str(&format!("Status: {}\n", a.status));
    if let Some(reason) = &a.blocked_reason {
        out.push_str(&format!("Blocked: {reason}\n"));
    }
    out.push_str(&format!(
        "Priority: {}{}\n",
        a.priority,
        if a.independent { " (independent)" } else { "" }
    ));
    out.push_str(&format!("North star: {}\n", a.north_star));

    out.push_str("\nChain:\n");
    for (i, group) in snapshot.chain(a.id).iter().enumerate() {
        out.push_str(&format!(
            "  {}. group {} [{}]\n",
            i + 1,
            group.id,
            snapshot.group_status(group.id)
        ));
        for job in snapshot.jobs_in_group(group.id) {
            out.push_str(&format!(
                "     [{}] {} via {} ({}) {}\n",
                status_icon(job.status),
                job.job_type,
                job.harness,
                job.status,
                job.id
            ));
        }
    }

    for (title, log) in [("Artifacts", &a.artifacts), ("Decisions", &a.decisions)] {
        if !log.trim().is_empty() {
            out.push_str(&format!("\n{title}:\n"));
            for line in log.lines() {
                out.push_str(&format!("  {line}\n"));
            }
        }
    }
    out
}

fn render_assignment_list(assignments: &[Assignment]) -> String {
    if assignments.is_empty() {
        return "No assignments found.\n".to_string();
    }
    let mut out = format!(
        "{:<38} {:<10} {:>4} {:<5} {}\n",
        "ID", "STATUS", "PRIO", "IND", "NORTH STAR"
    );
    out.push_str(&"-".repeat(100));
    out.push('\n');
    for a in assignments {
        let first_line = a.north_star.lines().next().unwrap_or("");
        let north_star = if first_line.chars().count() > 40 {
            format!("{}...", first_line.chars().take(37).collect::<String>())
        } else {
            first_line.to_string()
        };
        out.push_str(&format!(
            "{:<38} {:<10} {:>4} {:<5} {}\n",
            a.id,
            a.status,
            a.priority,
            if a.independent { "yes" } else { "no" },
            north_star
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_core::store::MemoryStore;
    use foreman_db::models::JobType;

    async fn seeded() -> (MemoryStore, Assignment) {
        let store = MemoryStore::new();
        store.create_namespace("web", None).await.unwrap();
        let a = create_assignment(
            &store,
            "web",
            "  migrate the login page  ",
            false,
            2,
            &[NewJob::new(JobType::Implement, "codex")],
        )
        .await
        .unwrap();
        (store, a)
    }

    #[tokio::test]
    async fn create_trims_and_links_head() {
        let (store, a) = seeded().await;
        assert_eq!(a.north_star, "migrate the login page");
        assert_eq!(a.priority, 2);
        assert!(a.head_group_id.is_some());
        assert_eq!(store.list_jobs_for_assignment(a.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn create_requires_jobs_and_north_star() {
        let store = MemoryStore::new();
        store.create_namespace("web", None).await.unwrap();
        let job = [NewJob::new(JobType::Plan, "codex")];
        assert!(create_assignment(&store, "web", "x", false, 0, &[]).await.is_err());
        assert!(create_assignment(&store, "web", "   ", false, 0, &job).await.is_err());
        assert!(create_assignment(&store, "api", "x", false, 0, &job).await.is_err());
    }

    #[tokio::test]
    async fn show_lists_chain_and_logs() {
        let (store, a) = seeded().await;
        store
            .append_group_at_tail(a.id, &[NewJob::new(JobType::Pm, "claude-code")])
            .await
            .unwrap();
        store.append_artifact(a.id, "[implement] wrote the form").await.unwrap();

        let a = store.get_assignment(a.id).await.unwrap().unwrap();
        let snapshot = store.snapshot(a.namespace_id).await.unwrap();
        let text = render_assignment(&snapshot, &a);
        assert!(text.contains("Namespace: web"));
        assert!(text.contains("  1. group"));
        assert!(text.contains("implement via codex"));
        assert!(text.contains("  2. group"));
        assert!(text.contains("pm via claude-code"));
        assert!(text.contains("Artifacts:\n  [implement] wrote the form"));
        assert!(!text.contains("Decisions:"));
    }

    #[tokio::test]
    async fn block_and_unblock_through_state_machine() {
        let (store, a) = seeded().await;
        run_assignment_command(
            AssignmentCommands::Block {
                id: a.id.to_string(),
                reason: "needs a product call".into(),
            },
            &store,
        )
        .await
        .unwrap();
        let blocked = store.get_assignment(a.id).await.unwrap().unwrap();
        assert_eq!(blocked.status, AssignmentStatus::Blocked);

        run_assignment_command(AssignmentCommands::Unblock { id: a.id.to_string() }, &store)
            .await
            .unwrap();
        let resumed = store.get_assignment(a.id).await.unwrap().unwrap();
        assert_eq!(resumed.status, AssignmentStatus::Pending);
        assert!(resumed.blocked_reason.is_none());
    }

    #[tokio::test]
    async fn blank_block_reason_is_refused() {
        let (store, a) = seeded().await;
        let err = run_assignment_command(
            AssignmentCommands::Block {
                id: a.id.to_string(),
                reason: " ".into(),
            },
            &store,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("requires a reason"));
    }

    #[test]
    fn list_truncates_long_north_stars() {
        let mut a = Assignment {
            id: Uuid::nil(),
            namespace_id: Uuid::nil(),
            north_star: "a".repeat(60),
            status: AssignmentStatus::Active,
            independent: true,
            priority: 0,
            artifacts: String::new(),
            decisions: String::new(),
            blocked_reason: None,
            head_group_id: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        let text = render_assignment_list(std::slice::from_ref(&a));
        assert!(text.contains(&format!("{}...", "a".repeat(37))));
        assert!(text.contains("yes"));

        a.north_star = "short".into();
        assert!(render_assignment_list(&[a]).contains("short"));
        assert_eq!(render_assignment_list(&[]), "No assignments found.\n");
    }
}
