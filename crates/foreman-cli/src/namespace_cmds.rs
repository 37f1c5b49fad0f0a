//! `foreman namespace` subcommands.

use std::path::Path;

use anyhow::{Context, Result};

use foreman_core::store::WorkStore;
use foreman_db::models::Namespace;

use crate::NamespaceCommands;

pub async fn run_namespace_command(command: NamespaceCommands, store: &dyn WorkStore) -> Result<()> {
    match command {
        NamespaceCommands::Create { name, project_path } => {
            let project_path = match project_path {
                Some(p) => Some(canonical_project_path(&p)?),
                None => None,
            };
            let ns = store
                .create_namespace(&name, project_path.as_deref())
                .await
                .with_context(|| format!("failed to create namespace {name:?}"))?;
            println!("Created namespace {} ({})", ns.name, ns.id);
            if let Some(path) = &ns.project_path {
                println!("  project path: {path}");
            }
        }
        NamespaceCommands::List => {
            let namespaces = store.list_namespaces().await?;
            print!("{}", render_namespaces(&namespaces));
        }
    }
    Ok(())
}

/// Look a namespace up by name, failing with a readable error.
pub async fn resolve_namespace(store: &dyn WorkStore, name: &str) -> Result<Namespace> {
    store
        .namespace_by_name(name)
        .await?
        .with_context(|| format!("namespace {name:?} not found (create it with `foreman namespace create {name}`)"))
}

fn canonical_project_path(path: &str) -> Result<String> {
    let canonical = Path::new(path)
        .canonicalize()
        .with_context(|| format!("project path {path} does not exist"))?;
    Ok(canonical.display().to_string())
}

fn render_namespaces(namespaces: &[Namespace]) -> String {
    if namespaces.is_empty() {
        return "No namespaces found.\n".to_string();
    }
    let mut out = format!(
        "{:<24} {:>8} {:>8} {:>8} {:>8}  {}\n",
        "NAME", "PENDING", "ACTIVE", "BLOCKED", "COMPLETE", "PROJECT"
    );
    out.push_str(&"-".repeat(80));
    out.push('\n');
    for ns in namespaces {
        out.push_str(&format!(
            "{:<24} {:>8} {:>8} {:>8} {:>8}  {}\n",
            ns.name,
            ns.pending_count,
            ns.active_count,
            ns.blocked_count,
            ns.complete_count,
            ns.project_path.as_deref().unwrap_or("-"),
        ));
    }
    out
}
