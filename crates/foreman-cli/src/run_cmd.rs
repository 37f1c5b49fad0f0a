//! `foreman run` command: drive one namespace until interrupted.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use foreman_core::harness::HarnessRegistry;
use foreman_core::runner::Runner;
use foreman_core::store::PgStore;

use crate::config::ForemanConfig;
use crate::namespace_cmds::resolve_namespace;

pub async fn run_namespace(
    store: PgStore,
    namespace: &str,
    config: ForemanConfig,
    timeout_secs: Option<u64>,
) -> Result<()> {
    let ns = resolve_namespace(&store, namespace).await?;

    let mut runner_config = config.runner;
    if let Some(secs) = timeout_secs {
        runner_config.job_timeout = Duration::from_secs(secs);
    }

    let registry = HarnessRegistry::with_builtins(&config.binaries);
    println!("Running namespace: {} ({})", ns.name, ns.id);
    println!("  Harnesses: {}", registry.list().join(", "));
    println!("  Job timeout: {}s", runner_config.job_timeout.as_secs());
    if let Some(path) = &ns.project_path {
        println!("  Working directory: {path}");
    }

    // First signal drains, second force-exits.
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    let got_first_signal = Arc::new(AtomicBool::new(false));
    let got_first_clone = Arc::clone(&got_first_signal);

    tokio::spawn(async move {
        loop {
            tokio::signal::ctrl_c().await.ok();
            if got_first_clone.swap(true, Ordering::SeqCst) {
                eprintln!("\nForce exit.");
                std::process::exit(130);
            }
            eprintln!("\nShutting down gracefully (Ctrl+C again to force)...");
            cancel_clone.cancel();
        }
    });

    let runner = Runner::new(
        Arc::new(store),
        Arc::new(registry),
        ns,
        runner_config,
    );
    runner.run(cancel).await?;

    println!("Runner stopped.");
    Ok(())
}
