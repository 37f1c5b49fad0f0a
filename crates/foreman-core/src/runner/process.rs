//! Process-group signalling for agent processes.
//!
//! Agents are spawned as leaders of their own process group, so signals sent
//! to `-pid` also reach any tools they started.

use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::Child;

/// Send `signal` to the process group led by `pid`. A group that no longer
/// exists is not an error.
#[cfg(unix)]
pub fn signal_group(pid: u32, signal: i32) -> std::io::Result<()> {
    let Ok(pgid) = i32::try_from(pid) else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("pid {pid} out of range"),
        ));
    };
    // SAFETY: plain syscall on a pid we spawned; no memory is shared.
    let ret = unsafe { libc::kill(-pgid, signal) };
    if ret == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

/// Stop `child`: SIGTERM to its process group, then SIGKILL once `grace`
/// has passed without it exiting.
///
/// A child that has already exited is left alone, so calling this twice is
/// harmless. Returns the exit status if it could be collected.
pub async fn terminate(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    if let Ok(Some(status)) = child.try_wait() {
        return Some(status);
    }

    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            if let Err(e) = signal_group(pid, libc::SIGTERM) {
                tracing::warn!(pid, error = %e, "SIGTERM failed, proceeding to SIGKILL");
            }
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(pid, "process exited after SIGTERM");
                    return Some(status);
                }
                Ok(Err(e)) => tracing::warn!(pid, error = %e, "error waiting for process"),
                Err(_) => tracing::debug!(pid, "grace period elapsed, sending SIGKILL"),
            }
            if let Err(e) = signal_group(pid, libc::SIGKILL) {
                tracing::warn!(pid, error = %e, "SIGKILL to process group failed");
            }
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    // Covers the leader itself even if the group signal could not be sent.
    let _ = child.start_kill();
    child.wait().await.ok()
}
