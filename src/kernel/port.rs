//! Port-occupancy and liveness probes used by the spawn algorithm and by
//! external-monitor mode.

use tokio::process::Command;

/// Probes whether `port` already has a listener, returning the occupying
/// PID if so. Shells out to `lsof`; absence of `lsof` or a parse failure is
/// treated as "nothing listening" rather than an error, since the subsequent
/// bind attempt is the authoritative check.
pub async fn probe_listener(port: u16) -> Option<u32> {
    let output = Command::new("lsof")
        .arg(format!("-ti:{port}"))
        .arg("-sTCP:LISTEN")
        .output()
        .await
        .ok()?;

    if !output.status.success() {
        return None;
    }

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .and_then(|line| line.trim().parse::<u32>().ok())
}

/// Checks whether `pid` still refers to a live process, for external-monitor
/// mode's periodic poll.
#[cfg(target_os = "linux")]
pub fn is_alive(pid: u32) -> bool {
    std::path::Path::new(&format!("/proc/{pid}")).exists()
}

/// Non-Linux fallback: `kill(pid, 0)` reports liveness without signalling.
#[cfg(not(target_os = "linux"))]
pub fn is_alive(pid: u32) -> bool {
    // SAFETY: signal 0 sends nothing, it only validates that `pid` exists
    // and is signalable; the return value (not the signal) is what we use.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_process_is_alive() {
        assert!(is_alive(std::process::id()));
    }

    #[test]
    fn pid_zero_is_not_a_real_process() {
        // PID 1 is conventionally init/systemd and always alive in any
        // container this test could run in; an absurdly high PID is the
        // portable way to probe "almost certainly doesn't exist".
        assert!(!is_alive(u32::MAX));
    }
}
