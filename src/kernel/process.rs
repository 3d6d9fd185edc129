//! The `ManagedProcess` record and the options used to spawn one.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tokio::process::Child;
use tokio::sync::watch;

/// Lifecycle state of a [`ManagedProcess`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Starting,
    Running,
    Stopped,
    Failed,
}

/// Caller-supplied spawn parameters.
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub auto_restart: bool,
    /// When set, the spawn algorithm probes for an existing LISTENer on this
    /// port before forking a new child.
    pub port: Option<u16>,
}

/// Whether this process's OS handle is owned by the kernel (forked by us, we
/// can signal and reap it) or merely observed (an external-monitor record).
pub enum Ownership {
    Owned(Child),
    External,
}

/// A supervised child process. Owned exclusively by the [`crate::kernel::Kernel`]'s
/// process table.
pub struct ManagedProcess {
    pub id: String,
    pub name: String,
    pub script_path: String,
    pub argv: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub pid: Option<u32>,
    pub start_time: DateTime<Utc>,
    pub restart_count: u32,
    pub auto_restart: bool,
    pub status: ProcessStatus,
    pub port: Option<u16>,
    pub ownership: Ownership,
    /// Flipped once a `SERVER_READY` line is observed on stdout. `watch`
    /// rather than `oneshot` because `spawn`'s caller may check readiness
    /// after it has already fired.
    pub ready: watch::Sender<bool>,
}

impl ManagedProcess {
    pub fn ready_receiver(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }

    pub fn mark_ready(&self) {
        let _ = self.ready.send(true);
    }

    pub fn is_owned(&self) -> bool {
        matches!(self.ownership, Ownership::Owned(_))
    }
}
