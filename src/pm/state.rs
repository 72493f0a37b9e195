use std::process::Child;
use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;

use crate::pm::cpu::CpuTracker;
use crate::pm::program::Program;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Restarting,
    Installing,
    Error,
    Broken,
}

impl ProcState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcState::Stopped => "stopped",
            ProcState::Starting => "starting",
            ProcState::Running => "running",
            ProcState::Stopping => "stopping",
            ProcState::Restarting => "restarting",
            ProcState::Installing => "installing",
            ProcState::Error => "error",
            ProcState::Broken => "broken",
        }
    }

    /// States a start request is legal from. Broken is included: every
    /// control-interface start is a manual action and resets the counter.
    pub fn startable(&self) -> bool {
        matches!(
            self,
            ProcState::Stopped | ProcState::Error | ProcState::Restarting | ProcState::Broken
        )
    }

    /// States in which remove/update of the declaration is allowed.
    pub fn at_rest(&self) -> bool {
        matches!(self, ProcState::Stopped | ProcState::Error)
    }
}

impl std::fmt::Display for ProcState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live state of one managed program. Guarded by the short `Cell::info`
/// mutex; never held across an await point.
#[derive(Debug, Default)]
pub struct ProcessInfo {
    pub state: ProcStateSlot,
    pub pid: Option<i32>,
    pub started_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub cpu: CpuTracker,
    /// Handle for children spawned by this supervisor instance. Adopted
    /// (reattached) children have a pid but no handle; their exit codes are
    /// unobservable.
    pub child: Option<Child>,
    /// When a pending auto-restart becomes due (state == restarting).
    pub restart_due: Option<Instant>,
}

/// Newtype so `ProcessInfo::default()` starts at `stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcStateSlot(pub ProcState);

impl Default for ProcStateSlot {
    fn default() -> Self {
        ProcStateSlot(ProcState::Stopped)
    }
}

impl ProcessInfo {
    pub fn state(&self) -> ProcState {
        self.state.0
    }

    pub fn set_state(&mut self, s: ProcState) {
        self.state = ProcStateSlot(s);
    }

    pub fn uptime_s(&self, now: DateTime<Utc>) -> Option<i64> {
        if self.state() != ProcState::Running {
            return None;
        }
        self.started_at.map(|t| (now - t).num_seconds().max(0))
    }
}

/// Per-program concurrency unit: `info` is the short state lock status
/// snapshots copy under; `op` serialises lifecycle operations (start, stop,
/// restart, install) and is held by an installer for the whole install. The
/// monitor only ever `try_lock`s `op`, so long operations are never blocked
/// on from the monitor tick.
#[derive(Debug, Default)]
pub struct Cell {
    pub info: Mutex<ProcessInfo>,
    pub op: AsyncMutex<()>,
}

/// Consistent per-program snapshot for the HTTP layer. The fleet as a whole
/// is not globally consistent, which is fine for a dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct StatusEntry {
    pub name: String,
    pub state: ProcState,
    pub pid: Option<i32>,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_s: Option<i64>,
    pub consecutive_failures: u32,
    pub cpu_samples: Option<Vec<f64>>,
    pub kind: &'static str,
    pub enabled: bool,
    pub uploaded: bool,
    pub comment: Option<String>,
}

impl StatusEntry {
    pub fn project(prog: &Program, info: &ProcessInfo, now: DateTime<Utc>) -> Self {
        Self {
            name: prog.name.clone(),
            state: info.state(),
            pid: info.pid,
            started_at: info.started_at,
            uptime_s: info.uptime_s(now),
            consecutive_failures: info.consecutive_failures,
            cpu_samples: info.cpu.samples(),
            kind: prog.kind.as_str(),
            enabled: prog.enabled,
            uploaded: prog.uploaded,
            comment: prog.comment.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_info_is_stopped_with_nothing_set() {
        let info = ProcessInfo::default();
        assert_eq!(info.state(), ProcState::Stopped);
        assert!(info.pid.is_none());
        assert_eq!(info.consecutive_failures, 0);
        assert!(info.uptime_s(Utc::now()).is_none());
    }

    #[test]
    fn startable_covers_manual_paths_only() {
        assert!(ProcState::Stopped.startable());
        assert!(ProcState::Error.startable());
        assert!(ProcState::Restarting.startable());
        assert!(ProcState::Broken.startable());
        assert!(!ProcState::Running.startable());
        assert!(!ProcState::Stopping.startable());
        assert!(!ProcState::Installing.startable());
    }

    #[test]
    fn uptime_only_while_running() {
        let mut info = ProcessInfo::default();
        let now = Utc::now();
        info.started_at = Some(now - chrono::Duration::seconds(42));
        assert!(info.uptime_s(now).is_none());
        info.set_state(ProcState::Running);
        assert_eq!(info.uptime_s(now), Some(42));
    }

    #[test]
    fn state_serialises_lowercase() {
        assert_eq!(
            serde_json::to_string(&ProcState::Restarting).unwrap(),
            "\"restarting\""
        );
        let s: ProcState = serde_json::from_str("\"broken\"").unwrap();
        assert_eq!(s, ProcState::Broken);
    }
}
