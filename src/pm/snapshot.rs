use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

/// Maximum tolerated gap between the recorded `started_at` and the OS
/// process-creation time when verifying a reattach candidate. PIDs get
/// reused; the creation-time check is what makes adoption safe.
pub const REATTACH_SKEW_SECS: i64 = 5;

/// Minimum state needed to reattach to a still-running child after a
/// supervisor restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedEntry {
    pub pid: i32,
    pub started_at: DateTime<Utc>,
    pub state: String,
}

pub type Snapshot = BTreeMap<String, PersistedEntry>;

/// Load the snapshot. The file is not a journal: a missing or corrupt file
/// simply yields an empty snapshot (and a warning for the corrupt case).
pub fn load(path: &Path) -> (Snapshot, Option<String>) {
    let raw = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return (Snapshot::new(), None);
        }
        Err(e) => {
            return (
                Snapshot::new(),
                Some(format!("failed to read {}: {e}", path.display())),
            );
        }
    };
    if raw.trim().is_empty() {
        return (Snapshot::new(), None);
    }
    match serde_json::from_str::<Snapshot>(&raw) {
        Ok(s) => (s, None),
        Err(e) => (
            Snapshot::new(),
            Some(format!(
                "snapshot {} is corrupted ({e}); continuing with empty snapshot",
                path.display()
            )),
        ),
    }
}

/// Atomic write: temp file, fsync, rename.
pub fn write(path: &Path, snapshot: &Snapshot) -> anyhow::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let json = serde_json::to_vec_pretty(snapshot)?;
    let tmp = parent.join(format!(".pids.json.tmp.{}", std::process::id()));
    {
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(&json)?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// `kill(pid, 0)`: does a process with this pid exist (and is it ours to
/// signal)?
pub fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    kill(Pid::from_raw(pid), None).is_ok()
}

/// Verify a snapshot entry: the pid must be alive and the OS creation time
/// must match `started_at` within a small skew. Where creation time cannot
/// be determined, reattach is refused — a bare pid check is unsafe against
/// pid reuse.
pub fn verify(entry: &PersistedEntry) -> bool {
    if !pid_alive(entry.pid) {
        return false;
    }
    let Some(created) = process_started_at(entry.pid) else {
        return false;
    };
    (created - entry.started_at).num_seconds().abs() <= REATTACH_SKEW_SECS
}

/// Wall-clock creation time of a process: boot time (`btime` from
/// `/proc/stat`) plus its starttime ticks from `/proc/<pid>/stat`.
#[cfg(target_os = "linux")]
pub fn process_started_at(pid: i32) -> Option<DateTime<Utc>> {
    let btime = read_boot_time_secs()?;
    let ticks = read_pid_starttime_ticks(pid)?;
    let hz = clock_ticks_per_second()?;
    let secs = btime as f64 + ticks as f64 / hz;
    Utc.timestamp_opt(secs as i64, 0).single()
}

#[cfg(not(target_os = "linux"))]
pub fn process_started_at(_pid: i32) -> Option<DateTime<Utc>> {
    None
}

#[cfg(target_os = "linux")]
fn read_boot_time_secs() -> Option<u64> {
    let stat = std::fs::read_to_string("/proc/stat").ok()?;
    for line in stat.lines() {
        if let Some(rest) = line.strip_prefix("btime ") {
            return rest.trim().parse().ok();
        }
    }
    None
}

#[cfg(target_os = "linux")]
fn read_pid_starttime_ticks(pid: i32) -> Option<u64> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let rparen = stat.rfind(')')?;
    let after = stat.get(rparen + 2..)?;
    let fields: Vec<&str> = after.split_whitespace().collect();
    // fields[0] is stat field 3 (state); starttime is field 22 => index 19.
    fields.get(19)?.parse().ok()
}

#[cfg(target_os = "linux")]
fn clock_ticks_per_second() -> Option<f64> {
    let v = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if v <= 0 {
        None
    } else {
        Some(v as f64)
    }
}
