use std::collections::VecDeque;
use std::time::Instant;

/// Samples kept per program; at the monitor cadence this is two minutes of
/// history.
pub const RING_CAPACITY: usize = 60;

/// Per-child CPU tracker: a short ring of CPU% readings plus the previous
/// (cpu-ticks, instant) pair the next delta is computed against.
///
/// Where process inspection is unavailable the tracker stays empty and status
/// reports null instead of fabricated zeros.
#[derive(Debug, Default)]
pub struct CpuTracker {
    last: Option<(u64, Instant)>,
    samples: VecDeque<f64>,
}

impl CpuTracker {
    pub fn reset(&mut self) {
        self.last = None;
        self.samples.clear();
    }

    /// Take one sample for `pid`. The first call after a reset only primes
    /// the baseline and records nothing.
    pub fn sample(&mut self, pid: i32) {
        let Some(ticks) = read_proc_cpu_ticks(pid) else {
            self.last = None;
            return;
        };
        let now = Instant::now();
        if let Some((prev_ticks, prev_at)) = self.last {
            let wall = now.duration_since(prev_at).as_secs_f64();
            if wall > 0.0 {
                let hz = clock_ticks_per_second();
                let ncpu = num_cpus::get() as f64;
                let cpu_secs = ticks.saturating_sub(prev_ticks) as f64 / hz;
                let pct = (cpu_secs / wall * 100.0 / ncpu).clamp(0.0, 100.0 * ncpu);
                self.samples.push_back(pct);
                while self.samples.len() > RING_CAPACITY {
                    self.samples.pop_front();
                }
            }
        }
        self.last = Some((ticks, now));
    }

    /// `None` when the inspection capability is missing on this platform,
    /// `Some` (possibly empty) otherwise.
    pub fn samples(&self) -> Option<Vec<f64>> {
        if !available() {
            return None;
        }
        Some(self.samples.iter().map(|v| (v * 10.0).round() / 10.0).collect())
    }
}

pub fn available() -> bool {
    cfg!(target_os = "linux")
}

fn clock_ticks_per_second() -> f64 {
    let v = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if v <= 0 {
        100.0
    } else {
        v as f64
    }
}

/// utime+stime in clock ticks from `/proc/<pid>/stat`. The comm field may
/// contain spaces and parentheses, so fields are counted from the last `)`.
#[cfg(target_os = "linux")]
fn read_proc_cpu_ticks(pid: i32) -> Option<u64> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let rparen = stat.rfind(')')?;
    let after = stat.get(rparen + 2..)?;
    let fields: Vec<&str> = after.split_whitespace().collect();
    // fields[0] is stat field 3 (state); utime is field 14 => index 11,
    // stime field 15 => index 12.
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

#[cfg(not(target_os = "linux"))]
fn read_proc_cpu_ticks(_pid: i32) -> Option<u64> {
    None
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn reads_own_cpu_ticks() {
        let pid = std::process::id() as i32;
        assert!(read_proc_cpu_ticks(pid).is_some());
    }

    #[test]
    fn first_sample_primes_then_records() {
        let pid = std::process::id() as i32;
        let mut t = CpuTracker::default();
        t.sample(pid);
        assert_eq!(t.samples().unwrap().len(), 0);
        // Burn a little CPU so the delta is well-defined.
        let mut acc = 0u64;
        for i in 0..2_000_000u64 {
            acc = acc.wrapping_add(i);
        }
        std::hint::black_box(acc);
        std::thread::sleep(std::time::Duration::from_millis(20));
        t.sample(pid);
        let samples = t.samples().unwrap();
        assert_eq!(samples.len(), 1);
        assert!(samples[0] >= 0.0);
    }

    #[test]
    fn ring_is_bounded() {
        let pid = std::process::id() as i32;
        let mut t = CpuTracker::default();
        t.sample(pid);
        for _ in 0..(RING_CAPACITY + 10) {
            std::thread::sleep(std::time::Duration::from_millis(1));
            t.sample(pid);
        }
        assert_eq!(t.samples().unwrap().len(), RING_CAPACITY);
    }

    #[test]
    fn dead_pid_yields_nothing() {
        let mut t = CpuTracker::default();
        t.sample(-1);
        assert_eq!(t.samples().unwrap().len(), 0);
    }
}
