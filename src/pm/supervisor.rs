use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;

use crate::pm::config::{RestartPolicy, Settings, StatePaths};
use crate::pm::daemon::event;
use crate::pm::errors::ControlError;
use crate::pm::installer::{self, InstallJob};
use crate::pm::logs::{self, LogPage, DEFAULT_PAGE_LINES};
use crate::pm::program::{sanitize_name, Program, ProgramKind};
use crate::pm::registry::{ProgramPatch, Registry};
use crate::pm::snapshot::{self, PersistedEntry, Snapshot};
use crate::pm::state::{Cell, ProcState, ProcessInfo, StatusEntry};

/// Cadence of the single monitor worker.
pub const MONITOR_INTERVAL: Duration = Duration::from_secs(2);
/// SIGTERM grace window before a stop escalates to SIGKILL.
pub const GRACEFUL_TIMEOUT_SECS: u64 = 10;

/// The supervision engine and the control interface the HTTP layer calls.
///
/// One `Cell` per declared program: its `info` mutex guards the live record
/// for snapshot reads, its `op` mutex serialises lifecycle operations. The
/// monitor worker only ever `try_lock`s `op`, so a slow stop or a 5-minute
/// install never stalls the rest of the fleet.
pub struct Supervisor {
    pub settings: Settings,
    pub paths: StatePaths,
    pub registry: Registry,
    cells: Mutex<BTreeMap<String, Arc<Cell>>>,
    shutting_down: Arc<AtomicBool>,
}

/// Fields of a multipart upload, minus the archive itself.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub name: String,
    pub kind: ProgramKind,
    pub script: Option<String>,
    pub enabled: bool,
    pub args: Vec<String>,
    pub environment: Vec<String>,
    pub comment: Option<String>,
}

impl Supervisor {
    pub fn new(
        settings: Settings,
        paths: StatePaths,
        registry: Registry,
        shutting_down: Arc<AtomicBool>,
    ) -> Self {
        let sup = Self {
            settings,
            paths,
            registry,
            cells: Mutex::new(BTreeMap::new()),
            shutting_down,
        };
        for name in sup.registry.names() {
            sup.cell(&name);
        }
        sup
    }

    fn cell(&self, name: &str) -> Arc<Cell> {
        let mut cells = self.cells.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(cells.entry(name.to_string()).or_default())
    }

    fn drop_cell(&self, name: &str) {
        let mut cells = self.cells.lock().unwrap_or_else(|p| p.into_inner());
        cells.remove(name);
    }

    fn lock_info<'a>(&self, cell: &'a Cell) -> MutexGuard<'a, ProcessInfo> {
        cell.info.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    // -------- status / logs --------

    pub fn status(&self) -> Vec<StatusEntry> {
        let now = Utc::now();
        let mut out = Vec::new();
        for prog in self.registry.list() {
            let cell = self.cell(&prog.name);
            let info = self.lock_info(&cell);
            out.push(StatusEntry::project(&prog, &info, now));
        }
        out
    }

    pub fn logs(
        &self,
        name: &str,
        offset: Option<usize>,
        lines: Option<usize>,
    ) -> Result<LogPage, ControlError> {
        if !self.registry.contains(name) {
            return Err(ControlError::NotFound(name.to_string()));
        }
        let path = logs::log_path(&self.paths.log_dir, name);
        let page = logs::read_page(
            &path,
            offset.unwrap_or(0),
            lines.unwrap_or(DEFAULT_PAGE_LINES),
        )?;
        Ok(page)
    }

    // -------- declaration operations --------

    pub fn add(self: &Arc<Self>, prog: Program) -> Result<(), ControlError> {
        if prog.uploaded {
            return Err(ControlError::BadDeclaration(
                "uploaded programs are created through upload, not add".into(),
            ));
        }
        self.registry.add(prog.clone())?;
        self.cell(&prog.name);
        event("registry", Some(&prog.name), "added");
        if prog.enabled {
            // Enabled means auto-start; a freshly added program starts right
            // away, the same as it would on the next boot.
            let sup = Arc::clone(self);
            let name = prog.name.clone();
            tokio::spawn(async move {
                if let Err(e) = sup.start(&name).await {
                    event("start", Some(&name), format!("outcome=error err={e}"));
                }
            });
        }
        Ok(())
    }

    pub fn edit(&self, name: &str, patch: &ProgramPatch) -> Result<Program, ControlError> {
        let updated = self.registry.edit(name, patch)?;
        event("registry", Some(name), "edited");
        Ok(updated)
    }

    pub async fn remove(&self, name: &str) -> Result<(), ControlError> {
        let prog = self
            .registry
            .get(name)
            .ok_or_else(|| ControlError::NotFound(name.to_string()))?;
        let cell = self.cell(name);
        let _op = cell.op.lock().await;
        {
            let info = self.lock_info(&cell);
            let st = info.state();
            if !st.at_rest() {
                return Err(ControlError::Busy {
                    name: name.to_string(),
                    state: st.as_str(),
                });
            }
        }
        self.registry.remove(name)?;
        drop(_op);
        self.drop_cell(name);
        if prog.uploaded {
            let dir = self.paths.uploaded_dir.join(sanitize_name(name));
            if dir.exists() {
                let _ = std::fs::remove_dir_all(&dir);
            }
            let _ = std::fs::remove_file(logs::log_path(&self.paths.log_dir, name));
            let _ = std::fs::remove_file(logs::rotated_path(&self.paths.log_dir, name));
        }
        event("registry", Some(name), "removed");
        Ok(())
    }

    // -------- lifecycle operations --------

    pub async fn start(&self, name: &str) -> Result<(), ControlError> {
        let prog = self
            .registry
            .get(name)
            .ok_or_else(|| ControlError::NotFound(name.to_string()))?;
        let cell = self.cell(name);
        let _op = cell.op.lock().await;
        {
            let mut info = self.lock_info(&cell);
            let st = info.state();
            if !st.startable() {
                return Err(ControlError::Busy {
                    name: name.to_string(),
                    state: st.as_str(),
                });
            }
            if st == ProcState::Broken {
                // Manual start out of broken resets the failure counter.
                info.consecutive_failures = 0;
            }
            info.restart_due = None;
        }
        self.do_spawn(&prog, &cell)
    }

    /// Idempotent: stopping an already-stopped (or errored/broken) program
    /// succeeds without side effects.
    pub async fn stop(&self, name: &str) -> Result<(), ControlError> {
        if !self.registry.contains(name) {
            return Err(ControlError::NotFound(name.to_string()));
        }
        let cell = self.cell(name);
        let _op = cell.op.lock().await;
        let pid = {
            let mut info = self.lock_info(&cell);
            match info.state() {
                ProcState::Stopped | ProcState::Error | ProcState::Broken => return Ok(()),
                ProcState::Restarting if info.pid.is_none() => {
                    // Cancel the pending auto-restart; there is no child.
                    info.set_state(ProcState::Stopped);
                    info.restart_due = None;
                    None
                }
                _ => {
                    info.set_state(ProcState::Stopping);
                    info.pid
                }
            }
        };
        if let Some(pid) = pid {
            event("stop", Some(name), format!("attempt=signal pid={pid}"));
            self.terminate(&cell, pid).await;
        }
        {
            let mut info = self.lock_info(&cell);
            info.set_state(ProcState::Stopped);
            info.pid = None;
            info.child = None;
            info.restart_due = None;
            info.cpu.reset();
        }
        self.write_snapshot();
        event("stop", Some(name), "outcome=stopped");
        Ok(())
    }

    /// Stop then start; also resets the failure counter and clears a prior
    /// broken state.
    pub async fn restart(&self, name: &str) -> Result<(), ControlError> {
        let prog = self
            .registry
            .get(name)
            .ok_or_else(|| ControlError::NotFound(name.to_string()))?;
        let cell = self.cell(name);
        let _op = cell.op.lock().await;
        let pid = {
            let mut info = self.lock_info(&cell);
            info.consecutive_failures = 0;
            info.restart_due = None;
            if info.pid.is_some() {
                info.set_state(ProcState::Stopping);
            }
            info.pid
        };
        if let Some(pid) = pid {
            event("restart", Some(name), format!("attempt=stop pid={pid}"));
            self.terminate(&cell, pid).await;
        }
        {
            let mut info = self.lock_info(&cell);
            info.set_state(ProcState::Stopped);
            info.pid = None;
            info.child = None;
            info.cpu.reset();
        }
        self.do_spawn(&prog, &cell)
    }

    // Request variants for the HTTP layer: validate synchronously, run the
    // (possibly long) operation on a background task, so the endpoint can
    // answer 202 while a graceful stop waits out its timeout.

    pub fn request_start(self: &Arc<Self>, name: &str) -> Result<(), ControlError> {
        if !self.registry.contains(name) {
            return Err(ControlError::NotFound(name.to_string()));
        }
        let cell = self.cell(name);
        let st = self.lock_info(&cell).state();
        if !st.startable() {
            return Err(ControlError::Busy {
                name: name.to_string(),
                state: st.as_str(),
            });
        }
        self.dispatch("start", name, |sup, name| async move { sup.start(&name).await });
        Ok(())
    }

    pub fn request_stop(self: &Arc<Self>, name: &str) -> Result<(), ControlError> {
        if !self.registry.contains(name) {
            return Err(ControlError::NotFound(name.to_string()));
        }
        let cell = self.cell(name);
        let st = self.lock_info(&cell).state();
        if st == ProcState::Installing {
            return Err(ControlError::Busy {
                name: name.to_string(),
                state: st.as_str(),
            });
        }
        self.dispatch("stop", name, |sup, name| async move { sup.stop(&name).await });
        Ok(())
    }

    pub fn request_restart(self: &Arc<Self>, name: &str) -> Result<(), ControlError> {
        if !self.registry.contains(name) {
            return Err(ControlError::NotFound(name.to_string()));
        }
        let cell = self.cell(name);
        let st = self.lock_info(&cell).state();
        if st == ProcState::Installing || st == ProcState::Stopping {
            return Err(ControlError::Busy {
                name: name.to_string(),
                state: st.as_str(),
            });
        }
        self.dispatch("restart", name, |sup, name| async move {
            sup.restart(&name).await
        });
        Ok(())
    }

    fn dispatch<F, Fut>(self: &Arc<Self>, what: &'static str, name: &str, f: F)
    where
        F: FnOnce(Arc<Supervisor>, String) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<(), ControlError>> + Send + 'static,
    {
        let sup = Arc::clone(self);
        let name = name.to_string();
        tokio::spawn(async move {
            if let Err(e) = f(Arc::clone(&sup), name.clone()).await {
                event(what, Some(&name), format!("outcome=error err={e}"));
            }
        });
    }

    // -------- install pipeline --------

    pub fn upload(self: &Arc<Self>, req: UploadRequest, archive: Vec<u8>) -> Result<(), ControlError> {
        installer::validate_archive(&archive)?;
        let stem = sanitize_name(&req.name);
        let program_dir = self.paths.uploaded_dir.join(&stem);
        let prog = Program {
            name: req.name.clone(),
            kind: req.kind,
            script: req.script.clone(),
            module: None,
            enabled: req.enabled,
            uploaded: true,
            venv: (req.kind == ProgramKind::Python).then(|| program_dir.join(".venv")),
            cwd: Some(program_dir.clone()),
            args: req.args.clone(),
            environment: req.environment.clone(),
            comment: req.comment.clone(),
        };
        prog.validate()?;
        if program_dir.exists() {
            return Err(ControlError::NameConflict(req.name));
        }
        self.registry.add(prog.clone())?;
        let cell = self.cell(&req.name);
        self.lock_info(&cell).set_state(ProcState::Installing);
        event("install", Some(&req.name), "queued kind=upload");

        let job = InstallJob {
            name: req.name.clone(),
            kind: req.kind,
            script: req.script,
            program_dir,
            log_path: logs::log_path(&self.paths.log_dir, &req.name),
            python: self.settings.python_interpreter(),
            archive,
            update: false,
        };
        self.queue_install(job, prog.enabled);
        Ok(())
    }

    pub fn update(self: &Arc<Self>, name: &str, archive: Vec<u8>) -> Result<(), ControlError> {
        let prog = self
            .registry
            .get(name)
            .ok_or_else(|| ControlError::NotFound(name.to_string()))?;
        if !prog.uploaded {
            return Err(ControlError::BadDeclaration(format!(
                "program '{name}' was not uploaded; only uploaded programs can be updated"
            )));
        }
        installer::validate_archive(&archive)?;
        let program_dir = self.paths.uploaded_dir.join(sanitize_name(name));
        if !program_dir.exists() {
            return Err(ControlError::BadDeclaration(format!(
                "program directory for '{name}' is missing"
            )));
        }
        let cell = self.cell(name);
        {
            let mut info = self.lock_info(&cell);
            let st = info.state();
            if !st.at_rest() {
                return Err(ControlError::Busy {
                    name: name.to_string(),
                    state: st.as_str(),
                });
            }
            info.set_state(ProcState::Installing);
        }
        event("install", Some(name), "queued kind=update");

        let job = InstallJob {
            name: name.to_string(),
            kind: prog.kind,
            script: prog.script.clone(),
            program_dir,
            log_path: logs::log_path(&self.paths.log_dir, name),
            python: self.settings.python_interpreter(),
            archive,
            update: true,
        };
        self.queue_install(job, false);
        Ok(())
    }

    /// Background install worker. Owns the program's operation mutex for the
    /// entire install; the blocking pipeline runs on the blocking pool.
    fn queue_install(self: &Arc<Self>, job: InstallJob, autostart: bool) {
        let sup = Arc::clone(self);
        tokio::spawn(async move {
            let name = job.name.clone();
            let cell = sup.cell(&name);
            let _op = cell.op.lock().await;
            let outcome = tokio::task::spawn_blocking(move || installer::run(&job)).await;
            match outcome {
                Ok(Ok(())) => {
                    sup.lock_info(&cell).set_state(ProcState::Stopped);
                    event("install", Some(&name), "outcome=ok");
                    if autostart && !sup.shutting_down() {
                        if let Some(prog) = sup.registry.get(&name) {
                            if prog.enabled {
                                if let Err(e) = sup.do_spawn(&prog, &cell) {
                                    event("start", Some(&name), format!("outcome=error err={e}"));
                                }
                            }
                        }
                    }
                }
                Ok(Err(e)) => {
                    sup.lock_info(&cell).set_state(ProcState::Error);
                    event("install", Some(&name), format!("outcome=error err={e}"));
                }
                Err(join_err) => {
                    sup.lock_info(&cell).set_state(ProcState::Error);
                    event("install", Some(&name), format!("outcome=panic err={join_err}"));
                }
            }
        });
    }

    // -------- engine internals --------

    /// Spawn a child for `prog`. Callers hold the cell's operation mutex.
    fn do_spawn(&self, prog: &Program, cell: &Cell) -> Result<(), ControlError> {
        self.lock_info(cell).set_state(ProcState::Starting);
        let log_path = logs::log_path(&self.paths.log_dir, &prog.name);

        let spawned = (|| -> Result<std::process::Child, ControlError> {
            let inv = crate::pm::spawn::build_invocation(&self.settings, prog)?;
            for w in &inv.warnings {
                let _ = logs::append_line(&log_path, &format!("[progman] {w}"));
            }
            let log = logs::open_append(&log_path)?;
            crate::pm::spawn::spawn_command(&inv.argv, &inv.cwd, &inv.env, log)
                .map_err(|e| ControlError::SpawnFailed(format!("{}: {e}", inv.argv[0])))
        })();

        match spawned {
            Ok(child) => {
                let pid = child.id() as i32;
                {
                    let mut info = self.lock_info(cell);
                    info.set_state(ProcState::Running);
                    info.pid = Some(pid);
                    info.started_at = Some(Utc::now());
                    info.child = Some(child);
                    info.restart_due = None;
                    info.cpu.reset();
                }
                event("start", Some(&prog.name), format!("outcome=running pid={pid}"));
                self.write_snapshot();
                Ok(())
            }
            Err(e) => {
                {
                    let mut info = self.lock_info(cell);
                    info.set_state(ProcState::Error);
                    info.pid = None;
                    info.child = None;
                }
                let _ = logs::append_line(&log_path, &format!("[progman] failed to start: {e}"));
                event("start", Some(&prog.name), format!("outcome=error err={e}"));
                self.write_snapshot();
                Err(e)
            }
        }
    }

    /// SIGTERM the child's process group, wait out the grace window, then
    /// SIGKILL. The child is its own session leader (spawned via setsid),
    /// so its pgid is its pid — for adopted children too.
    async fn terminate(&self, cell: &Arc<Cell>, pid: i32) {
        let pg = Pid::from_raw(pid);
        let _ = killpg(pg, Signal::SIGTERM);
        let deadline = Instant::now() + Duration::from_secs(GRACEFUL_TIMEOUT_SECS);
        loop {
            if !self.probe_alive(cell, pid) {
                break;
            }
            if Instant::now() >= deadline {
                let _ = killpg(pg, Signal::SIGKILL);
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        // Reap our own child so no zombie lingers. Adopted children are not
        // ours to wait on; init reaps those.
        let child = self.lock_info(cell).child.take();
        if let Some(mut child) = child {
            for _ in 0..30 {
                match child.try_wait() {
                    Ok(Some(_)) => return,
                    Ok(None) => tokio::time::sleep(Duration::from_millis(100)).await,
                    Err(_) => return,
                }
            }
        }
    }

    fn probe_alive(&self, cell: &Arc<Cell>, pid: i32) -> bool {
        let mut info = self.lock_info(cell);
        if let Some(child) = info.child.as_mut() {
            matches!(child.try_wait(), Ok(None))
        } else {
            snapshot::pid_alive(pid)
        }
    }

    // -------- monitor --------

    pub fn spawn_monitor(self: &Arc<Self>) {
        let sup = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MONITOR_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if sup.shutting_down() {
                    break;
                }
                sup.monitor_tick();
            }
        });
    }

    /// One pass over the fleet. Per-program failures are logged and never
    /// abort the tick; a program whose operation mutex is held (stop in
    /// progress, install running) is skipped — its owner updates state.
    pub fn monitor_tick(&self) {
        for name in self.registry.names() {
            let cell = self.cell(&name);
            let Ok(_op) = cell.op.try_lock() else {
                continue;
            };
            if let Err(e) = self.check_one(&name, &cell) {
                event("monitor", Some(&name), format!("check_failed err={e}"));
            }
        }
    }

    fn check_one(&self, name: &str, cell: &Arc<Cell>) -> anyhow::Result<()> {
        let Some(prog) = self.registry.get(name) else {
            return Ok(());
        };
        let now = Utc::now();

        enum Action {
            None,
            Died {
                exit_code: Option<i32>,
                decision: ExitDecision,
            },
            Respawn,
        }

        let action = {
            let mut info = self.lock_info(cell);
            match info.state() {
                ProcState::Running => match probe(&mut info) {
                    Probe::Alive => {
                        if let Some(pid) = info.pid {
                            info.cpu.sample(pid);
                        }
                        // A run that survived the reset window clears the
                        // failure streak.
                        if info.consecutive_failures > 0 {
                            if let Some(started) = info.started_at {
                                if (now - started).num_seconds()
                                    >= self.settings.restart.failure_reset_seconds as i64
                                {
                                    info.consecutive_failures = 0;
                                }
                            }
                        }
                        Action::None
                    }
                    Probe::Dead(exit_code) => {
                        let run_secs = info
                            .started_at
                            .map(|t| (now - t).num_seconds())
                            .unwrap_or(0);
                        let decision = decide_exit(
                            exit_code,
                            prog.enabled,
                            run_secs,
                            info.consecutive_failures,
                            &self.settings.restart,
                        );
                        // State transition and pid clearing come before any
                        // logging so a concurrent status query never sees a
                        // dead pid with state=running.
                        info.pid = None;
                        info.child = None;
                        info.cpu.reset();
                        match decision {
                            ExitDecision::Orderly => info.set_state(ProcState::Stopped),
                            ExitDecision::Backoff { failures } => {
                                info.consecutive_failures = failures;
                                info.last_failure_at = Some(now);
                                info.set_state(ProcState::Restarting);
                                info.restart_due = Some(
                                    Instant::now()
                                        + Duration::from_secs(self.settings.restart.delay_seconds),
                                );
                            }
                            ExitDecision::Broken { failures } => {
                                info.consecutive_failures = failures;
                                info.last_failure_at = Some(now);
                                info.set_state(ProcState::Broken);
                            }
                        }
                        Action::Died {
                            exit_code,
                            decision,
                        }
                    }
                },
                ProcState::Restarting => {
                    if info.restart_due.is_some_and(|due| Instant::now() >= due) {
                        info.restart_due = None;
                        Action::Respawn
                    } else {
                        Action::None
                    }
                }
                _ => Action::None,
            }
        };

        match action {
            Action::None => {}
            Action::Died {
                exit_code,
                decision,
            } => {
                let code = exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                match decision {
                    ExitDecision::Orderly => {
                        event("monitor", Some(name), format!("event=exit code={code} decision=stopped"));
                    }
                    ExitDecision::Backoff { failures } => {
                        event(
                            "monitor",
                            Some(name),
                            format!(
                                "event=exit code={code} decision=restart failures={failures}/{} delay_s={}",
                                self.settings.restart.max_consecutive_failures,
                                self.settings.restart.delay_seconds
                            ),
                        );
                    }
                    ExitDecision::Broken { failures } => {
                        event(
                            "monitor",
                            Some(name),
                            format!("event=exit code={code} decision=broken failures={failures}"),
                        );
                        let _ = logs::append_line(
                            &logs::log_path(&self.paths.log_dir, name),
                            &format!(
                                "[progman] marked broken after {failures} consecutive failures; restart manually to re-enable"
                            ),
                        );
                    }
                }
                self.write_snapshot();
            }
            Action::Respawn => {
                if prog.enabled && !self.shutting_down() {
                    event("monitor", Some(name), "event=restart_due");
                    let _ = self.do_spawn(&prog, cell);
                } else {
                    let mut info = self.lock_info(cell);
                    info.set_state(ProcState::Stopped);
                }
            }
        }

        let log_path = logs::log_path(&self.paths.log_dir, name);
        if logs::rotate_if_needed(&log_path, self.settings.logging.max_bytes())? {
            event("log", Some(name), "rotated");
        }
        Ok(())
    }

    // -------- persistence / boot --------

    /// Rewrite `pids.json` from live state. Best-effort: a failed write is
    /// an event, not an error — the snapshot is not a journal.
    pub fn write_snapshot(&self) {
        let mut snap = Snapshot::new();
        {
            let cells = self.cells.lock().unwrap_or_else(|p| p.into_inner());
            for (name, cell) in cells.iter() {
                let info = cell.info.lock().unwrap_or_else(|p| p.into_inner());
                if matches!(info.state(), ProcState::Running | ProcState::Stopping) {
                    if let (Some(pid), Some(started_at)) = (info.pid, info.started_at) {
                        snap.insert(
                            name.clone(),
                            PersistedEntry {
                                pid,
                                started_at,
                                state: info.state().as_str().to_string(),
                            },
                        );
                    }
                }
            }
        }
        if let Err(e) = snapshot::write(&self.paths.pid_file, &snap) {
            event("snapshot", None, format!("write_failed err={e}"));
        }
    }

    /// Adopt children that survived the previous supervisor. Verification
    /// requires both a live pid and a matching OS creation time; everything
    /// else is dropped to stopped.
    pub fn reattach(&self) {
        let (snap, warning) = snapshot::load(&self.paths.pid_file);
        if let Some(w) = warning {
            event("snapshot", None, w);
        }
        for (name, entry) in &snap {
            if !self.registry.contains(name) {
                event("reattach", Some(name), format!("dropped pid={} reason=undeclared", entry.pid));
                continue;
            }
            let cell = self.cell(name);
            if snapshot::verify(entry) {
                let mut info = self.lock_info(&cell);
                info.set_state(ProcState::Running);
                info.pid = Some(entry.pid);
                info.started_at = Some(entry.started_at);
                info.child = None;
                info.cpu.reset();
                drop(info);
                // Touch the log so rotation bookkeeping starts fresh.
                let _ = logs::open_append(&logs::log_path(&self.paths.log_dir, name));
                event("reattach", Some(name), format!("adopted pid={}", entry.pid));
            } else {
                event(
                    "reattach",
                    Some(name),
                    format!("dropped pid={} reason=verification_failed", entry.pid),
                );
            }
        }
        self.write_snapshot();
    }

    /// Start every enabled program that is still stopped (after reattach).
    pub async fn autostart(self: &Arc<Self>) {
        for prog in self.registry.list() {
            if !prog.enabled {
                continue;
            }
            let st = {
                let cell = self.cell(&prog.name);
                let info = self.lock_info(&cell);
                info.state()
            };
            if st == ProcState::Stopped {
                if let Err(e) = self.start(&prog.name).await {
                    event("autostart", Some(&prog.name), format!("outcome=error err={e}"));
                }
            }
        }
    }
}

// -------- exit policy --------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExitDecision {
    /// Orderly end of a run: disabled program, or a clean exit after a
    /// stable run. No restart.
    Orderly,
    /// Count a failure and schedule a delayed respawn.
    Backoff { failures: u32 },
    /// Failure streak hit the limit: suspend auto-restart until a manual
    /// restart resets the counter.
    Broken { failures: u32 },
}

/// Decide what a detected death means. A clean exit (code 0) counts as a
/// failure only when the run lasted less than `failure_reset_seconds`; any
/// run at least that long wipes the prior streak before counting.
pub(crate) fn decide_exit(
    exit_code: Option<i32>,
    enabled: bool,
    run_secs: i64,
    prior_failures: u32,
    policy: &RestartPolicy,
) -> ExitDecision {
    if !enabled {
        return ExitDecision::Orderly;
    }
    let stable = run_secs >= policy.failure_reset_seconds as i64;
    if exit_code == Some(0) && stable {
        return ExitDecision::Orderly;
    }
    let prior = if stable { 0 } else { prior_failures };
    let failures = prior.saturating_add(1);
    if failures >= policy.max_consecutive_failures {
        ExitDecision::Broken { failures }
    } else {
        ExitDecision::Backoff { failures }
    }
}

enum Probe {
    Alive,
    Dead(Option<i32>),
}

/// Liveness probe: `try_wait` for children we spawned (also reaps them),
/// `kill(pid, 0)` for adopted ones. Adopted children expose no exit code.
fn probe(info: &mut ProcessInfo) -> Probe {
    if let Some(child) = info.child.as_mut() {
        match child.try_wait() {
            Ok(Some(status)) => Probe::Dead(status.code()),
            Ok(None) => Probe::Alive,
            Err(_) => match info.pid {
                Some(pid) if snapshot::pid_alive(pid) => Probe::Alive,
                _ => Probe::Dead(None),
            },
        }
    } else if let Some(pid) = info.pid {
        if snapshot::pid_alive(pid) {
            Probe::Alive
        } else {
            Probe::Dead(None)
        }
    } else {
        Probe::Dead(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pm::config::{LogPolicy, WebUi};
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn policy(max: u32, reset: u64) -> RestartPolicy {
        RestartPolicy {
            delay_seconds: 0,
            max_consecutive_failures: max,
            failure_reset_seconds: reset,
        }
    }

    #[test]
    fn crash_streak_reaches_broken_at_limit() {
        // S1: exec program exiting 1 immediately, max 3 -> exactly 3 runs.
        let p = policy(3, 60);
        assert_eq!(
            decide_exit(Some(1), true, 0, 0, &p),
            ExitDecision::Backoff { failures: 1 }
        );
        assert_eq!(
            decide_exit(Some(1), true, 0, 1, &p),
            ExitDecision::Backoff { failures: 2 }
        );
        assert_eq!(
            decide_exit(Some(1), true, 0, 2, &p),
            ExitDecision::Broken { failures: 3 }
        );
    }

    #[test]
    fn stable_run_resets_streak_before_counting() {
        // S2: 90s runs with reset at 60s never accumulate.
        let p = policy(3, 60);
        assert_eq!(
            decide_exit(Some(1), true, 90, 0, &p),
            ExitDecision::Backoff { failures: 1 }
        );
        assert_eq!(
            decide_exit(Some(1), true, 90, 1, &p),
            ExitDecision::Backoff { failures: 1 }
        );
    }

    #[test]
    fn clean_exit_is_failure_only_when_short() {
        let p = policy(10, 60);
        assert_eq!(
            decide_exit(Some(0), true, 5, 0, &p),
            ExitDecision::Backoff { failures: 1 }
        );
        assert_eq!(decide_exit(Some(0), true, 120, 4, &p), ExitDecision::Orderly);
    }

    #[test]
    fn disabled_program_exit_is_orderly() {
        let p = policy(3, 60);
        assert_eq!(decide_exit(Some(1), false, 0, 2, &p), ExitDecision::Orderly);
        assert_eq!(decide_exit(None, false, 0, 2, &p), ExitDecision::Orderly);
    }

    #[test]
    fn unknown_exit_code_counts_as_failure() {
        let p = policy(3, 60);
        assert_eq!(
            decide_exit(None, true, 0, 0, &p),
            ExitDecision::Backoff { failures: 1 }
        );
    }

    // -------- engine integration (real children) --------

    fn test_settings(base: &Path, max_failures: u32) -> Settings {
        Settings {
            web_ui: WebUi {
                host: "127.0.0.1".into(),
                port: 0,
                title: "test".into(),
            },
            venv: None,
            node: None,
            cwd: None,
            restart: RestartPolicy {
                delay_seconds: 0,
                max_consecutive_failures: max_failures,
                failure_reset_seconds: 60,
            },
            logging: LogPolicy { max_size_mb: 10 },
            base_dir: base.to_path_buf(),
        }
    }

    fn exec_program(name: &str, script: &str) -> Program {
        Program {
            name: name.into(),
            kind: ProgramKind::Exec,
            script: Some(script.into()),
            module: None,
            enabled: true,
            uploaded: false,
            venv: None,
            cwd: None,
            args: vec![],
            environment: vec![],
            comment: None,
        }
    }

    fn write_script(base: &Path, name: &str, body: &str) {
        let path = base.join(name);
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn make_supervisor(base: &Path, max_failures: u32) -> Arc<Supervisor> {
        let settings = test_settings(base, max_failures);
        let paths = StatePaths::new(base);
        std::fs::create_dir_all(&paths.log_dir).unwrap();
        std::fs::create_dir_all(&paths.uploaded_dir).unwrap();
        let registry = Registry::empty(&paths.programs_file);
        Arc::new(Supervisor::new(
            settings,
            paths,
            registry,
            Arc::new(AtomicBool::new(false)),
        ))
    }

    #[tokio::test]
    async fn start_status_stop_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path();
        write_script(base, "sleeper.sh", "#!/bin/sh\nexec sleep 30\n");
        let sup = make_supervisor(base, 3);
        sup.registry.add(exec_program("sleeper", "sleeper.sh")).unwrap();

        sup.start("sleeper").await.unwrap();
        let status = sup.status();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].state, ProcState::Running);
        let pid = status[0].pid.expect("pid set while running");
        assert!(snapshot::pid_alive(pid));

        // Snapshot reflects the live run.
        let (snap, _) = snapshot::load(&sup.paths.pid_file);
        assert_eq!(snap["sleeper"].pid, pid);

        // Starting again while running is illegal state.
        assert!(matches!(
            sup.start("sleeper").await,
            Err(ControlError::Busy { .. })
        ));

        sup.stop("sleeper").await.unwrap();
        let status = sup.status();
        assert_eq!(status[0].state, ProcState::Stopped);
        assert!(status[0].pid.is_none());
        assert!(!snapshot::pid_alive(pid));

        // Idempotent stop.
        sup.stop("sleeper").await.unwrap();
        let (snap, _) = snapshot::load(&sup.paths.pid_file);
        assert!(snap.is_empty());
    }

    #[tokio::test]
    async fn crashing_program_ends_broken_without_further_spawns() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path();
        write_script(base, "fail.sh", "#!/bin/sh\nexit 1\n");
        let sup = make_supervisor(base, 2);
        sup.registry.add(exec_program("fail", "fail.sh")).unwrap();

        sup.start("fail").await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            sup.monitor_tick();
            let st = sup.status().remove(0);
            if st.state == ProcState::Broken {
                assert_eq!(st.consecutive_failures, 2);
                assert!(st.pid.is_none());
                break;
            }
            assert!(Instant::now() < deadline, "never reached broken: {:?}", st.state);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        // Broken means no auto-restart: further ticks change nothing.
        sup.monitor_tick();
        tokio::time::sleep(Duration::from_millis(100)).await;
        sup.monitor_tick();
        assert_eq!(sup.status()[0].state, ProcState::Broken);

        // Manual restart resets the counter and spawns again.
        let _ = sup.restart("fail").await;
        let st = sup.status().remove(0);
        assert!(st.consecutive_failures <= 1);
    }

    #[tokio::test]
    async fn orderly_exit_of_disabled_program_stops() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path();
        write_script(base, "once.sh", "#!/bin/sh\nexit 0\n");
        let sup = make_supervisor(base, 3);
        let mut prog = exec_program("once", "once.sh");
        prog.enabled = false;
        sup.registry.add(prog).unwrap();

        sup.start("once").await.unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            sup.monitor_tick();
            let st = sup.status().remove(0);
            if st.state == ProcState::Stopped {
                assert_eq!(st.consecutive_failures, 0);
                break;
            }
            assert!(Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test]
    async fn remove_requires_rest_and_cleans_uploaded_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path();
        write_script(base, "sleeper.sh", "#!/bin/sh\nexec sleep 30\n");
        let sup = make_supervisor(base, 3);
        sup.registry.add(exec_program("sleeper", "sleeper.sh")).unwrap();

        sup.start("sleeper").await.unwrap();
        assert!(matches!(
            sup.remove("sleeper").await,
            Err(ControlError::Busy { .. })
        ));
        sup.stop("sleeper").await.unwrap();
        sup.remove("sleeper").await.unwrap();
        assert!(sup.registry.get("sleeper").is_none());
        assert!(matches!(
            sup.remove("sleeper").await,
            Err(ControlError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn reattach_adopts_verified_children_and_drops_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path();
        write_script(base, "sleeper.sh", "#!/bin/sh\nexec sleep 30\n");

        // First supervisor instance starts the child and exits without
        // signalling it.
        let sup1 = make_supervisor(base, 3);
        sup1.registry.add(exec_program("sleeper", "sleeper.sh")).unwrap();
        sup1.start("sleeper").await.unwrap();
        let pid = sup1.status()[0].pid.unwrap();
        // Forget the supervisor; the child keeps running (own session).
        drop(sup1);
        assert!(snapshot::pid_alive(pid));

        // Second instance adopts from pids.json.
        let sup2 = make_supervisor(base, 3);
        sup2.registry.add(exec_program("sleeper", "sleeper.sh")).unwrap();
        sup2.reattach();
        let st = sup2.status().remove(0);
        if cfg!(target_os = "linux") {
            assert_eq!(st.state, ProcState::Running);
            assert_eq!(st.pid, Some(pid));
            let (snap, _) = snapshot::load(&sup2.paths.pid_file);
            assert_eq!(snap["sleeper"].pid, pid);
        } else {
            // Without process creation time, reattach must refuse.
            assert_eq!(st.state, ProcState::Stopped);
        }

        // Cleanup: the test process is still the parent, so reap directly
        // (a killed-but-unreaped child would keep answering kill(pid, 0)).
        let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
        let _ = nix::sys::wait::waitpid(Pid::from_raw(pid), None);
    }

    #[tokio::test]
    async fn stale_snapshot_entry_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path();
        write_script(base, "sleeper.sh", "#!/bin/sh\nexec sleep 30\n");
        let sup = make_supervisor(base, 3);
        sup.registry.add(exec_program("sleeper", "sleeper.sh")).unwrap();

        // Entry for a pid that is long gone.
        let mut snap = Snapshot::new();
        snap.insert(
            "sleeper".into(),
            PersistedEntry {
                pid: 1_999_999,
                started_at: Utc::now(),
                state: "running".into(),
            },
        );
        snapshot::write(&sup.paths.pid_file, &snap).unwrap();

        sup.reattach();
        assert_eq!(sup.status()[0].state, ProcState::Stopped);
        // Pruned from the snapshot as well.
        let (snap, _) = snapshot::load(&sup.paths.pid_file);
        assert!(snap.is_empty());
    }
}
