use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use chrono::{Local, TimeZone, Utc};
use tokio::io::AsyncWriteExt;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::sync::mpsc;

use crate::pm::config::{self, StatePaths};
use crate::pm::logs;
use crate::pm::registry::Registry;
use crate::pm::supervisor::Supervisor;
use crate::pm::web;

const DAEMON_LOG_NAME: &str = "progman.log";
/// The daemon's own log rotates with the same copy-truncate helper the
/// program logs use, at a fixed 10 MiB.
const DAEMON_LOG_MAX_BYTES: u64 = 10 * 1024 * 1024;

static LOG_TX: OnceLock<mpsc::UnboundedSender<String>> = OnceLock::new();

/// Timestamped operator-facing event line: stderr always, daemon log file
/// once its writer is up.
pub fn event(component: &str, program: Option<&str>, msg: impl AsRef<str>) {
    let ts = Local::now().format("%Y-%m-%d_%H:%M:%S%.3f");
    let line = match program {
        Some(p) => format!("{ts} [{component}] program={p} {}", msg.as_ref()),
        None => format!("{ts} [{component}] {}", msg.as_ref()),
    };
    eprintln!("{line}");
    if let Some(tx) = LOG_TX.get() {
        let _ = tx.send(line);
    }
}

/// Banner for the boot event and the dashboard footer. build.rs stamps the
/// build as a raw epoch; rendering it human-readable happens here, where
/// chrono is available.
pub fn build_banner() -> String {
    let built = option_env!("PROGMAN_BUILD_EPOCH")
        .and_then(|s| s.parse::<i64>().ok())
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| "unknown".to_string());
    format!(
        "progman {} rev {} (built {} on {})",
        env!("CARGO_PKG_VERSION"),
        option_env!("PROGMAN_GIT_REV").unwrap_or("unknown"),
        built,
        option_env!("PROGMAN_BUILD_HOST").unwrap_or("unknown"),
    )
}

fn start_daemon_log_file(paths: &StatePaths) {
    let path = paths.log_dir.join(DAEMON_LOG_NAME);
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    if LOG_TX.set(tx).is_err() {
        return;
    }
    tokio::spawn(async move {
        let mut file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                eprintln!("failed to open daemon log {}: {e}", path.display());
                return;
            }
        };
        let mut lines_since_check: u32 = 0;
        while let Some(line) = rx.recv().await {
            let _ = file.write_all(line.as_bytes()).await;
            let _ = file.write_all(b"\n").await;
            let _ = file.flush().await;
            lines_since_check += 1;
            if lines_since_check >= 64 {
                lines_since_check = 0;
                // Copy-truncate keeps our append fd valid across rotation.
                let _ = logs::rotate_if_needed(&path, DAEMON_LOG_MAX_BYTES);
            }
        }
    });
}

pub async fn run_daemon_async(config_path: PathBuf) -> anyhow::Result<()> {
    let (settings, settings_warnings) = config::load_settings(&config_path)?;
    let paths = StatePaths::new(&settings.base_dir);
    std::fs::create_dir_all(&paths.log_dir)?;
    std::fs::create_dir_all(&paths.uploaded_dir)?;

    start_daemon_log_file(&paths);
    event("boot", None, build_banner());
    for w in settings_warnings {
        event("config", None, w);
    }

    let (registry, warnings) = Registry::load(&paths.programs_file)?;
    for w in warnings {
        event("config", None, w);
    }

    let shutting_down = Arc::new(AtomicBool::new(false));
    let sup = Arc::new(Supervisor::new(
        settings.clone(),
        paths,
        registry,
        Arc::clone(&shutting_down),
    ));

    // Boot order matters: adopt surviving children first, then begin
    // monitoring them, then start whatever enabled programs are left.
    sup.reattach();
    sup.spawn_monitor();
    sup.autostart().await;

    let listener = web::bind(&settings.web_ui).await?;
    event(
        "web",
        None,
        format!("listening on {}:{}", settings.web_ui.host, settings.web_ui.port),
    );

    web::serve(listener, Arc::clone(&sup), shutdown_signal(Arc::clone(&shutting_down))).await?;

    // SIGINT/SIGTERM landed: persist the snapshot and leave. The children
    // live in their own sessions and are never signalled from here.
    event(
        "shutdown",
        None,
        "persisting snapshot; managed children keep running",
    );
    sup.write_snapshot();
    Ok(())
}

async fn shutdown_signal(flag: Arc<AtomicBool>) {
    let mut term = unix_signal(SignalKind::terminate()).expect("SIGTERM handler");
    let mut int = unix_signal(SignalKind::interrupt()).expect("SIGINT handler");
    tokio::select! {
        _ = term.recv() => {}
        _ = int.recv() => {}
    }
    flag.store(true, Ordering::Relaxed);
}
