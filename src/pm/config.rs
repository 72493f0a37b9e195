use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Resolved daemon settings (from `manager.yaml`).
#[derive(Debug, Clone)]
pub struct Settings {
    pub web_ui: WebUi,
    /// Global default venv for python programs (resolved against base_dir).
    pub venv: Option<PathBuf>,
    /// Node runtime; falls back to `node` on PATH.
    pub node: Option<PathBuf>,
    /// Global default working directory (resolved against base_dir).
    pub cwd: Option<PathBuf>,
    pub restart: RestartPolicy,
    pub logging: LogPolicy,
    /// Directory of the settings file; everything else lives under it.
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct WebUi {
    pub host: String,
    pub port: u16,
    pub title: String,
}

#[derive(Debug, Clone)]
pub struct RestartPolicy {
    pub delay_seconds: u64,
    pub max_consecutive_failures: u32,
    pub failure_reset_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct LogPolicy {
    pub max_size_mb: u64,
}

impl LogPolicy {
    pub fn max_bytes(&self) -> u64 {
        self.max_size_mb * 1024 * 1024
    }
}

impl Settings {
    /// Interpreter used when a program declares no venv of its own, and for
    /// creating venvs during installs: `<venv>/bin/python` if a global venv
    /// is configured, else `python3` from PATH.
    pub fn python_interpreter(&self) -> PathBuf {
        match &self.venv {
            Some(v) => v.join("bin").join("python"),
            None => PathBuf::from("python3"),
        }
    }

    pub fn node_runtime(&self) -> PathBuf {
        self.node.clone().unwrap_or_else(|| PathBuf::from("node"))
    }
}

/// Well-known locations under the base directory.
#[derive(Debug, Clone)]
pub struct StatePaths {
    pub base: PathBuf,
    pub log_dir: PathBuf,
    pub uploaded_dir: PathBuf,
    pub pid_file: PathBuf,
    pub programs_file: PathBuf,
}

impl StatePaths {
    pub fn new(base: &Path) -> Self {
        Self {
            base: base.to_path_buf(),
            log_dir: base.join("log"),
            uploaded_dir: base.join("uploaded_programs"),
            pid_file: base.join("pids.json"),
            programs_file: base.join("progs.yaml"),
        }
    }
}

// -------- YAML file schema --------

#[derive(Debug, Clone, Default, Deserialize)]
struct SettingsFile {
    #[serde(default)]
    web_ui: Option<WebUiFile>,
    #[serde(default)]
    venv: Option<PathBuf>,
    #[serde(default)]
    node: Option<PathBuf>,
    #[serde(default)]
    cwd: Option<PathBuf>,
    #[serde(default)]
    restart: Option<RestartFile>,
    #[serde(default)]
    logging: Option<LoggingFile>,
}

#[derive(Debug, Clone, Deserialize)]
struct WebUiFile {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_title")]
    title: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RestartFile {
    #[serde(default = "default_delay_seconds")]
    delay_seconds: u64,
    #[serde(default = "default_max_consecutive_failures")]
    max_consecutive_failures: u32,
    #[serde(default = "default_failure_reset_seconds")]
    failure_reset_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct LoggingFile {
    #[serde(default = "default_max_size_mb")]
    max_size_mb: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_title() -> String {
    "Process Manager".to_string()
}
fn default_delay_seconds() -> u64 {
    1
}
fn default_max_consecutive_failures() -> u32 {
    10
}
fn default_failure_reset_seconds() -> u64 {
    60
}
fn default_max_size_mb() -> u64 {
    10
}

const KNOWN_KEYS: &[&str] = &["web_ui", "venv", "node", "cwd", "restart", "logging"];
const KNOWN_WEB_UI_KEYS: &[&str] = &["host", "port", "title"];
const KNOWN_RESTART_KEYS: &[&str] = &[
    "delay_seconds",
    "max_consecutive_failures",
    "failure_reset_seconds",
];
const KNOWN_LOGGING_KEYS: &[&str] = &["max_size_mb"];

/// Unknown keys are ignored with a warning rather than silently dropped, so
/// a typo in `manager.yaml` shows up in the event log instead of quietly
/// running on defaults. Same rule the programs document gets.
fn collect_unknown_keys(doc: &serde_yaml::Value, warnings: &mut Vec<String>) {
    let Some(map) = doc.as_mapping() else {
        return;
    };
    for (key, value) in map {
        let Some(k) = key.as_str() else { continue };
        if !KNOWN_KEYS.contains(&k) {
            warnings.push(format!("settings: ignoring unknown key '{k}'"));
            continue;
        }
        let section_keys = match k {
            "web_ui" => KNOWN_WEB_UI_KEYS,
            "restart" => KNOWN_RESTART_KEYS,
            "logging" => KNOWN_LOGGING_KEYS,
            _ => continue,
        };
        if let Some(section) = value.as_mapping() {
            for skey in section.keys() {
                if let Some(sk) = skey.as_str() {
                    if !section_keys.contains(&sk) {
                        warnings.push(format!("settings: ignoring unknown key '{k}.{sk}'"));
                    }
                }
            }
        }
    }
}

pub fn load_settings(path: &Path) -> anyhow::Result<(Settings, Vec<String>)> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read settings {}: {e}", path.display()))?;
    let doc: serde_yaml::Value = serde_yaml::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("failed to parse settings {}: {e}", path.display()))?;

    let mut warnings = Vec::new();
    collect_unknown_keys(&doc, &mut warnings);

    let file: SettingsFile = serde_yaml::from_value(doc)
        .map_err(|e| anyhow::anyhow!("failed to parse settings {}: {e}", path.display()))?;

    let base = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();

    let web_ui = match file.web_ui {
        Some(w) => WebUi {
            host: w.host,
            port: w.port,
            title: w.title,
        },
        None => WebUi {
            host: default_host(),
            port: default_port(),
            title: default_title(),
        },
    };
    let restart = match file.restart {
        Some(r) => RestartPolicy {
            delay_seconds: r.delay_seconds,
            max_consecutive_failures: r.max_consecutive_failures.max(1),
            failure_reset_seconds: r.failure_reset_seconds,
        },
        None => RestartPolicy {
            delay_seconds: default_delay_seconds(),
            max_consecutive_failures: default_max_consecutive_failures(),
            failure_reset_seconds: default_failure_reset_seconds(),
        },
    };
    let logging = match file.logging {
        Some(l) => LogPolicy {
            max_size_mb: l.max_size_mb.max(1),
        },
        None => LogPolicy {
            max_size_mb: default_max_size_mb(),
        },
    };

    // Relative venv/cwd resolve against the settings directory.
    let resolve = |p: PathBuf| -> PathBuf {
        if p.is_relative() {
            base.join(p)
        } else {
            p
        }
    };

    let settings = Settings {
        web_ui,
        venv: file.venv.map(resolve),
        node: file.node,
        cwd: file.cwd.map(resolve),
        restart,
        logging,
        base_dir: base,
    };
    Ok((settings, warnings))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_settings(dir: &Path, yaml: &str) -> PathBuf {
        let p = dir.join("manager.yaml");
        std::fs::write(&p, yaml).unwrap();
        p
    }

    #[test]
    fn defaults_fill_missing_sections() {
        let dir = tempfile::tempdir().unwrap();
        let p = write_settings(dir.path(), "web_ui:\n  port: 9000\n");
        let (s, warnings) = load_settings(&p).unwrap();
        assert!(warnings.is_empty());
        assert_eq!(s.web_ui.port, 9000);
        assert_eq!(s.web_ui.host, "0.0.0.0");
        assert_eq!(s.restart.delay_seconds, 1);
        assert_eq!(s.restart.max_consecutive_failures, 10);
        assert_eq!(s.restart.failure_reset_seconds, 60);
        assert_eq!(s.logging.max_size_mb, 10);
        assert_eq!(s.base_dir, dir.path());
    }

    #[test]
    fn relative_venv_and_cwd_resolve_against_base() {
        let dir = tempfile::tempdir().unwrap();
        let p = write_settings(dir.path(), "venv: .venv\ncwd: work\n");
        let (s, _) = load_settings(&p).unwrap();
        assert_eq!(s.venv.clone().unwrap(), dir.path().join(".venv"));
        assert_eq!(s.cwd.clone().unwrap(), dir.path().join("work"));
        assert_eq!(
            s.python_interpreter(),
            dir.path().join(".venv").join("bin").join("python")
        );
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_settings(&dir.path().join("nope.yaml")).is_err());
    }

    #[test]
    fn python_falls_back_to_path_interpreter() {
        let dir = tempfile::tempdir().unwrap();
        let p = write_settings(dir.path(), "{}\n");
        let (s, _) = load_settings(&p).unwrap();
        assert_eq!(s.python_interpreter(), PathBuf::from("python3"));
        assert_eq!(s.node_runtime(), PathBuf::from("node"));
    }

    #[test]
    fn unknown_keys_warn_but_load() {
        let yaml = "web_ui:\n  port: 9000\n  theme: dark\nrestart:\n  delay_seconds: 2\nlog_level: debug\n";
        let dir = tempfile::tempdir().unwrap();
        let p = write_settings(dir.path(), yaml);
        let (s, warnings) = load_settings(&p).unwrap();
        assert_eq!(s.web_ui.port, 9000);
        assert_eq!(s.restart.delay_seconds, 2);
        assert_eq!(warnings.len(), 2);
        assert!(warnings.iter().any(|w| w.contains("'log_level'")));
        assert!(warnings.iter().any(|w| w.contains("'web_ui.theme'")));
    }
}
