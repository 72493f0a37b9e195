use std::fs::File;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use nix::unistd::setsid;

use crate::pm::config::Settings;
use crate::pm::errors::ControlError;
use crate::pm::program::{Program, ProgramKind};

/// A declaration resolved into something the OS can run.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub argv: Vec<String>,
    pub cwd: PathBuf,
    /// Program-declared overrides, applied on top of the inherited
    /// environment (later entries win on key conflict).
    pub env: Vec<(String, String)>,
    /// Operator-facing notes (skipped environment entries and the like);
    /// the caller appends these to the program log.
    pub warnings: Vec<String>,
}

pub fn build_invocation(settings: &Settings, prog: &Program) -> Result<Invocation, ControlError> {
    prog.validate()?;

    // Effective working directory: program cwd > global cwd > base dir.
    let cwd = prog
        .cwd
        .as_ref()
        .map(|p| resolve(&settings.base_dir, p))
        .or_else(|| settings.cwd.clone())
        .unwrap_or_else(|| settings.base_dir.clone());

    let (env, warnings) = split_environment(&prog.environment);

    let mut argv: Vec<String> = Vec::with_capacity(4 + prog.args.len());
    match prog.kind {
        ProgramKind::Python => {
            let interpreter = match &prog.venv {
                Some(v) => resolve(&settings.base_dir, v).join("bin").join("python"),
                None => settings.python_interpreter(),
            };
            argv.push(path_str(&interpreter));
            if let Some(module) = &prog.module {
                argv.push("-m".into());
                argv.push(module.clone());
            } else {
                let script = resolve_script(prog, &cwd)?;
                // -u: unbuffered, so output reaches the log as it happens.
                argv.push("-u".into());
                argv.push(path_str(&script));
            }
        }
        ProgramKind::Node => {
            let script = resolve_script(prog, &cwd)?;
            argv.push(path_str(&settings.node_runtime()));
            argv.push(path_str(&script));
        }
        ProgramKind::Exec => {
            let script = resolve_script(prog, &cwd)?;
            let md = std::fs::metadata(&script)
                .map_err(|_| ControlError::ScriptNotFound(script.display().to_string()))?;
            if md.permissions().mode() & 0o111 == 0 {
                return Err(ControlError::NotExecutable(script.display().to_string()));
            }
            argv.push(path_str(&script));
        }
    }
    argv.extend(prog.args.iter().cloned());

    Ok(Invocation {
        argv,
        cwd,
        env,
        warnings,
    })
}

fn resolve_script(prog: &Program, cwd: &Path) -> Result<PathBuf, ControlError> {
    let script = prog.script.as_deref().ok_or_else(|| {
        ControlError::BadDeclaration(format!("program '{}' has no script", prog.name))
    })?;
    let path = resolve(cwd, Path::new(script));
    if !path.exists() {
        return Err(ControlError::ScriptNotFound(path.display().to_string()));
    }
    Ok(path)
}

fn resolve(base: &Path, p: &Path) -> PathBuf {
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p)
    }
}

fn path_str(p: &Path) -> String {
    p.to_string_lossy().into_owned()
}

/// Parse `KEY=VALUE` entries; malformed ones are skipped with a warning
/// rather than failing the start.
fn split_environment(entries: &[String]) -> (Vec<(String, String)>, Vec<String>) {
    let mut env = Vec::with_capacity(entries.len());
    let mut warnings = Vec::new();
    for entry in entries {
        match entry.split_once('=') {
            Some((k, v)) if !k.trim().is_empty() => {
                env.push((k.trim().to_string(), v.to_string()));
            }
            _ => warnings.push(format!(
                "skipping invalid environment entry '{entry}' (expected KEY=VALUE)"
            )),
        }
    }
    (env, warnings)
}

/// Spawn a child detached into its own session with both output streams on
/// the given log handle. `setsid` in `pre_exec` is what keeps signals
/// delivered to the supervisor's group away from the children — supervisor
/// shutdown must never take the fleet down with it.
pub fn spawn_command(
    argv: &[String],
    cwd: &Path,
    env: &[(String, String)],
    log: File,
) -> std::io::Result<Child> {
    let log_err = log.try_clone()?;
    let mut cmd = Command::new(&argv[0]);
    if argv.len() > 1 {
        cmd.args(&argv[1..]);
    }
    cmd.current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err));
    for (k, v) in env {
        cmd.env(k, v);
    }
    unsafe {
        cmd.pre_exec(|| {
            let _ = setsid();
            Ok(())
        });
    }
    cmd.spawn()
}
