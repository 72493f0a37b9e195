use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Deserialize;

use crate::pm::errors::ControlError;
use crate::pm::program::{self, sanitize_name, Program, ProgramKind};

/// Authoritative mapping from program name to its declaration. The lock is
/// held only for the O(1) mutation; the document write happens on a snapshot
/// taken after the lock is released.
#[derive(Debug)]
pub struct Registry {
    path: PathBuf,
    programs: Mutex<BTreeMap<String, Program>>,
}

/// Patch body for `edit`. Absent fields keep their value; `Some` replaces.
/// Clearing an optional string field is expressed with an empty string.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProgramPatch {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<ProgramKind>,
    pub script: Option<String>,
    pub module: Option<String>,
    pub enabled: Option<bool>,
    pub venv: Option<String>,
    pub cwd: Option<String>,
    pub args: Option<Vec<String>>,
    pub environment: Option<Vec<String>>,
    pub comment: Option<String>,
}

impl Registry {
    pub fn load(path: &Path) -> anyhow::Result<(Self, Vec<String>)> {
        let (programs, warnings) = program::load_programs(path)?;
        Ok((
            Self {
                path: path.to_path_buf(),
                programs: Mutex::new(programs),
            },
            warnings,
        ))
    }

    #[cfg(test)]
    pub fn empty(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            programs: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.programs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    pub fn list(&self) -> Vec<Program> {
        self.programs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<Program> {
        self.programs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.programs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(name)
    }

    pub fn add(&self, prog: Program) -> Result<(), ControlError> {
        prog.validate()?;
        {
            let mut map = self.programs.lock().unwrap_or_else(|p| p.into_inner());
            if map.contains_key(&prog.name) {
                return Err(ControlError::NameConflict(prog.name));
            }
            // Names that sanitise to the same stem would share a log file
            // and an upload directory.
            let stem = sanitize_name(&prog.name);
            if map.values().any(|p| sanitize_name(&p.name) == stem) {
                return Err(ControlError::NameConflict(prog.name));
            }
            map.insert(prog.name.clone(), prog);
        }
        self.save()?;
        Ok(())
    }

    /// Apply a patch. `name` is immutable once declared: a patch carrying a
    /// different name is rejected (rename = remove + add).
    pub fn edit(&self, name: &str, patch: &ProgramPatch) -> Result<Program, ControlError> {
        if let Some(new_name) = patch.name.as_deref() {
            if new_name != name {
                return Err(ControlError::BadDeclaration(format!(
                    "program name is immutable (got rename '{name}' -> '{new_name}'); remove and re-add instead"
                )));
            }
        }
        let updated = {
            let mut map = self.programs.lock().unwrap_or_else(|p| p.into_inner());
            let cur = map
                .get(name)
                .ok_or_else(|| ControlError::NotFound(name.to_string()))?;
            let mut next = cur.clone();
            if let Some(kind) = patch.kind {
                next.kind = kind;
            }
            if let Some(script) = &patch.script {
                next.script = none_if_empty(script);
            }
            if let Some(module) = &patch.module {
                next.module = none_if_empty(module);
            }
            if let Some(enabled) = patch.enabled {
                next.enabled = enabled;
            }
            if let Some(venv) = &patch.venv {
                next.venv = none_if_empty(venv).map(PathBuf::from);
            }
            if let Some(cwd) = &patch.cwd {
                next.cwd = none_if_empty(cwd).map(PathBuf::from);
            }
            if let Some(args) = &patch.args {
                next.args = args.clone();
            }
            if let Some(environment) = &patch.environment {
                next.environment = environment.clone();
            }
            if let Some(comment) = &patch.comment {
                next.comment = none_if_empty(comment);
            }
            next.validate()?;
            map.insert(name.to_string(), next.clone());
            next
        };
        self.save()?;
        Ok(updated)
    }

    pub fn remove(&self, name: &str) -> Result<Program, ControlError> {
        let removed = {
            let mut map = self.programs.lock().unwrap_or_else(|p| p.into_inner());
            map.remove(name)
                .ok_or_else(|| ControlError::NotFound(name.to_string()))?
        };
        self.save()?;
        Ok(removed)
    }

    /// Atomic write of the full document from a snapshot of the map.
    pub fn save(&self) -> Result<(), ControlError> {
        let snapshot: Vec<Program> = {
            let map = self.programs.lock().unwrap_or_else(|p| p.into_inner());
            map.values().cloned().collect()
        };
        program::save_programs(&self.path, snapshot.iter())?;
        Ok(())
    }
}

fn none_if_empty(s: &str) -> Option<String> {
    let t = s.trim();
    if t.is_empty() {
        None
    } else {
        Some(t.to_string())
    }
}
