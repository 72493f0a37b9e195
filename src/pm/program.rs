use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::pm::errors::ControlError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProgramKind {
    #[default]
    Python,
    Node,
    Exec,
}

impl ProgramKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgramKind::Python => "python",
            ProgramKind::Node => "node",
            ProgramKind::Exec => "exec",
        }
    }
}

/// A program declaration as persisted in `progs.yaml`.
///
/// `script` and `module` are mutually exclusive; `module` (python module
/// invocation, `python -m <module>`) and `venv` are python-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Program {
    pub name: String,
    #[serde(
        rename = "type",
        default,
        skip_serializing_if = "is_default_kind"
    )]
    pub kind: ProgramKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub uploaded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub venv: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(
        default,
        deserialize_with = "deserialize_args",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub environment: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

fn default_true() -> bool {
    true
}
fn is_false(b: &bool) -> bool {
    !*b
}
fn is_default_kind(k: &ProgramKind) -> bool {
    *k == ProgramKind::Python
}

/// `args` accepts either a YAML list or a single string tokenised on
/// whitespace.
fn deserialize_args<'de, D>(d: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ArgsField {
        One(String),
        Many(Vec<String>),
    }
    Ok(match Option::<ArgsField>::deserialize(d)? {
        None => Vec::new(),
        Some(ArgsField::One(s)) => s.split_whitespace().map(str::to_string).collect(),
        Some(ArgsField::Many(v)) => v,
    })
}

impl Program {
    pub fn validate(&self) -> Result<(), ControlError> {
        if self.name.trim().is_empty() {
            return Err(ControlError::BadDeclaration(
                "program name must not be empty".into(),
            ));
        }
        if sanitize_name(&self.name).is_empty() {
            return Err(ControlError::BadDeclaration(format!(
                "program name '{}' has no filesystem-safe characters",
                self.name
            )));
        }
        match (&self.script, &self.module) {
            (Some(_), Some(_)) => {
                return Err(ControlError::BadDeclaration(format!(
                    "program '{}' declares both script and module",
                    self.name
                )));
            }
            (None, None) => {
                return Err(ControlError::BadDeclaration(format!(
                    "program '{}' declares neither script nor module",
                    self.name
                )));
            }
            _ => {}
        }
        if self.module.is_some() && self.kind != ProgramKind::Python {
            return Err(ControlError::BadDeclaration(format!(
                "program '{}' sets module with kind={}",
                self.name,
                self.kind.as_str()
            )));
        }
        if self.venv.is_some() && self.kind != ProgramKind::Python {
            return Err(ControlError::BadDeclaration(format!(
                "program '{}' sets venv with kind={}",
                self.name,
                self.kind.as_str()
            )));
        }
        Ok(())
    }
}

/// Filesystem-safe stem for log files and upload directories: everything
/// outside `[A-Za-z0-9_-]` becomes `_`, runs collapse, edges trim.
pub fn sanitize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_underscore = false;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
            out.push(ch);
            last_underscore = ch == '_';
        } else if !last_underscore {
            out.push('_');
            last_underscore = true;
        }
    }
    out.trim_matches('_').to_string()
}

// -------- progs.yaml codec --------

const KNOWN_KEYS: &[&str] = &[
    "name",
    "type",
    "script",
    "module",
    "enabled",
    "uploaded",
    "venv",
    "cwd",
    "args",
    "environment",
    "comment",
];

/// Load the programs document. A program with unknown keys loads with a
/// warning; a program that fails validation or deserialisation is skipped
/// with a warning so the rest of the fleet still loads.
pub fn load_programs(path: &Path) -> anyhow::Result<(BTreeMap<String, Program>, Vec<String>)> {
    let mut programs = BTreeMap::new();
    let mut warnings = Vec::new();

    let raw = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok((programs, warnings));
        }
        Err(e) => {
            return Err(anyhow::anyhow!(
                "failed to read programs {}: {e}",
                path.display()
            ))
        }
    };

    let doc: serde_yaml::Value = serde_yaml::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("failed to parse programs {}: {e}", path.display()))?;
    let entries = match doc.get("programs") {
        Some(serde_yaml::Value::Sequence(seq)) => seq.clone(),
        Some(serde_yaml::Value::Null) | None => Vec::new(),
        Some(_) => {
            return Err(anyhow::anyhow!(
                "{}: 'programs' must be a sequence",
                path.display()
            ))
        }
    };

    for (idx, entry) in entries.into_iter().enumerate() {
        let label = entry
            .get("name")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| format!("#{idx}"));

        if let serde_yaml::Value::Mapping(m) = &entry {
            for key in m.keys() {
                if let Some(k) = key.as_str() {
                    if !KNOWN_KEYS.contains(&k) {
                        warnings.push(format!("program {label}: ignoring unknown key '{k}'"));
                    }
                }
            }
        }

        let prog: Program = match serde_yaml::from_value(entry) {
            Ok(p) => p,
            Err(e) => {
                warnings.push(format!("program {label}: skipped ({e})"));
                continue;
            }
        };
        if let Err(e) = prog.validate() {
            warnings.push(format!("program {label}: skipped ({e})"));
            continue;
        }
        if programs.contains_key(&prog.name) {
            warnings.push(format!("program {label}: skipped (duplicate name)"));
            continue;
        }
        let stem = sanitize_name(&prog.name);
        if programs.keys().any(|n| sanitize_name(n) == stem) {
            warnings.push(format!(
                "program {label}: skipped (log stem '{stem}' collides with another program)"
            ));
            continue;
        }
        programs.insert(prog.name.clone(), prog);
    }

    Ok((programs, warnings))
}

/// Persist the programs document atomically (write temp, rename).
pub fn save_programs<'a, I>(path: &Path, programs: I) -> anyhow::Result<()>
where
    I: IntoIterator<Item = &'a Program>,
{
    #[derive(Serialize)]
    struct Doc<'a> {
        programs: Vec<&'a Program>,
    }
    let doc = Doc {
        programs: programs.into_iter().collect(),
    };
    let yaml = serde_yaml::to_string(&doc)?;
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp = parent.join(format!(".progs.yaml.tmp.{}", std::process::id()));
    std::fs::write(&tmp, yaml.as_bytes())?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
