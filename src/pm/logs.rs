use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::pm::program::sanitize_name;

pub const DEFAULT_PAGE_LINES: usize = 100;
pub const MAX_PAGE_LINES: usize = 10_000;

pub fn log_path(log_dir: &Path, name: &str) -> PathBuf {
    log_dir.join(format!("{}.log", sanitize_name(name)))
}

pub fn rotated_path(log_dir: &Path, name: &str) -> PathBuf {
    log_dir.join(format!("{}.log.1", sanitize_name(name)))
}

/// Open (create) a log file for append. The returned handle is what a child
/// gets as its combined stdout/stderr; append mode is what makes
/// copy-truncate rotation safe for it.
pub fn open_append(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Append one line (spawn failures, skipped env entries, operator-facing
/// notes). Best-effort; the caller treats failures as log-only events.
pub fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut f = open_append(path)?;
    writeln!(f, "{line}")
}

/// Copy-truncate rotation: copy the live file to `<path>.1` (overwriting any
/// prior backup), then truncate the live file in place. The inode survives,
/// so writers holding append-mode descriptors keep writing at offset 0
/// without being signalled or reopened.
pub fn rotate_if_needed(path: &Path, max_bytes: u64) -> anyhow::Result<bool> {
    let md = match std::fs::metadata(path) {
        Ok(md) => md,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    if md.len() <= max_bytes {
        return Ok(false);
    }

    let backup = PathBuf::from(format!("{}.1", path.display()));
    std::fs::copy(path, &backup)?;
    OpenOptions::new().write(true).open(path)?.set_len(0)?;
    Ok(true)
}

#[derive(Debug, Clone, Serialize)]
pub struct LogPage {
    pub lines: Vec<String>,
    /// Effective offset after clamping (lines from the start of the file).
    pub offset: usize,
    pub total_lines: usize,
    pub total_bytes: u64,
    /// Whether a rotated backup (`.log.1`) exists.
    pub rotated: bool,
}

/// Paginated read. `offset` counts lines from the start of the live file;
/// `max_lines` clamps to `[1, 10000]`. An offset beyond the end returns the
/// final page, which keeps viewers sane across a rotation that shrank the
/// file under them. A line without a trailing newline still counts.
pub fn read_page(path: &Path, offset: usize, max_lines: usize) -> anyhow::Result<LogPage> {
    let rotated = PathBuf::from(format!("{}.1", path.display())).exists();
    let data = match std::fs::read(path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(LogPage {
                lines: Vec::new(),
                offset: 0,
                total_lines: 0,
                total_bytes: 0,
                rotated,
            });
        }
        Err(e) => return Err(e.into()),
    };
    let total_bytes = data.len() as u64;
    let text = String::from_utf8_lossy(&data);
    let all: Vec<&str> = text.split_terminator('\n').collect();
    let total_lines = all.len();

    let max_lines = max_lines.clamp(1, MAX_PAGE_LINES);
    let offset = if offset >= total_lines {
        total_lines.saturating_sub(max_lines)
    } else {
        offset
    };
    let end = (offset + max_lines).min(total_lines);
    let lines = all[offset..end].iter().map(|s| s.to_string()).collect();

    Ok(LogPage {
        lines,
        offset,
        total_lines,
        total_bytes,
        rotated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_page_clamps_and_pages() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("a.log");
        let body: String = (0..250).map(|i| format!("line {i}\n")).collect();
        std::fs::write(&p, &body).unwrap();

        let page = read_page(&p, 0, 100).unwrap();
        assert_eq!(page.total_lines, 250);
        assert_eq!(page.lines.len(), 100);
        assert_eq!(page.lines[0], "line 0");
        assert_eq!(page.total_bytes, body.len() as u64);

        let page = read_page(&p, 200, 100).unwrap();
        assert_eq!(page.lines.len(), 50);
        assert_eq!(page.lines[0], "line 200");

        // Beyond the end: final page.
        let page = read_page(&p, 9_999, 100).unwrap();
        assert_eq!(page.offset, 150);
        assert_eq!(page.lines.last().unwrap(), "line 249");

        // max_lines clamps up from zero.
        let page = read_page(&p, 0, 0).unwrap();
        assert_eq!(page.lines.len(), 1);
    }

    #[test]
    fn unterminated_final_line_counts() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("a.log");
        std::fs::write(&p, "one\ntwo").unwrap();
        let page = read_page(&p, 0, 10).unwrap();
        assert_eq!(page.total_lines, 2);
        assert_eq!(page.lines, vec!["one", "two"]);
    }

    #[test]
    fn missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let page = read_page(&dir.path().join("none.log"), 0, 10).unwrap();
        assert_eq!(page.total_lines, 0);
        assert!(page.lines.is_empty());
        assert!(!page.rotated);
    }

    #[test]
    fn rotation_preserves_bytes_for_append_writer() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("c.log");

        // A writer holding an append-mode handle across the rotation, the way
        // a child process does.
        let mut writer = open_append(&p).unwrap();
        let first = b"x".repeat(4096);
        writer.write_all(&first).unwrap();
        writer.flush().unwrap();

        assert!(rotate_if_needed(&p, 1024).unwrap());

        // Writer keeps writing through the same fd; append lands at offset 0.
        writer.write_all(b"after-rotation").unwrap();
        writer.flush().unwrap();

        let backup = std::fs::read(format!("{}.1", p.display())).unwrap();
        let live = std::fs::read(&p).unwrap();
        assert_eq!(backup, first);
        assert_eq!(live, b"after-rotation");

        // Concatenation yields the full byte sequence in order.
        let mut joined = backup.clone();
        joined.extend_from_slice(&live);
        let mut expected = first.clone();
        expected.extend_from_slice(b"after-rotation");
        assert_eq!(joined, expected);
    }

    #[test]
    fn rotation_skips_small_files() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("d.log");
        std::fs::write(&p, "small").unwrap();
        assert!(!rotate_if_needed(&p, 1024).unwrap());
        assert!(!rotate_if_needed(&dir.path().join("absent.log"), 1024).unwrap());
    }

    #[test]
    fn paths_use_sanitised_stems() {
        let dir = Path::new("/tmp/log");
        assert_eq!(
            log_path(dir, "My App (v2)"),
            PathBuf::from("/tmp/log/My_App_v2.log")
        );
        assert_eq!(
            rotated_path(dir, "My App (v2)"),
            PathBuf::from("/tmp/log/My_App_v2.log.1")
        );
    }
}
