use llamarelay_common::Result;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Log files written under `dir` with the given prefix, newest first.
/// Daily rotation appends the date, so names sort chronologically.
fn log_files(dir: &Path, prefix: &str) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let matches = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(prefix));
        if matches && entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    files.reverse();
    Ok(files)
}

/// The last `count` log lines across the rotated files, oldest first
pub fn tail_lines(dir: &Path, prefix: &str, count: usize) -> Result<Vec<String>> {
    let mut collected: Vec<String> = Vec::new();

    for path in log_files(dir, prefix)? {
        if collected.len() >= count {
            break;
        }
        debug!("Reading log file {}", path.display());
        let content = std::fs::read_to_string(&path)?;
        let needed = count - collected.len();
        let lines: Vec<&str> = content.lines().collect();
        let start = lines.len().saturating_sub(needed);
        // Older files go in front of what was already read
        let mut older: Vec<String> = lines[start..].iter().map(|line| line.to_string()).collect();
        older.append(&mut collected);
        collected = older;
    }

    Ok(collected)
}
