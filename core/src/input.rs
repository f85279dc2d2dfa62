//! Requirement-file discovery.
//!
//! A file qualifies when its first line — after stripping a UTF-8 BOM and
//! surrounding whitespace — equals the marker declared in the active rules
//! archive. The returned content is everything after that line.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequirementFile {
    pub path: PathBuf,
    pub content: String,
}

/// Walk the given files and directories, collect qualifying files, dedup by
/// absolute path. An empty result is fatal: the run has nothing to do.
pub fn discover(inputs: &[PathBuf], marker: &str) -> Result<Vec<RequirementFile>> {
    assert!(!marker.trim().is_empty(), "discovery marker must be non-empty");

    let mut out = Vec::new();
    let mut seen: HashSet<PathBuf> = HashSet::new();
    for input in inputs {
        let meta = std::fs::metadata(input)
            .with_context(|| format!("读取输入失败: {}", input.display()))?;
        if meta.is_dir() {
            for entry in WalkDir::new(input).sort_by_file_name() {
                let entry =
                    entry.with_context(|| format!("遍历目录失败: {}", input.display()))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                collect(entry.path(), marker, &mut seen, &mut out)?;
            }
        } else {
            collect(input, marker, &mut seen, &mut out)?;
        }
    }
    if out.is_empty() {
        bail!("未发现 listing 要求文件（首行需为 {marker}）");
    }
    Ok(out)
}

fn collect(
    path: &Path,
    marker: &str,
    seen: &mut HashSet<PathBuf>,
    out: &mut Vec<RequirementFile>,
) -> Result<()> {
    let Some(content) = read_if_requirement(path, marker)? else {
        return Ok(());
    };
    let key = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    if seen.insert(key) {
        out.push(RequirementFile {
            path: path.to_path_buf(),
            content,
        });
    }
    Ok(())
}

/// `Some(content-after-first-line)` when the first line matches the marker.
/// Non-UTF-8 files never match.
fn read_if_requirement(path: &Path, marker: &str) -> Result<Option<String>> {
    let raw = std::fs::read(path).with_context(|| format!("读取文件失败: {}", path.display()))?;
    let Ok(text) = String::from_utf8(raw) else {
        return Ok(None);
    };
    let (first_line, rest) = match text.split_once('\n') {
        Some((first, rest)) => (first, rest),
        None => (text.as_str(), ""),
    };
    let first_line = first_line.strip_prefix('\u{feff}').unwrap_or(first_line);
    if first_line.trim() != marker {
        return Ok(None);
    }
    Ok(Some(rest.to_string()))
}
