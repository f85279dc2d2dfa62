//! Markdown → Word conversion via the external `syl-md2doc` binary.
//!
//! Success contract: after a zero exit, the target file exists. When the
//! converter wrote somewhere else it reports the path in a final JSON
//! summary line; we rename that file onto the target. Anything else is a
//! per-task failure.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use syl_client::OrCancelExt;

const CONVERTER_BIN: &str = "syl-md2doc";
const OUTPUT_PREVIEW_LIMIT: usize = 300;

#[async_trait]
pub trait MarkdownToDocx: Send + Sync {
    /// Convert `markdown_path` into `target_path`, returning the final
    /// absolute document path.
    async fn convert(
        &self,
        cancel: &CancellationToken,
        markdown_path: &Path,
        target_path: &Path,
        highlight_words: &[String],
    ) -> Result<PathBuf>;
}

/// The production converter: one subprocess per artifact.
pub struct SylMd2Doc;

#[async_trait]
impl MarkdownToDocx for SylMd2Doc {
    async fn convert(
        &self,
        cancel: &CancellationToken,
        markdown_path: &Path,
        target_path: &Path,
        highlight_words: &[String],
    ) -> Result<PathBuf> {
        let target = std::path::absolute(target_path).unwrap_or_else(|_| target_path.to_path_buf());

        let mut cmd = tokio::process::Command::new(CONVERTER_BIN);
        cmd.arg(markdown_path).arg("--output").arg(&target);
        let words = dedupe_words(highlight_words);
        if !words.is_empty() {
            cmd.arg("--highlight-words").arg(words.join(","));
        }
        cmd.kill_on_drop(true);

        let output = match cmd.output().or_cancel(cancel).await {
            Err(_) => bail!("{CONVERTER_BIN} 已取消"),
            Ok(result) => result.with_context(|| format!("{CONVERTER_BIN} 启动失败"))?,
        };
        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);
        let combined_text = String::from_utf8_lossy(&combined);

        if !output.status.success() {
            bail!(
                "{CONVERTER_BIN} 执行失败: {}: {}",
                output.status,
                preview(&combined_text)
            );
        }

        if target.is_file() {
            return Ok(target);
        }

        let reported = parse_md2doc_output_path(&combined_text);
        let Some(reported) = reported else {
            bail!(
                "{CONVERTER_BIN} 未返回输出路径且目标文件不存在: {}",
                preview(&combined_text)
            );
        };
        let reported = std::path::absolute(Path::new(&reported))
            .unwrap_or_else(|_| PathBuf::from(&reported));
        if reported == target {
            return Ok(target);
        }
        std::fs::rename(&reported, &target).with_context(|| {
            format!(
                "Word 输出文件名不一致，重命名失败: got={} want={}",
                reported.display(),
                target.display()
            )
        })?;
        Ok(target)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Md2DocSummaryLine {
    event: String,
    details: Md2DocSummaryDetails,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Md2DocSummaryDetails {
    output_path: String,
    output_paths: Vec<String>,
}

/// Scan combined output bottom-up for the JSON summary line and pull the
/// reported output path out of it.
fn parse_md2doc_output_path(raw: &str) -> Option<String> {
    for line in raw.replace("\r\n", "\n").lines().rev() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(summary) = serde_json::from_str::<Md2DocSummaryLine>(line) else {
            continue;
        };
        let path = summary.details.output_path.trim();
        if !path.is_empty() {
            return Some(path.to_string());
        }
        if let Some(first) = summary.details.output_paths.first() {
            let first = first.trim();
            if !first.is_empty() {
                return Some(first.to_string());
            }
        }
    }
    None
}

/// Case-insensitive dedup keeping first spelling; blanks dropped.
fn dedupe_words(words: &[String]) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::with_capacity(words.len());
    for raw in words {
        let word = raw.trim();
        if word.is_empty() {
            continue;
        }
        if seen.insert(word.to_lowercase()) {
            out.push(word.to_string());
        }
    }
    out
}

fn preview(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.len() <= OUTPUT_PREVIEW_LIMIT {
        return trimmed.to_string();
    }
    let mut end = OUTPUT_PREVIEW_LIMIT;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    trimmed[..end].trim().to_string()
}
