//! Dual-sink run logger.
//!
//! Normal mode prints plain lines to stdout and mirrors them, ANSI-stripped,
//! into an optional log file. Verbose mode turns every write into one NDJSON
//! record (`{ts, event, ...fields}`) on both sinks. Workers log concurrently,
//! so all writes serialise through one mutex.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use once_cell::sync::Lazy;
use regex::Regex;

static ANSI_ESCAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[[0-9;]*m").expect("ansi pattern"));

pub struct Logger {
    verbose: bool,
    file: Mutex<Option<File>>,
}

impl Logger {
    pub fn new(verbose: bool, log_file: Option<&Path>) -> anyhow::Result<Self> {
        let file = match log_file {
            None => None,
            Some(path) => {
                if let Some(dir) = path.parent() {
                    if !dir.as_os_str().is_empty() {
                        std::fs::create_dir_all(dir)?;
                    }
                }
                Some(
                    OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(path)?,
                )
            }
        };
        Ok(Self {
            verbose,
            file: Mutex::new(file),
        })
    }

    /// A user-facing line. Verbose mode reroutes it through [`Self::event`]
    /// as `{event:"info", message:<line>}`.
    pub fn info(&self, line: &str) {
        if self.verbose {
            self.event("info", serde_json::json!({ "message": line }));
            return;
        }
        self.write_line(line);
    }

    /// An NDJSON record. Suppressed entirely outside verbose mode.
    pub fn event(&self, event: &str, fields: serde_json::Value) {
        if !self.verbose {
            return;
        }
        let mut record = serde_json::Map::new();
        record.insert(
            "ts".to_string(),
            serde_json::Value::String(chrono::Utc::now().to_rfc3339()),
        );
        record.insert(
            "event".to_string(),
            serde_json::Value::String(event.to_string()),
        );
        if let serde_json::Value::Object(fields) = fields {
            record.extend(fields);
        }
        let line = serde_json::Value::Object(record).to_string();
        self.write_line(&line);
    }

    fn write_line(&self, line: &str) {
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        println!("{line}");
        if let Some(f) = file.as_mut() {
            let _ = writeln!(f, "{}", strip_ansi(line));
        }
    }
}

/// Remove SGR escape sequences; the file sink must stay plain text.
pub fn strip_ansi(line: &str) -> String {
    ANSI_ESCAPE.replace_all(line, "").into_owned()
}
