//! Rendering of remote trace events into user-facing progress lines.
//!
//! The service emits an extensible stream of `{event, payload}` records per
//! job. Known events map to fixed Chinese progress lines; everything else
//! goes through a suffix/substring fallback matrix. Rendering is pure: one
//! item in, one line (possibly empty, meaning "suppress") out.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use syl_client::types::{JobTraceItem, TracePayload};
use syl_client::TraceEvent;

static LINE_LENGTH_CONSTRAINT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^第(\d+)条长度不满足约束:\s*(\d+)（规则区间 \[(\d+),(\d+)\]，容差区间 \[(\d+),(\d+)\]）$")
        .expect("line length pattern")
});
static TEXT_LENGTH_CONSTRAINT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^长度不满足约束:\s*(\d+)（规则区间 \[(\d+),(\d+)\]，容差区间 \[(\d+),(\d+)\]）$")
        .expect("text length pattern")
});

/// HTTP-layer trace events hidden even in verbose mode: job polling and
/// trace reads would otherwise drown the NDJSON stream.
pub fn should_skip_verbose_http_trace(verbose: bool, ev: &TraceEvent) -> bool {
    if !verbose {
        return true;
    }
    ev.method.eq_ignore_ascii_case("GET")
        && (ev.url.contains("/v1/jobs/") || ev.url.contains("/v1/admin/logs/trace/"))
}

/// Worker trace records hidden even in verbose mode.
pub fn should_skip_verbose_worker_trace(item: &JobTraceItem) -> bool {
    item.source == "api" && matches!(item.event.as_str(), "job_status_read" | "job_result_not_ready")
}

/// Translate one trace item into a user-facing line. Empty means suppress.
/// `colorize` wraps rule-defined labels in ANSI bright green; the file sink
/// strips it again.
pub fn render_worker_trace_line(item: &JobTraceItem, colorize: bool) -> String {
    if item.source == "api"
        && matches!(item.event.as_str(), "job_status_read" | "job_result_not_ready")
    {
        return String::new();
    }
    let message = string_payload(&item.payload, "message");
    if !message.trim().is_empty() {
        return message.trim().to_string();
    }
    match item.event.as_str() {
        "generate_queued" => {
            if item.job_id.trim().is_empty() {
                "任务已加入队列".to_string()
            } else {
                format!("任务已加入队列 {}", item.job_id)
            }
        }
        "rules_loaded" => format!("规则已加载 {}", string_payload(&item.payload, "rules_version")),
        "section_generate_ok" => {
            let step = string_payload(&item.payload, "step");
            let tail = tail_duration(&item.payload, "duration_ms", colorize);
            if judge_round_of_step(&step).is_some() {
                format!("{}完成{}", section_label(&item.payload, colorize), tail)
            } else {
                format!("{}已生成{}", section_label(&item.payload, colorize), tail)
            }
        }
        "section_sentence_step_ok" => {
            let label = section_label(&item.payload, colorize);
            let idx = int_payload(&item.payload, "sentence_index");
            let total = int_payload(&item.payload, "sentence_total");
            let tail = tail_duration(&item.payload, "duration_ms", colorize);
            if idx > 0 && total > 0 {
                format!("{label}逐句生成（第{idx}/{total}句）完成{tail}")
            } else {
                format!("{label}逐句生成完成{tail}")
            }
        }
        "section_sentence_step_validate_fail" => {
            let label = section_label(&item.payload, colorize);
            let idx = int_payload(&item.payload, "sentence_index");
            let total = int_payload(&item.payload, "sentence_total");
            let err = short_text(&string_payload(&item.payload, "error"), 140);
            if idx > 0 && total > 0 {
                format!("{label}逐句校验失败（第{idx}/{total}句）：{err}")
            } else {
                format!("{label}逐句校验失败：{err}")
            }
        }
        // Low-level LLM call events stay out of normal output; --verbose
        // exposes them as raw NDJSON records instead.
        "api_request" | "api_ok" | "api_retry" | "api_failed" => String::new(),
        "job_retry_scheduled" => format!(
            "任务重试计划：第 {}/{} 次失败，准备第 {} 次（等待由队列退避控制）：{}",
            int_payload(&item.payload, "attempt"),
            int_payload(&item.payload, "max_attempts"),
            int_payload(&item.payload, "next_attempt"),
            short_text(&string_payload(&item.payload, "error"), 100)
        ),
        "job_succeeded" => format!(
            "执行完成{}",
            tail_duration(&item.payload, "duration_ms", colorize)
        ),
        "job_failed" => format!(
            "执行失败：{}",
            short_text(&string_payload(&item.payload, "error"), 120)
        ),
        "job_cancel_requested" => "取消请求已提交".to_string(),
        "job_cancelled" => "任务已取消".to_string(),
        "generation_ok" => format!(
            "生成阶段完成{}",
            tail_duration(&item.payload, "timing_ms", colorize)
        ),
        _ => generic_worker_trace_line(item, colorize),
    }
}

fn generic_worker_trace_line(item: &JobTraceItem, colorize: bool) -> String {
    let step = string_payload(&item.payload, "step");
    let err_text = string_payload(&item.payload, "error");
    let label = section_label(&item.payload, colorize);
    if item.event.ends_with("_start") && !step.is_empty() {
        return String::new();
    }
    if item.event.contains("repair_needed") || item.event.contains("validate_fail") {
        return format!("{label}规则校验失败：{}", error_preview_multiline(&item.payload));
    }
    if item.event.ends_with("_repair_ok") {
        return format!("{label}修复完成");
    }
    if item.event.ends_with("_ok") && !step.is_empty() {
        return format!(
            "{label}完成{}",
            tail_duration(&item.payload, "duration_ms", colorize)
        );
    }
    if item.event.ends_with("_failed") {
        if err_text.is_empty() {
            return format!("{}失败", event_label(&item.event));
        }
        return format!("{}失败：{}", event_label(&item.event), short_text(&err_text, 120));
    }
    if !err_text.is_empty() {
        return format!("{}：{}", event_label(&item.event), short_text(&err_text, 120));
    }
    String::new()
}

/// `<tenant|->:<hh>:<mm>:<ss>`, hour segment omitted while zero.
pub fn trace_prefix(tenant_id: &str, elapsed_ms: i64) -> String {
    let tenant = tenant_id.trim();
    let tenant = if tenant.is_empty() { "-" } else { tenant };
    let total_sec = elapsed_ms.max(0) / 1000;
    let hh = total_sec / 3600;
    let mm = (total_sec % 3600) / 60;
    let ss = total_sec % 60;
    if hh > 0 {
        format!("{tenant}:{hh:02}:{mm:02}:{ss:02}")
    } else {
        format!("{tenant}:{mm:02}:{ss:02}")
    }
}

/// Prefix for one task's log lines; `[<label>]` omitted when blank.
pub fn task_prefix(tenant_id: &str, elapsed_ms: i64, task_label: &str) -> String {
    let prefix = trace_prefix(tenant_id, elapsed_ms);
    let label = task_label.trim();
    if label.is_empty() {
        prefix
    } else {
        format!("{prefix} [{label}]")
    }
}

/// `1h1m5s` / `1m5s` / `2s`, rounded to whole seconds.
pub fn human_duration_short(d: Duration) -> String {
    let sec = d.as_secs_f64().round() as i64;
    let h = sec / 3600;
    let m = (sec % 3600) / 60;
    let s = sec % 60;
    if h > 0 {
        format!("{h}h{m}m{s}s")
    } else if m > 0 {
        format!("{m}m{s}s")
    } else {
        format!("{s}s")
    }
}

fn step_label(step: &str) -> String {
    if step.is_empty() {
        return "任务步骤".to_string();
    }
    if let Some(label) = judge_round_step_label(step) {
        return label;
    }
    if let Some(rest) = step.strip_prefix("translate_") {
        return format!("{}翻译", section_display_name(rest));
    }
    if let Some(idx) = step.find("_attempt_") {
        if idx > 0 {
            return step_label(&step[..idx]);
        }
    }
    if let Some(base) = step.strip_suffix("_whole_repair") {
        return format!("{}整段修复", step_label(base));
    }
    section_display_name(step)
}

fn judge_round_step_label(step: &str) -> Option<String> {
    let parts: Vec<&str> = step.split('_').collect();
    let round = judge_round_of_parts(&parts)?;
    Some(format!(
        "{}一致性修复（第{round}轮）",
        section_display_name(parts[0])
    ))
}

fn judge_round_of_step(step: &str) -> Option<i64> {
    let parts: Vec<&str> = step.split('_').collect();
    judge_round_of_parts(&parts)
}

// Expected shape: <section>_judge_repair_round_<n>
fn judge_round_of_parts(parts: &[&str]) -> Option<i64> {
    if parts.len() != 5 || parts[1] != "judge" || parts[2] != "repair" || parts[3] != "round" {
        return None;
    }
    match parts[4].parse::<i64>() {
        Ok(round) if round > 0 => Some(round),
        _ => None,
    }
}

fn section_display_name(token: &str) -> String {
    let clean = token.replace('_', " ");
    let clean = clean.trim();
    if clean.is_empty() {
        "步骤".to_string()
    } else {
        clean.to_string()
    }
}

fn event_label(name: &str) -> String {
    let clean = name.replace('_', " ");
    let clean = clean.trim();
    if clean.is_empty() {
        "事件".to_string()
    } else {
        clean.to_string()
    }
}

fn section_label(payload: &TracePayload, colorize: bool) -> String {
    let step = string_payload(payload, "step");
    let label = string_payload(payload, "label");
    if !label.trim().is_empty() {
        return format_base_label_with_step(label.trim(), &step, colorize);
    }
    let display = string_payload(payload, "display");
    if !display.trim().is_empty() {
        return format_base_label_with_step(display.trim(), &step, colorize);
    }
    if !step.is_empty() {
        // Only rule-defined display labels get highlighted; derived step
        // names stay uncolored.
        return step_label(&step);
    }
    let section = string_payload(payload, "section");
    if section.is_empty() {
        return "步骤".to_string();
    }
    step_label(&section)
}

fn format_base_label_with_step(base_label: &str, step: &str, colorize: bool) -> String {
    let base = color_label(base_label, colorize);
    if step.is_empty() {
        return base;
    }
    if step.starts_with("translate_") {
        return format!("{base}翻译");
    }
    if let Some(round) = judge_round_of_step(step) {
        return format!("{base}一致性修复（第{round}轮）");
    }
    if step.ends_with("_whole_repair") {
        return format!("{base}整段修复");
    }
    base
}

fn color_label(label: &str, enabled: bool) -> String {
    if !enabled || label.trim().is_empty() {
        return label.to_string();
    }
    format!("\x1b[92m{label}\x1b[0m")
}

fn int_payload(payload: &TracePayload, key: &str) -> i64 {
    match payload.get(key) {
        Some(Value::Number(n)) => {
            if let Some(i) = n.as_i64() {
                i
            } else if let Some(u) = n.as_u64() {
                u as i64
            } else if let Some(f) = n.as_f64() {
                f as i64
            } else {
                0
            }
        }
        _ => 0,
    }
}

fn string_payload(payload: &TracePayload, key: &str) -> String {
    match payload.get(key) {
        None | Some(Value::Null) => String::new(),
        Some(value) => value_text(value),
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                if n.as_i64().is_none() && n.as_u64().is_none() && f.fract() == 0.0 {
                    return format!("{}", f as i64);
                }
            }
            n.to_string()
        }
        other => other.to_string(),
    }
}

fn first_error(payload: &TracePayload) -> String {
    match payload.get("errors") {
        None | Some(Value::Null) => "未知错误".to_string(),
        Some(Value::Array(arr)) => match arr.first() {
            Some(first) => short_text(&value_text(first), 140),
            None => "未知错误".to_string(),
        },
        Some(other) => short_text(&value_text(other), 140),
    }
}

fn all_errors(payload: &TracePayload) -> Vec<String> {
    let value = match payload.get("errors") {
        None | Some(Value::Null) => return Vec::new(),
        Some(v) => v,
    };
    match value {
        Value::Array(arr) => arr
            .iter()
            .map(|v| value_text(v).trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        other => {
            let text = value_text(other).trim().to_string();
            if text.is_empty() {
                Vec::new()
            } else {
                vec![text]
            }
        }
    }
}

fn error_preview_multiline(payload: &TracePayload) -> String {
    let errs = all_errors(payload);
    if errs.is_empty() {
        return first_error(payload);
    }
    let formatted: Vec<String> = errs.iter().map(|e| format_validation_error(e)).collect();
    format!("\n           {}", formatted.join("；\n           "))
}

fn format_validation_error(err_text: &str) -> String {
    let err_text = err_text.trim();
    if err_text.is_empty() {
        return "未知错误".to_string();
    }
    if let Some(m) = LINE_LENGTH_CONSTRAINT.captures(err_text) {
        return format!(
            "第{}条长度不满足约束: {}",
            &m[1],
            format_length_constraint_range(&m[2], &m[3], &m[4], &m[5], &m[6])
        );
    }
    if let Some(m) = TEXT_LENGTH_CONSTRAINT.captures(err_text) {
        return format!(
            "长度不满足约束: {}",
            format_length_constraint_range(&m[1], &m[2], &m[3], &m[4], &m[5])
        );
    }
    err_text.to_string()
}

fn format_length_constraint_range(
    actual: &str,
    rule_min: &str,
    rule_max: &str,
    tol_min: &str,
    tol_max: &str,
) -> String {
    let parsed = (
        actual.parse::<i64>(),
        rule_min.parse::<i64>(),
        rule_max.parse::<i64>(),
        tol_min.parse::<i64>(),
        tol_max.parse::<i64>(),
    );
    let (actual_n, rule_min_n, rule_max_n, tol_min_n, tol_max_n) = match parsed {
        (Ok(a), Ok(rmin), Ok(rmax), Ok(tmin), Ok(tmax)) => (a, rmin, rmax, tmin, tmax),
        _ => return format!("{actual} ? [{tol_min}[{rule_min},{rule_max}]{tol_max}]"),
    };
    if actual_n < tol_min_n {
        format!("{actual_n} < [{tol_min_n}[{rule_min_n},{rule_max_n}]{tol_max_n}] 低于下限")
    } else {
        format!("[{tol_min_n}[{rule_min_n},{rule_max_n}]{tol_max_n}] < {actual_n} 高于上限")
    }
}

fn tail_duration(payload: &TracePayload, key: &str, colorize: bool) -> String {
    let label = duration_label(payload, key);
    if label == "-" || label.trim().is_empty() {
        return String::new();
    }
    if colorize {
        format!(" \x1b[90m{label}\x1b[0m")
    } else {
        format!(" {label}")
    }
}

fn duration_label(payload: &TracePayload, key: &str) -> String {
    let ms = int_payload(payload, key);
    if ms <= 0 {
        return "-".to_string();
    }
    if ms >= 60_000 {
        format!("{:.2}m", ms as f64 / 60_000.0)
    } else if ms >= 1_000 {
        format!("{:.2}s", ms as f64 / 1_000.0)
    } else {
        format!("{ms}ms")
    }
}

/// Byte-budget truncation with a `...` marker, kept on a char boundary.
fn short_text(s: &str, n: usize) -> String {
    if n == 0 || s.len() <= n {
        return s.to_string();
    }
    let mut end = n;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", s[..end].trim())
}
