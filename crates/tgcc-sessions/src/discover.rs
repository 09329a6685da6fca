//! Read-only discovery of the CLI's persisted session logs.
//!
//! The CLI writes one `<session-id>.jsonl` per session under
//! `<claude home>/projects/<slug of working dir>/`. Title, model and
//! context-fill are heuristics over that file; the log format is owned by
//! the CLI and may grow fields at any time, so everything here is
//! best-effort and returns `None` rather than failing.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::types::SessionInfo;

/// Context window assumed when estimating fill percentage.
const CONTEXT_WINDOW_TOKENS: u64 = 200_000;
/// How many characters of display title to keep.
const TITLE_MAX: usize = 60;
/// How many trailing lines to scan for model/usage.
const TAIL_LINES: usize = 80;

/// Slug of a working directory, as the CLI names its project folders:
/// every path separator and dot becomes a dash.
pub fn project_slug(workdir: &Path) -> String {
    workdir
        .to_string_lossy()
        .chars()
        .map(|c| if c == '/' || c == '.' || c == '_' { '-' } else { c })
        .collect()
}

/// List up to `limit` sessions for `workdir`, newest first.
pub fn discover_sessions(claude_home: &Path, workdir: &Path, limit: usize) -> Vec<SessionInfo> {
    let dir = claude_home.join("projects").join(project_slug(workdir));
    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "no session log directory");
            return Vec::new();
        }
    };

    let mut logs: Vec<(PathBuf, DateTime<Utc>)> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "jsonl"))
        .filter_map(|e| {
            let modified = e.metadata().ok()?.modified().ok()?;
            Some((e.path(), DateTime::<Utc>::from(modified)))
        })
        .collect();
    logs.sort_by(|a, b| b.1.cmp(&a.1));
    logs.truncate(limit);

    logs.into_iter()
        .filter_map(|(path, modified_at)| inspect_log(&path, modified_at))
        .collect()
}

fn inspect_log(path: &Path, modified_at: DateTime<Utc>) -> Option<SessionInfo> {
    let id = path.file_stem()?.to_string_lossy().to_string();
    let content = std::fs::read_to_string(path).ok()?;
    let lines: Vec<&str> = content.lines().collect();

    let tail_start = lines.len().saturating_sub(TAIL_LINES);
    let tail = &lines[tail_start..];

    Some(SessionInfo {
        id,
        title: extract_title(&lines),
        model: extract_model(tail),
        context_pct: extract_context_pct(tail),
        modified_at,
    })
}

/// First meaningful user turn: a user message with plain text that is not
/// a slash command and not injected XML.
fn extract_title(lines: &[&str]) -> Option<String> {
    for line in lines {
        let value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => continue,
        };
        if value.get("type").and_then(|t| t.as_str()) != Some("user") {
            continue;
        }
        let text = match value.pointer("/message/content") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Array(parts)) => parts
                .iter()
                .find(|p| p.get("type").and_then(|t| t.as_str()) == Some("text"))
                .and_then(|p| p.get("text"))
                .and_then(|t| t.as_str())
                .unwrap_or_default()
                .to_string(),
            _ => continue,
        };
        let trimmed = text.trim();
        if trimmed.is_empty() || trimmed.starts_with('/') || trimmed.starts_with('<') {
            continue;
        }
        let first_line = trimmed.lines().next().unwrap_or(trimmed);
        return Some(truncate_chars(first_line, TITLE_MAX));
    }
    None
}

/// Last `"model"` occurrence near the file end.
fn extract_model(tail: &[&str]) -> Option<String> {
    for line in tail.iter().rev() {
        let value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => continue,
        };
        let model = value
            .pointer("/message/model")
            .or_else(|| value.get("model"))
            .and_then(|m| m.as_str());
        if let Some(model) = model {
            return Some(model.to_string());
        }
    }
    None
}

/// Last `"usage"` occurrence near the file end: input + cache-read +
/// cache-creation over the assumed window.
fn extract_context_pct(tail: &[&str]) -> Option<u8> {
    for line in tail.iter().rev() {
        let value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => continue,
        };
        let usage = value
            .pointer("/message/usage")
            .or_else(|| value.get("usage"))?;
        let sum = ["input_tokens", "cache_read_input_tokens", "cache_creation_input_tokens"]
            .iter()
            .filter_map(|k| usage.get(k).and_then(|v| v.as_u64()))
            .sum::<u64>();
        if sum == 0 {
            continue;
        }
        let pct = (sum * 100 / CONTEXT_WINDOW_TOKENS).min(100) as u8;
        return Some(pct);
    }
    None
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{cut}…")
    }
}
