use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One discovered session log, read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Session id — the log file stem.
    pub id: String,
    /// First meaningful user turn, truncated for display.
    pub title: Option<String>,
    /// Last model mentioned near the end of the log.
    pub model: Option<String>,
    /// Approximate context-window fill, 0–100.
    pub context_pct: Option<u8>,
    pub modified_at: DateTime<Utc>,
}

impl SessionInfo {
    /// Short id prefix for status lines (`a1b2c3d4…`).
    pub fn short_id(&self) -> &str {
        let end = self
            .id
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.id.len());
        &self.id[..end]
    }
}
