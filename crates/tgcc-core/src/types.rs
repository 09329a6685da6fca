use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one configured agent (one bot identity + one CLI subprocess).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new(name: &str) -> Self {
        Self(name.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One consumer of a CLI process's event stream.
///
/// The same process may be shared by the chat bot, a CLI socket caller and
/// a supervisor subscriber; each is addressed by this triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientKey {
    pub agent_id: AgentId,
    pub user_id: i64,
    pub chat_id: i64,
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.agent_id, self.user_id, self.chat_id)
    }
}

/// Permission handling mode passed to the CLI at spawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionMode {
    /// Prompt over the chat for every gated tool call.
    #[default]
    Default,
    /// `--permission-mode acceptEdits`
    AcceptEdits,
    /// `--permission-mode plan`
    Plan,
    /// `--dangerously-skip-permissions`
    Skip,
}

impl PermissionMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "default" => Some(Self::Default),
            "accept-edits" | "acceptEdits" => Some(Self::AcceptEdits),
            "plan" => Some(Self::Plan),
            "skip" | "yolo" => Some(Self::Skip),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::AcceptEdits => "accept-edits",
            Self::Plan => "plan",
            Self::Skip => "skip",
        }
    }
}

/// Token and cost totals for one completed turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub cache_creation_tokens: u64,
    pub cost_usd: Option<f64>,
    pub model: Option<String>,
}

impl TurnUsage {
    /// Footer line appended to a finalized chat message.
    ///
    /// `↩ 12k in · 3k out · $0.0421` — the cost part is omitted when
    /// `cost_usd` is absent.
    pub fn footer(&self) -> String {
        let total_in = self.input_tokens + self.cache_read_tokens + self.cache_creation_tokens;
        let mut out = format!(
            "↩ {} in · {} out",
            format_tokens(total_in),
            format_tokens(self.output_tokens)
        );
        if let Some(cost) = self.cost_usd {
            out.push_str(&format!(" · ${cost:.4}"));
        }
        out
    }
}

/// Human-scale token count: `850`, `12k`, `1.2M`.
pub fn format_tokens(n: u64) -> String {
    if n >= 1_000_000 {
        format!("{:.1}M", n as f64 / 1_000_000.0)
    } else if n >= 1_000 {
        format!("{}k", n / 1_000)
    } else {
        n.to_string()
    }
}
