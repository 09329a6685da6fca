use std::collections::HashMap;
use std::path::PathBuf;

use figment::{
    providers::{Env, Format, Json},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// Default idle timeout before the CLI child is shut down (seconds).
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;
/// Default hang-detection timeout (seconds).
pub const DEFAULT_HANG_TIMEOUT_SECS: u64 = 300;
/// Default `--max-turns` handed to the CLI.
pub const DEFAULT_MAX_TURNS: u32 = 50;

/// Top-level config (tgcc.json + TGCC_* env overrides).
///
/// The daemon receives this as a validated snapshot; type checking and
/// duplicate/repo-exclusivity validation happen in the loader before the
/// snapshot reaches the core.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BridgeConfig {
    #[serde(default)]
    pub global: GlobalConfig,
    /// Named repository registry: name → absolute path.
    #[serde(default)]
    pub repos: HashMap<String, PathBuf>,
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Path to the CLI binary.
    #[serde(default = "default_binary")]
    pub binary: String,
    /// Directory for inbound/outbound media files.
    #[serde(default = "default_media_dir")]
    pub media_dir: PathBuf,
    /// Directory under which admin and tool sockets are created.
    #[serde(default = "default_socket_dir")]
    pub socket_dir: PathBuf,
    /// Default tracing filter, overridable per-run with RUST_LOG.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Persisted daemon state (pending session ids etc.).
    pub state_file: Option<PathBuf>,
    /// Home of the CLI's own on-disk state; session logs live under
    /// `<claude_home>/projects/<workdir slug>/`.
    #[serde(default = "default_claude_home")]
    pub claude_home: PathBuf,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            media_dir: default_media_dir(),
            socket_dir: default_socket_dir(),
            log_level: default_log_level(),
            state_file: None,
            claude_home: default_claude_home(),
        }
    }
}

/// One agent block: a bot identity plus CLI defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    pub bot_token: String,
    /// Telegram user ids allowed to drive this agent (deny-by-default).
    #[serde(default)]
    pub allowed_users: Vec<i64>,
    pub model: Option<String>,
    /// Name from the repo registry, or an absolute path.
    pub repo: Option<String>,
    #[serde(default)]
    pub permission_mode: crate::types::PermissionMode,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_hang_timeout")]
    pub hang_timeout_secs: u64,
    /// MCP config file handed to the CLI via `--mcp-config`; this is how
    /// the tool-exposure server reaches back into the daemon.
    pub mcp_config: Option<PathBuf>,
    /// Per-user overrides keyed by Telegram user id (as string, JSON keys
    /// are strings).
    #[serde(default)]
    pub user_overrides: HashMap<String, UserOverride>,
}

/// Per-user override of the agent defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserOverride {
    pub model: Option<String>,
    pub repo: Option<String>,
    pub permission_mode: Option<crate::types::PermissionMode>,
}

impl AgentConfig {
    /// Effective model for a user, honoring overrides.
    pub fn model_for(&self, user_id: i64) -> Option<&str> {
        self.user_overrides
            .get(&user_id.to_string())
            .and_then(|o| o.model.as_deref())
            .or(self.model.as_deref())
    }

    /// Effective repo name/path for a user, honoring overrides.
    pub fn repo_for(&self, user_id: i64) -> Option<&str> {
        self.user_overrides
            .get(&user_id.to_string())
            .and_then(|o| o.repo.as_deref())
            .or(self.repo.as_deref())
    }

    pub fn permission_mode_for(&self, user_id: i64) -> crate::types::PermissionMode {
        self.user_overrides
            .get(&user_id.to_string())
            .and_then(|o| o.permission_mode)
            .unwrap_or(self.permission_mode)
    }
}

impl BridgeConfig {
    /// Load config: explicit path > TGCC_CONFIG env > ~/.tgcc/tgcc.json.
    ///
    /// TGCC_* env vars override individual global fields.
    pub fn load(explicit_path: Option<&str>) -> Result<Self> {
        let path = explicit_path
            .map(PathBuf::from)
            .or_else(|| std::env::var("TGCC_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(default_config_path);

        let config: BridgeConfig = Figment::new()
            .merge(Json::file(&path))
            .merge(Env::prefixed("TGCC_").split("__"))
            .extract()
            .map_err(|e| BridgeError::Config(format!("{path:?}: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validation that must hold before the snapshot reaches the core:
    /// non-empty tokens, unique agent ids, repo references resolvable.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for agent in &self.agents {
            if agent.id.is_empty() {
                return Err(BridgeError::Config("agent with empty id".into()));
            }
            if !seen.insert(agent.id.as_str()) {
                return Err(BridgeError::Config(format!("duplicate agent id: {}", agent.id)));
            }
            if agent.bot_token.is_empty() {
                return Err(BridgeError::Config(format!(
                    "agent {}: bot_token is required",
                    agent.id
                )));
            }
            if let Some(repo) = &agent.repo {
                if !repo.starts_with('/') && !self.repos.contains_key(repo) {
                    return Err(BridgeError::Config(format!(
                        "agent {}: unknown repo '{repo}'",
                        agent.id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Resolve a repo reference (registry name or absolute path) to a path.
    pub fn resolve_repo(&self, reference: &str) -> Option<PathBuf> {
        if reference.starts_with('/') {
            return Some(PathBuf::from(reference));
        }
        self.repos.get(reference).cloned()
    }

    pub fn agent(&self, id: &str) -> Option<&AgentConfig> {
        self.agents.iter().find(|a| a.id == id)
    }
}

/// Per-agent classification of a config reload.
#[derive(Debug, Clone, Default)]
pub struct ConfigDiff {
    pub added: Vec<AgentConfig>,
    pub removed: Vec<String>,
    pub changed: Vec<AgentChange>,
}

/// A changed agent block. `token_changed` forces a full agent restart;
/// any other change is applied in place and takes effect on next spawn.
#[derive(Debug, Clone)]
pub struct AgentChange {
    pub config: AgentConfig,
    pub token_changed: bool,
}

impl ConfigDiff {
    pub fn between(old: &BridgeConfig, new: &BridgeConfig) -> Self {
        let mut diff = ConfigDiff::default();

        for agent in &new.agents {
            match old.agent(&agent.id) {
                None => diff.added.push(agent.clone()),
                Some(prev) if prev != agent => diff.changed.push(AgentChange {
                    token_changed: prev.bot_token != agent.bot_token,
                    config: agent.clone(),
                }),
                Some(_) => {}
            }
        }
        for agent in &old.agents {
            if new.agent(&agent.id).is_none() {
                diff.removed.push(agent.id.clone());
            }
        }
        diff
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

fn default_binary() -> String {
    "claude".to_string()
}

fn default_media_dir() -> PathBuf {
    PathBuf::from("/tmp/tgcc/media")
}

fn default_socket_dir() -> PathBuf {
    PathBuf::from("/tmp/tgcc")
}

fn default_log_level() -> String {
    "tgcc=info".to_string()
}

fn default_claude_home() -> PathBuf {
    home_dir().join(".claude")
}

fn default_config_path() -> PathBuf {
    home_dir().join(".tgcc/tgcc.json")
}

fn default_max_turns() -> u32 {
    DEFAULT_MAX_TURNS
}

fn default_idle_timeout() -> u64 {
    DEFAULT_IDLE_TIMEOUT_SECS
}

fn default_hang_timeout() -> u64 {
    DEFAULT_HANG_TIMEOUT_SECS
}

fn home_dir() -> PathBuf {
    std::env::var("HOME").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("/tmp"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(id: &str, token: &str) -> AgentConfig {
        AgentConfig {
            id: id.to_string(),
            bot_token: token.to_string(),
            allowed_users: vec![42],
            model: None,
            repo: None,
            permission_mode: Default::default(),
            max_turns: default_max_turns(),
            idle_timeout_secs: default_idle_timeout(),
            hang_timeout_secs: default_hang_timeout(),
            mcp_config: None,
            user_overrides: HashMap::new(),
        }
    }

    #[test]
    fn validate_rejects_duplicate_ids() {
        let config = BridgeConfig {
            agents: vec![agent("a", "t1"), agent("a", "t2")],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_unknown_repo() {
        let mut a = agent("a", "t1");
        a.repo = Some("nowhere".to_string());
        let config = BridgeConfig {
            agents: vec![a],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn absolute_repo_path_bypasses_registry() {
        let mut a = agent("a", "t1");
        a.repo = Some("/srv/work".to_string());
        let config = BridgeConfig {
            agents: vec![a],
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(
            config.resolve_repo("/srv/work"),
            Some(PathBuf::from("/srv/work"))
        );
    }

    #[test]
    fn diff_classifies_add_remove_change() {
        let old = BridgeConfig {
            agents: vec![agent("keep", "t"), agent("gone", "t"), agent("edit", "t")],
            ..Default::default()
        };
        let mut edited = agent("edit", "t");
        edited.model = Some("opus".to_string());
        let new = BridgeConfig {
            agents: vec![agent("keep", "t"), edited, agent("fresh", "t")],
            ..Default::default()
        };

        let diff = ConfigDiff::between(&old, &new);
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.added[0].id, "fresh");
        assert_eq!(diff.removed, vec!["gone".to_string()]);
        assert_eq!(diff.changed.len(), 1);
        assert!(!diff.changed[0].token_changed);
    }

    #[test]
    fn diff_flags_token_change() {
        let old = BridgeConfig {
            agents: vec![agent("a", "old-token")],
            ..Default::default()
        };
        let new = BridgeConfig {
            agents: vec![agent("a", "new-token")],
            ..Default::default()
        };
        let diff = ConfigDiff::between(&old, &new);
        assert!(diff.changed[0].token_changed);
    }

    #[test]
    fn user_override_wins_over_default() {
        let mut a = agent("a", "t");
        a.model = Some("sonnet".to_string());
        a.user_overrides.insert(
            "42".to_string(),
            UserOverride {
                model: Some("opus".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(a.model_for(42), Some("opus"));
        assert_eq!(a.model_for(7), Some("sonnet"));
    }
}
