//! Sub-agent tracker: one Telegram message per background agent the
//! assistant dispatches, independent of the main streaming message.
//!
//! A sub-agent's completion can arrive three ways — inline tool result,
//! notification XML injected into a later user message, or a mailbox file
//! appearing on disk. All three reconcile through the same guarded
//! transition: only a record still in `Dispatched` (or `Running`) moves to
//! a terminal state, so a late duplicate is a no-op rather than a second
//! edit.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use tgcc_protocol::events::ToolUseResult;
use tgcc_protocol::partial;

use crate::html;
use crate::sink::ChatSink;

/// Display label cap.
const LABEL_MAX: usize = 80;
/// Result body cap inside the expandable blockquote.
const RESULT_MAX: usize = 3500;
/// Debounce for the all-reported callback, absorbing clustered
/// notifications.
const ALL_REPORTED_DEBOUNCE: Duration = Duration::from_millis(500);
/// The assistant's sub-agent dispatch tool.
const DISPATCH_TOOL: &str = "Task";

/// `true` when a tool-use block launches a sub-agent.
pub fn is_subagent_tool(name: &str) -> bool {
    if name == DISPATCH_TOOL {
        return true;
    }
    let lower = name.to_lowercase();
    lower.contains("agent") || lower.contains("dispatch")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubAgentStatus {
    Running,
    Dispatched,
    Completed,
    Failed,
}

struct SubAgentRecord {
    tool_use_id: String,
    block_index: usize,
    message_id: Option<i64>,
    status: SubAgentStatus,
    label: Option<String>,
    /// Name the CLI knows the agent by (`agent_id:<name>@<team>`), used
    /// for notification and mailbox matching.
    cli_name: Option<String>,
    input_json: String,
    dispatched_at: Option<Instant>,
    refresh: Option<JoinHandle<()>>,
    output_file: Option<PathBuf>,
}

impl SubAgentRecord {
    fn display_label(&self) -> String {
        self.label.clone().unwrap_or_else(|| "sub-agent".to_string())
    }

    fn is_terminal(&self) -> bool {
        matches!(self.status, SubAgentStatus::Completed | SubAgentStatus::Failed)
    }
}

struct TrackerState {
    records: HashMap<String, SubAgentRecord>,
    by_block: HashMap<usize, String>,
    team_name: Option<String>,
    on_all_reported: Option<Arc<dyn Fn() + Send + Sync>>,
    all_reported_fired: bool,
    debounce: Option<JoinHandle<()>>,
    mailbox: Option<JoinHandle<()>>,
    generation: u64,
}

#[derive(Debug, Clone)]
pub struct TrackerOptions {
    /// Cadence of the elapsed-time rewrite on dispatched agents.
    pub refresh_interval: Duration,
    /// Cadence of the mailbox-directory poll.
    pub mailbox_poll: Duration,
    /// Root of the agents' output mailbox, when configured.
    pub mailbox_root: Option<PathBuf>,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(15),
            mailbox_poll: Duration::from_secs(5),
            mailbox_root: None,
        }
    }
}

/// One tracker per (process, chat) pair. Cheap to clone.
#[derive(Clone)]
pub struct SubAgentTracker {
    sink: Arc<dyn ChatSink>,
    chat_id: i64,
    opts: TrackerOptions,
    state: Arc<Mutex<TrackerState>>,
}

impl SubAgentTracker {
    pub fn new(sink: Arc<dyn ChatSink>, chat_id: i64, opts: TrackerOptions) -> Self {
        Self {
            sink,
            chat_id,
            opts,
            state: Arc::new(Mutex::new(TrackerState {
                records: HashMap::new(),
                by_block: HashMap::new(),
                team_name: None,
                on_all_reported: None,
                all_reported_fired: false,
                debounce: None,
                mailbox: None,
                generation: 0,
            })),
        }
    }

    /// Fired once per turn when every tracked sub-agent has reported.
    pub async fn set_on_all_reported(&self, callback: Arc<dyn Fn() + Send + Sync>) {
        self.state.lock().await.on_all_reported = Some(callback);
    }

    /// Tool-use block opened. Returns `true` when it is a sub-agent
    /// launch and is now tracked.
    pub async fn handle_block_start(&self, index: usize, tool_use_id: &str, name: &str) -> bool {
        if !is_subagent_tool(name) {
            return false;
        }
        let mut s = self.state.lock().await;
        let message_id = match self
            .sink
            .send_message(self.chat_id, "🤖 Starting sub-agent…")
            .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(error = %e, "sub-agent status message failed");
                None
            }
        };
        s.by_block.insert(index, tool_use_id.to_string());
        s.records.insert(
            tool_use_id.to_string(),
            SubAgentRecord {
                tool_use_id: tool_use_id.to_string(),
                block_index: index,
                message_id,
                status: SubAgentStatus::Running,
                label: None,
                cli_name: None,
                input_json: String::new(),
                dispatched_at: None,
                refresh: None,
                output_file: None,
            },
        );
        true
    }

    /// Accumulate streamed tool input; refine the label when it improves.
    pub async fn handle_input_delta(&self, index: usize, fragment: &str) {
        let mut s = self.state.lock().await;
        let Some(id) = s.by_block.get(&index).cloned() else {
            return;
        };
        let (team, changed, message_id, label) = {
            let Some(record) = s.records.get_mut(&id) else {
                return;
            };
            record.input_json.push_str(fragment);

            let refined = extract_label(&record.input_json);
            let changed = refined.is_some() && refined != record.label;
            if changed {
                record.label = refined;
            }
            (
                extract_team(&record.input_json),
                changed,
                record.message_id,
                record.display_label(),
            )
        };
        if let Some(team) = team {
            s.team_name.get_or_insert(team);
        }
        if changed {
            if let Some(message_id) = message_id {
                let text = format!("🤖 {} — Starting…", html::escape_html(&label));
                let _ = self.sink.edit_message(self.chat_id, message_id, &text).await;
            }
        }
    }

    /// Block closed — the dispatch call is on its way. Start the elapsed
    /// refresh.
    pub async fn handle_block_stop(&self, index: usize) {
        let mut s = self.state.lock().await;
        let generation = s.generation;
        let Some(id) = s.by_block.get(&index).cloned() else {
            return;
        };
        let Some(record) = s.records.get_mut(&id) else {
            return;
        };
        if record.status != SubAgentStatus::Running {
            return;
        }
        debug!(index = record.block_index, id = %id, "sub-agent dispatched");
        record.status = SubAgentStatus::Dispatched;
        record.dispatched_at = Some(Instant::now());

        let this = self.clone();
        let refresh_interval = self.opts.refresh_interval;
        let record_id = id.clone();
        record.refresh = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(refresh_interval).await;
                let s = this.state.lock().await;
                if s.generation != generation {
                    return;
                }
                let Some(record) = s.records.get(&record_id) else {
                    return;
                };
                if record.status != SubAgentStatus::Dispatched {
                    return;
                }
                let Some(message_id) = record.message_id else {
                    return;
                };
                let elapsed = record
                    .dispatched_at
                    .map(|at| at.elapsed().as_secs())
                    .unwrap_or(0);
                let text = format!(
                    "🤖 {} — Working… ({elapsed}s)",
                    html::escape_html(&record.display_label())
                );
                // Edit under the lock so a concurrent terminal edit
                // cannot be overwritten by a stale "Working…" line.
                let _ = this.sink.edit_message(this.chat_id, message_id, &text).await;
            }
        }));

        self.maybe_start_mailbox(&mut s);
    }

    /// Inline tool result for a tracked dispatch.
    pub async fn handle_tool_result(
        &self,
        tool_use_id: &str,
        text: &str,
        meta: Option<&ToolUseResult>,
        is_error: bool,
    ) {
        let mut s = self.state.lock().await;

        let confirmation = spawn_confirmation(text);
        let auto_backgrounded = meta.is_some_and(|m| m.is_async_launched())
            || (text.contains("\"status\"") && text.contains("async"));

        if confirmation.is_some() || auto_backgrounded {
            // The real result arrives later via notification or mailbox;
            // stay dispatched.
            let team = confirmation.as_ref().and_then(|c| c.team_name.clone());
            let (message_id, label) = {
                let Some(record) = s.records.get_mut(tool_use_id) else {
                    return;
                };
                if record.is_terminal() {
                    return;
                }
                if let Some(parsed) = confirmation {
                    if record.cli_name.is_none() {
                        record.cli_name = parsed.agent_name;
                    }
                }
                if let Some(meta) = meta {
                    if record.cli_name.is_none() {
                        record.cli_name = meta.agent_name.clone();
                    }
                    if record.output_file.is_none() {
                        record.output_file = meta.output_file.clone().map(PathBuf::from);
                    }
                }
                if let Some(file) = extract_output_file(text) {
                    record.output_file.get_or_insert(PathBuf::from(file));
                }
                record.status = SubAgentStatus::Dispatched;
                record.dispatched_at.get_or_insert_with(Instant::now);
                (record.message_id, record.display_label())
            };
            if let Some(team) = team {
                s.team_name.get_or_insert(team);
            }

            let note = if auto_backgrounded {
                "Auto-backgrounded, waiting for results…"
            } else {
                "Spawned, waiting for results…"
            };
            if let Some(message_id) = message_id {
                let text = format!("🤖 {} — {note}", html::escape_html(&label));
                let _ = self.sink.edit_message(self.chat_id, message_id, &text).await;
            }
            self.maybe_start_mailbox(&mut s);
            return;
        }

        let status = if is_error {
            SubAgentStatus::Failed
        } else {
            SubAgentStatus::Completed
        };
        self.complete_locked(&mut s, tool_use_id, status, text).await;
    }

    /// Notification XML from a later user message.
    pub async fn handle_user_text(&self, text: &str) {
        if !text.contains("<background_agent_notification>") {
            return;
        }
        for notification in parse_notifications(text) {
            let mut s = self.state.lock().await;
            let Some(id) = self.match_record(&s, &notification) else {
                debug!(agent = ?notification.agent_name, "notification matched no tracked sub-agent");
                continue;
            };
            let status = match notification.status.as_deref() {
                Some("failed") | Some("error") => SubAgentStatus::Failed,
                _ => SubAgentStatus::Completed,
            };
            let body = notification.result.unwrap_or_default();
            self.complete_locked(&mut s, &id, status, &body).await;
        }
    }

    /// Dispatched agents still waiting.
    pub async fn dispatched_count(&self) -> usize {
        let s = self.state.lock().await;
        s.records
            .values()
            .filter(|r| !r.is_terminal())
            .count()
    }

    pub async fn is_tracking(&self, tool_use_id: &str) -> bool {
        self.state.lock().await.records.contains_key(tool_use_id)
    }

    /// Clear every record, timer and the mailbox watcher.
    pub async fn reset(&self) {
        let mut s = self.state.lock().await;
        s.generation += 1;
        for record in s.records.values_mut() {
            if let Some(refresh) = record.refresh.take() {
                refresh.abort();
            }
        }
        if let Some(debounce) = s.debounce.take() {
            debounce.abort();
        }
        if let Some(mailbox) = s.mailbox.take() {
            mailbox.abort();
        }
        s.records.clear();
        s.by_block.clear();
        s.team_name = None;
        s.all_reported_fired = false;
    }

    /// Guarded terminal transition + final message edit.
    async fn complete_locked(
        &self,
        s: &mut TrackerState,
        tool_use_id: &str,
        status: SubAgentStatus,
        body: &str,
    ) {
        let Some(record) = s.records.get_mut(tool_use_id) else {
            return;
        };
        if record.is_terminal() {
            return;
        }
        record.status = status;
        if let Some(refresh) = record.refresh.take() {
            refresh.abort();
        }

        let (message_id, label) = (record.message_id, record.display_label());
        let header = match status {
            SubAgentStatus::Failed => format!("❌ {} — failed", html::escape_html(&label)),
            _ => format!("✅ {} — completed", html::escape_html(&label)),
        };
        let mut text = header;
        let body = body.trim();
        if !body.is_empty() {
            text.push('\n');
            text.push_str(&html::expandable_quote(&html::escape_html(&truncate_chars(
                body, RESULT_MAX,
            ))));
        }

        if let Some(message_id) = message_id {
            let _ = self.sink.edit_message(self.chat_id, message_id, &text).await;
        }

        self.maybe_fire_all_reported(s);
    }

    /// Debounced, exactly-once all-reported callback.
    fn maybe_fire_all_reported(&self, s: &mut TrackerState) {
        if s.all_reported_fired || s.records.is_empty() {
            return;
        }
        if s.records.values().any(|r| !r.is_terminal()) {
            return;
        }
        if let Some(debounce) = s.debounce.take() {
            debounce.abort();
        }
        let this = self.clone();
        let generation = s.generation;
        s.debounce = Some(tokio::spawn(async move {
            tokio::time::sleep(ALL_REPORTED_DEBOUNCE).await;
            let mut s = this.state.lock().await;
            if s.generation != generation || s.all_reported_fired {
                return;
            }
            if s.records.values().any(|r| !r.is_terminal()) {
                return;
            }
            s.all_reported_fired = true;
            let callback = s.on_all_reported.clone();
            drop(s);
            if let Some(callback) = callback {
                callback();
            }
        }));
    }

    /// Poll for mailbox files once agents are dispatched and a team is
    /// known (or explicit output files were advertised).
    fn maybe_start_mailbox(&self, s: &mut TrackerState) {
        if s.mailbox.is_some() {
            return;
        }
        let watchable = s.records.values().any(|r| {
            r.status == SubAgentStatus::Dispatched
                && (r.output_file.is_some() || (r.cli_name.is_some() && s.team_name.is_some()))
        });
        if !watchable {
            return;
        }

        let this = self.clone();
        let generation = s.generation;
        let poll = self.opts.mailbox_poll;
        let root = self.opts.mailbox_root.clone();
        s.mailbox = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(poll).await;
                let due: Vec<(String, PathBuf)> = {
                    let s = this.state.lock().await;
                    if s.generation != generation {
                        return;
                    }
                    let team = s.team_name.clone();
                    s.records
                        .values()
                        .filter(|r| r.status == SubAgentStatus::Dispatched)
                        .filter_map(|r| {
                            let path = r.output_file.clone().or_else(|| {
                                match (&root, &team, &r.cli_name) {
                                    (Some(root), Some(team), Some(name)) => {
                                        Some(root.join(team).join(format!("{name}.md")))
                                    }
                                    _ => None,
                                }
                            })?;
                            Some((r.tool_use_id.clone(), path))
                        })
                        .collect()
                };

                for (tool_use_id, path) in due {
                    let Ok(body) = std::fs::read_to_string(&path) else {
                        continue;
                    };
                    debug!(path = %path.display(), "mailbox file appeared, reconciling");
                    let mut s = this.state.lock().await;
                    this.complete_locked(&mut s, &tool_use_id, SubAgentStatus::Completed, &body)
                        .await;
                }
            }
        }));
    }

    fn match_record(&self, s: &TrackerState, n: &Notification) -> Option<String> {
        // 1. Exact parent tool-use id.
        if let Some(parent) = &n.parent_tool_use_id {
            if s.records.contains_key(parent) {
                return Some(parent.clone());
            }
        }
        // 2. CLI-side agent name.
        if let Some(name) = &n.agent_name {
            if let Some(r) = s
                .records
                .values()
                .find(|r| r.cli_name.as_deref() == Some(name.as_str()))
            {
                return Some(r.tool_use_id.clone());
            }
            // 3. Fuzzy label match.
            let lower = name.to_lowercase();
            if let Some(r) = s.records.values().find(|r| {
                r.label
                    .as_deref()
                    .is_some_and(|l| l.to_lowercase().contains(&lower))
            }) {
                return Some(r.tool_use_id.clone());
            }
        }
        None
    }
}

/// Label priority: name > description > subagent_type > team_name >
/// first prompt line. Structural parse first, tolerant extraction on the
/// incomplete prefix otherwise.
fn extract_label(input_json: &str) -> Option<String> {
    let parsed: Option<serde_json::Value> = serde_json::from_str(input_json).ok();

    for key in ["name", "description", "subagent_type", "team_name"] {
        let structural = parsed
            .as_ref()
            .and_then(|v| v.get(key))
            .and_then(|v| v.as_str())
            .map(String::from);
        if let Some(value) = structural.or_else(|| partial::extract_string_field(input_json, key)) {
            let value = value.trim();
            if !value.is_empty() {
                return Some(truncate_chars(value, LABEL_MAX));
            }
        }
    }

    let prompt = parsed
        .as_ref()
        .and_then(|v| v.get("prompt"))
        .and_then(|v| v.as_str())
        .map(String::from)
        .or_else(|| partial::extract_string_field(input_json, "prompt"))?;
    let first_line = prompt.lines().next()?.trim();
    if first_line.is_empty() {
        return None;
    }
    Some(truncate_chars(first_line, LABEL_MAX))
}

fn extract_team(input_json: &str) -> Option<String> {
    let structural: Option<String> = serde_json::from_str::<serde_json::Value>(input_json)
        .ok()
        .and_then(|v| v.get("team_name").and_then(|t| t.as_str()).map(String::from));
    structural.or_else(|| partial::extract_string_field(input_json, "team_name"))
}

struct SpawnConfirmation {
    agent_name: Option<String>,
    team_name: Option<String>,
}

/// Spawn-confirmation heuristic: `agent_id:<name>@<team>` or the literal
/// "spawned successfully". Matching keeps the record in `Dispatched`.
fn spawn_confirmation(text: &str) -> Option<SpawnConfirmation> {
    if let Some(at) = text.find("agent_id:") {
        let rest = text[at + "agent_id:".len()..].trim_start();
        let token: String = rest
            .chars()
            .take_while(|c| !c.is_whitespace() && *c != '"' && *c != ',' && *c != '}')
            .collect();
        if let Some((name, team)) = token.split_once('@') {
            return Some(SpawnConfirmation {
                agent_name: Some(name.to_string()),
                team_name: Some(team.to_string()),
            });
        }
    }
    if text.contains("spawned successfully") {
        return Some(SpawnConfirmation {
            agent_name: None,
            team_name: None,
        });
    }
    None
}

fn extract_output_file(text: &str) -> Option<String> {
    partial::extract_string_field(text, "outputFile")
}

#[derive(Debug, Default, PartialEq)]
struct Notification {
    parent_tool_use_id: Option<String>,
    status: Option<String>,
    agent_name: Option<String>,
    result: Option<String>,
}

/// Pull every `<background_agent_notification>` block out of a user
/// message and parse its child tags.
fn parse_notifications(text: &str) -> Vec<Notification> {
    const OPEN: &str = "<background_agent_notification>";
    const CLOSE: &str = "</background_agent_notification>";

    let mut out = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find(OPEN) {
        let after = &rest[start + OPEN.len()..];
        let Some(end) = after.find(CLOSE) else {
            break;
        };
        let block = &after[..end];
        out.push(Notification {
            parent_tool_use_id: xml_tag(block, "parent_tool_use_id"),
            status: xml_tag(block, "status"),
            agent_name: xml_tag(block, "agent_name"),
            result: xml_tag(block, "result"),
        });
        rest = &after[end + CLOSE.len()..];
    }
    out
}

fn xml_tag(block: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = block.find(&open)? + open.len();
    let end = block[start..].find(&close)? + start;
    Some(block[start..end].trim().to_string())
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{cut}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::mock::{Call, MockSink};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tracker(sink: Arc<MockSink>) -> SubAgentTracker {
        SubAgentTracker::new(
            sink,
            7,
            TrackerOptions {
                refresh_interval: Duration::from_millis(40),
                mailbox_poll: Duration::from_millis(40),
                mailbox_root: None,
            },
        )
    }

    #[test]
    fn dispatch_tool_detection() {
        assert!(is_subagent_tool("Task"));
        assert!(is_subagent_tool("dispatch_agent"));
        assert!(is_subagent_tool("AgentSpawner"));
        assert!(is_subagent_tool("Dispatch"));
        assert!(!is_subagent_tool("Bash"));
        assert!(!is_subagent_tool("Read"));
    }

    #[test]
    fn label_priority_chain() {
        assert_eq!(
            extract_label(r#"{"name":"scout","description":"look around"}"#),
            Some("scout".to_string())
        );
        assert_eq!(
            extract_label(r#"{"description":"look around","prompt":"Go"}"#),
            Some("look around".to_string())
        );
        assert_eq!(
            extract_label(r#"{"subagent_type":"researcher"}"#),
            Some("researcher".to_string())
        );
        assert_eq!(
            extract_label(r#"{"prompt":"First line here\nsecond line"}"#),
            Some("First line here".to_string())
        );
    }

    #[test]
    fn label_from_incomplete_json() {
        // Closing quote arrived, object did not.
        assert_eq!(
            extract_label(r#"{"description":"audit the parser","prompt":"Look at th"#),
            Some("audit the parser".to_string())
        );
        // Value itself is still streaming.
        assert_eq!(extract_label(r#"{"description":"audit the par"#), None);
    }

    #[test]
    fn long_labels_are_capped() {
        let input = format!(r#"{{"description":"{}"}}"#, "d".repeat(200));
        assert_eq!(extract_label(&input).unwrap().chars().count(), LABEL_MAX);
    }

    #[test]
    fn spawn_confirmation_patterns() {
        let parsed = spawn_confirmation("ok agent_id:scout@alpha-team rest").unwrap();
        assert_eq!(parsed.agent_name.as_deref(), Some("scout"));
        assert_eq!(parsed.team_name.as_deref(), Some("alpha-team"));

        assert!(spawn_confirmation("Agent spawned successfully").is_some());
        assert!(spawn_confirmation("plain result text").is_none());
    }

    #[test]
    fn notification_blocks_parse() {
        let text = r#"before <background_agent_notification>
<parent_tool_use_id>tu_1</parent_tool_use_id>
<status>completed</status>
<agent_name>scout</agent_name>
<result>All clear.</result>
</background_agent_notification> after"#;
        let parsed = parse_notifications(text);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].parent_tool_use_id.as_deref(), Some("tu_1"));
        assert_eq!(parsed[0].status.as_deref(), Some("completed"));
        assert_eq!(parsed[0].agent_name.as_deref(), Some("scout"));
        assert_eq!(parsed[0].result.as_deref(), Some("All clear."));
    }

    #[tokio::test]
    async fn lifecycle_start_dispatch_complete() {
        let sink = Arc::new(MockSink::new());
        let t = tracker(Arc::clone(&sink));

        assert!(t.handle_block_start(2, "tu_1", "Task").await);
        assert!(t.is_tracking("tu_1").await);
        assert_eq!(sink.send_count(), 1);
        let id = sink.sent_ids()[0];
        assert!(sink.last_text_of(id).unwrap().contains("Starting sub-agent"));

        t.handle_input_delta(2, r#"{"description":"scan the repo","prompt":"go"#)
            .await;
        assert!(sink.last_text_of(id).unwrap().contains("scan the repo"));

        t.handle_block_stop(2).await;
        assert_eq!(t.dispatched_count().await, 1);

        t.handle_tool_result("tu_1", "Scan finished: nothing unusual.", None, false)
            .await;
        assert_eq!(t.dispatched_count().await, 0);
        let final_text = sink.last_text_of(id).unwrap();
        assert!(final_text.contains("✅"));
        assert!(final_text.contains("scan the repo"));
        assert!(final_text.contains("<blockquote expandable>Scan finished: nothing unusual.</blockquote>"));
    }

    #[tokio::test]
    async fn non_subagent_tools_are_ignored() {
        let sink = Arc::new(MockSink::new());
        let t = tracker(Arc::clone(&sink));
        assert!(!t.handle_block_start(0, "tu_9", "Bash").await);
        assert!(sink.calls().is_empty());
    }

    #[tokio::test]
    async fn spawn_confirmation_keeps_record_dispatched() {
        let sink = Arc::new(MockSink::new());
        let t = tracker(Arc::clone(&sink));

        t.handle_block_start(0, "tu_1", "Task").await;
        t.handle_input_delta(0, r#"{"name":"scout"}"#).await;
        t.handle_block_stop(0).await;
        t.handle_tool_result("tu_1", "agent_id:scout@team-a spawned", None, false)
            .await;

        assert_eq!(t.dispatched_count().await, 1, "still waiting for results");
        let id = sink.sent_ids()[0];
        assert!(sink.last_text_of(id).unwrap().contains("waiting for results"));
    }

    #[tokio::test]
    async fn duplicate_notification_is_a_noop() {
        let sink = Arc::new(MockSink::new());
        let t = tracker(Arc::clone(&sink));

        t.handle_block_start(0, "tu_1", "Task").await;
        t.handle_block_stop(0).await;

        let notification = "<background_agent_notification><parent_tool_use_id>tu_1</parent_tool_use_id><status>completed</status><result>done</result></background_agent_notification>";
        t.handle_user_text(notification).await;
        let calls_after_first = sink.calls().len();

        t.handle_user_text(notification).await;
        assert_eq!(
            sink.calls().len(),
            calls_after_first,
            "terminal transition must be idempotent"
        );
    }

    #[tokio::test]
    async fn notification_matches_by_agent_name() {
        let sink = Arc::new(MockSink::new());
        let t = tracker(Arc::clone(&sink));

        t.handle_block_start(0, "tu_1", "Task").await;
        t.handle_block_stop(0).await;
        t.handle_tool_result("tu_1", "agent_id:scout@team-a", None, false)
            .await;

        t.handle_user_text(
            "<background_agent_notification><agent_name>scout</agent_name><status>failed</status><result>crashed</result></background_agent_notification>",
        )
        .await;

        let id = sink.sent_ids()[0];
        let text = sink.last_text_of(id).unwrap();
        assert!(text.contains("❌"));
        assert!(text.contains("crashed"));
    }

    #[tokio::test]
    async fn all_reported_fires_exactly_once() {
        let sink = Arc::new(MockSink::new());
        let t = tracker(Arc::clone(&sink));
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);
        t.set_on_all_reported(Arc::new(move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        }))
        .await;

        t.handle_block_start(0, "tu_1", "Task").await;
        t.handle_block_start(1, "tu_2", "Task").await;
        t.handle_block_stop(0).await;
        t.handle_block_stop(1).await;

        t.handle_tool_result("tu_1", "first done", None, false).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0, "one agent still out");

        t.handle_tool_result("tu_2", "second done", None, false).await;
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // A stray duplicate must not re-fire.
        t.handle_user_text(
            "<background_agent_notification><parent_tool_use_id>tu_2</parent_tool_use_id><status>completed</status></background_agent_notification>",
        )
        .await;
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn elapsed_refresh_rewrites_working_line() {
        let sink = Arc::new(MockSink::new());
        let t = tracker(Arc::clone(&sink));

        t.handle_block_start(0, "tu_1", "Task").await;
        t.handle_input_delta(0, r#"{"name":"scout"}"#).await;
        t.handle_block_stop(0).await;

        tokio::time::sleep(Duration::from_millis(120)).await;
        let id = sink.sent_ids()[0];
        let text = sink.last_text_of(id).unwrap();
        assert!(text.contains("Working…"), "got: {text}");

        t.reset().await;
    }

    #[tokio::test]
    async fn mailbox_file_reconciles_dispatched_agent() {
        let dir = tempfile::TempDir::new().unwrap();
        let out_file = dir.path().join("scout.md");

        let sink = Arc::new(MockSink::new());
        let t = tracker(Arc::clone(&sink));

        t.handle_block_start(0, "tu_1", "Task").await;
        t.handle_block_stop(0).await;
        t.handle_tool_result(
            "tu_1",
            &format!(
                "agent_id:scout@team-a {{\"outputFile\":\"{}\"}}",
                out_file.display()
            ),
            None,
            false,
        )
        .await;
        assert_eq!(t.dispatched_count().await, 1);

        std::fs::write(&out_file, "Mailbox report body").unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(t.dispatched_count().await, 0);
        let id = sink.sent_ids()[0];
        let text = sink.last_text_of(id).unwrap();
        assert!(text.contains("Mailbox report body"));

        t.reset().await;
    }

    #[tokio::test]
    async fn reset_clears_records_and_timers() {
        let sink = Arc::new(MockSink::new());
        let t = tracker(Arc::clone(&sink));

        t.handle_block_start(0, "tu_1", "Task").await;
        t.handle_block_stop(0).await;
        t.reset().await;

        assert!(!t.is_tracking("tu_1").await);
        assert_eq!(t.dispatched_count().await, 0);
    }
}
