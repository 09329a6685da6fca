//! Per-agent pipeline: chat input → batcher → CLI supervisor →
//! accumulator / sub-agent tracker → chat output, plus the pending
//! permission map and the typing indicator bracket.
//!
//! One `AgentBridge` per configured agent. The event loop task owns the
//! per-process renderers, so stream routing never contends with command
//! handling on the bridge state lock.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use tgcc_agent::process::{CliProcess, Phase, ProcessEvent, ResumeMode, SpawnOptions};
use tgcc_agent::registry::{EntryKey, ProcessRegistry};
use tgcc_core::config::{AgentConfig, GlobalConfig};
use tgcc_core::types::{AgentId, ClientKey, PermissionMode, TurnUsage};
use tgcc_protocol::events::{BlockDelta, BlockStart, CliEvent, StreamEvent};
use tgcc_protocol::outbound::{ContentBlock, Outbound};
use tgcc_sessions::SessionInfo;
use tgcc_telegram::accum::{AccumOptions, StreamAccumulator};
use tgcc_telegram::sink::ChatSink;
use tgcc_telegram::subagent::{SubAgentTracker, TrackerOptions};
use tgcc_telegram::typing::TypingHandle;

use crate::supervisor::SupervisorHub;

/// Wait for the child to exit during graceful shutdown.
const SHUTDOWN_EXIT_WAIT: Duration = Duration::from_secs(3);
/// Prompt injected once every sub-agent has reported.
const SYNTHESIS_PROMPT: &str =
    "All background agents have reported their results. Review them and give a combined summary.";

/// Per-subscriber renderer pair stored in the registry.
pub struct RendererSlot {
    pub accumulator: StreamAccumulator,
    pub tracker: SubAgentTracker,
}

pub type Registry = ProcessRegistry<RendererSlot>;

struct BridgeState {
    process: Option<CliProcess>,
    entry_key: Option<EntryKey>,
    accumulator: Option<StreamAccumulator>,
    tracker: Option<SubAgentTracker>,
    pending_permissions: HashMap<String, (String, Value)>,
    typing: Option<TypingHandle>,
    pending_resume: Option<ResumeMode>,
    event_task: Option<JoinHandle<()>>,
    /// Session-level overrides set by /model, /repo, /permissions.
    model: Option<String>,
    repo: Option<String>,
    permission_mode: Option<PermissionMode>,
    last_chat: Option<(i64, i64)>,
}

pub struct AgentBridge {
    agent_id: AgentId,
    global: GlobalConfig,
    repos: HashMap<String, PathBuf>,
    config: std::sync::Mutex<AgentConfig>,
    sink: Arc<dyn ChatSink>,
    registry: Arc<Registry>,
    hub: Arc<SupervisorHub>,
    state: Mutex<BridgeState>,
}

impl AgentBridge {
    pub fn new(
        config: AgentConfig,
        global: GlobalConfig,
        repos: HashMap<String, PathBuf>,
        sink: Arc<dyn ChatSink>,
        registry: Arc<Registry>,
        hub: Arc<SupervisorHub>,
    ) -> Arc<Self> {
        Arc::new(Self {
            agent_id: AgentId::new(&config.id),
            global,
            repos,
            config: std::sync::Mutex::new(config),
            sink,
            registry,
            hub,
            state: Mutex::new(BridgeState {
                process: None,
                entry_key: None,
                accumulator: None,
                tracker: None,
                pending_permissions: HashMap::new(),
                typing: None,
                pending_resume: None,
                event_task: None,
                model: None,
                repo: None,
                permission_mode: None,
                last_chat: None,
            }),
        })
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn global(&self) -> &GlobalConfig {
        &self.global
    }

    pub fn sink(&self) -> Arc<dyn ChatSink> {
        Arc::clone(&self.sink)
    }

    pub fn config(&self) -> AgentConfig {
        self.config.lock().unwrap().clone()
    }

    /// Hot-reload hook: swap the per-agent config; takes effect on the
    /// next spawn.
    pub fn apply_config(&self, config: AgentConfig) {
        *self.config.lock().unwrap() = config;
    }

    pub fn is_user_allowed(&self, user_id: i64) -> bool {
        self.config.lock().unwrap().allowed_users.contains(&user_id)
    }

    /// Deliver one (possibly batched) text input to the CLI.
    pub async fn deliver_text(self: &Arc<Self>, chat_id: i64, user_id: i64, text: String) {
        self.deliver(chat_id, user_id, Outbound::text(text)).await;
    }

    /// Deliver a content-block message (media turn).
    pub async fn deliver_blocks(
        self: &Arc<Self>,
        chat_id: i64,
        user_id: i64,
        blocks: Vec<ContentBlock>,
    ) {
        self.deliver(chat_id, user_id, Outbound::blocks(blocks)).await;
    }

    /// Deliver a pre-built user-message (document turns).
    pub async fn deliver_outbound(self: &Arc<Self>, chat_id: i64, user_id: i64, msg: Outbound) {
        self.deliver(chat_id, user_id, msg).await;
    }

    /// Admin/supervisor path: inject text into the current conversation.
    pub async fn inject_text(self: &Arc<Self>, text: &str) {
        let (chat_id, user_id) = self.target_chat().await;
        self.deliver(chat_id, user_id, Outbound::text(text)).await;
    }

    async fn deliver(self: &Arc<Self>, chat_id: i64, user_id: i64, msg: Outbound) {
        let process = self.ensure_process(chat_id, user_id).await;

        {
            let mut st = self.state.lock().await;
            if st.typing.is_none() {
                st.typing = Some(TypingHandle::start(Arc::clone(&self.sink), chat_id));
            }
        }
        process.send(msg).await;
    }

    /// Chat to talk to when a request does not originate from Telegram:
    /// the last active chat, else the first allowed user's DM.
    async fn target_chat(&self) -> (i64, i64) {
        if let Some(pair) = self.state.lock().await.last_chat {
            return pair;
        }
        let user = self
            .config
            .lock()
            .unwrap()
            .allowed_users
            .first()
            .copied()
            .unwrap_or(0);
        (user, user)
    }

    /// Working directory for a user: session override > per-user config >
    /// agent default, resolved through the named-repo registry.
    pub async fn resolve_workdir(&self, user_id: i64) -> Option<PathBuf> {
        let override_repo = self.state.lock().await.repo.clone();
        let config = self.config.lock().unwrap().clone();
        let reference = override_repo.or_else(|| config.repo_for(user_id).map(String::from))?;
        if reference.starts_with('/') {
            return Some(PathBuf::from(reference));
        }
        self.repos.get(&reference).cloned()
    }

    fn ensure_process<'a>(
        self: &'a Arc<Self>,
        chat_id: i64,
        user_id: i64,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = CliProcess> + Send + 'a>> {
        Box::pin(async move {
        let mut st = self.state.lock().await;
        st.last_chat = Some((chat_id, user_id));
        if let Some(process) = &st.process {
            return process.clone();
        }

        let config = self.config();
        let workdir = match self.resolve_workdir_locked(&st, user_id, &config) {
            Some(dir) => dir,
            None => {
                let fallback = std::env::var("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("/tmp"));
                let _ = self
                    .sink
                    .send_message(
                        chat_id,
                        "⚠️ No working directory configured — using the home directory. Set one with /repo.",
                    )
                    .await;
                fallback
            }
        };

        let mut opts = SpawnOptions::new(self.global.binary.clone(), workdir.clone());
        opts.model = st.model.clone().or_else(|| config.model_for(user_id).map(String::from));
        opts.permission_mode = st
            .permission_mode
            .unwrap_or_else(|| config.permission_mode_for(user_id));
        opts.max_turns = config.max_turns;
        opts.idle_timeout = Duration::from_secs(config.idle_timeout_secs);
        opts.hang_timeout = Duration::from_secs(config.hang_timeout_secs);
        opts.resume = st.pending_resume.take();
        opts.mcp_config = config.mcp_config.clone();
        opts.env = vec![
            ("TGCC_AGENT_ID".to_string(), self.agent_id.to_string()),
            ("TGCC_USER_ID".to_string(), user_id.to_string()),
            (
                "TGCC_TOOL_SOCKET".to_string(),
                crate::toolsock::socket_path(&self.global.socket_dir, self.agent_id.as_str(), user_id)
                    .to_string_lossy()
                    .to_string(),
            ),
        ];

        let model = opts.model.clone();
        let process = CliProcess::new(opts);
        let accumulator = StreamAccumulator::new(
            Arc::clone(&self.sink),
            chat_id,
            AccumOptions::default(),
        );
        let tracker = SubAgentTracker::new(
            Arc::clone(&self.sink),
            chat_id,
            TrackerOptions {
                mailbox_root: Some(self.global.claude_home.join("agents")),
                ..Default::default()
            },
        );

        // When every sub-agent has reported, prompt the assistant to
        // synthesize — through a weak ref so the tracker does not keep
        // the bridge alive.
        let weak = Arc::downgrade(self);
        tracker
            .set_on_all_reported(Arc::new(move || {
                let Some(bridge) = weak.upgrade() else {
                    return;
                };
                tokio::spawn(async move {
                    bridge.inject_text(SYNTHESIS_PROMPT).await;
                });
            }))
            .await;

        let owner = ClientKey {
            agent_id: self.agent_id.clone(),
            user_id,
            chat_id,
        };
        let entry_key = Registry::pending_key(&workdir);
        self.registry.register(
            entry_key.clone(),
            model,
            process.clone(),
            owner,
            RendererSlot {
                accumulator: accumulator.clone(),
                tracker: tracker.clone(),
            },
        );

        let rx = process.subscribe();
        let task = tokio::spawn(Self::event_loop(
            Arc::clone(self),
            process.clone(),
            accumulator.clone(),
            tracker.clone(),
            chat_id,
            rx,
        ));

        st.process = Some(process.clone());
        st.entry_key = Some(entry_key);
        st.accumulator = Some(accumulator);
        st.tracker = Some(tracker);
        st.event_task = Some(task);
        info!(agent = %self.agent_id, chat = chat_id, "agent pipeline spawned");
        process
        })
    }

    fn resolve_workdir_locked(
        &self,
        st: &BridgeState,
        user_id: i64,
        config: &AgentConfig,
    ) -> Option<PathBuf> {
        let reference = st
            .repo
            .clone()
            .or_else(|| config.repo_for(user_id).map(String::from))?;
        if reference.starts_with('/') {
            return Some(PathBuf::from(reference));
        }
        self.repos.get(&reference).cloned()
    }

    /// Drive one process's event stream until exit.
    async fn event_loop(
        bridge: Arc<Self>,
        process: CliProcess,
        accumulator: StreamAccumulator,
        tracker: SubAgentTracker,
        chat_id: i64,
        mut rx: tokio::sync::broadcast::Receiver<ProcessEvent>,
    ) {
        // Block indices owned by the tracker this turn.
        let mut subagent_blocks: HashSet<usize> = HashSet::new();

        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event loop lagged behind the CLI stream");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };
            match event {
                ProcessEvent::Cli(cli) => {
                    bridge
                        .on_cli_event(
                            &process,
                            &accumulator,
                            &tracker,
                            chat_id,
                            &mut subagent_blocks,
                            cli,
                        )
                        .await;
                }
                ProcessEvent::Hang => {
                    let _ = bridge
                        .sink
                        .send_message(chat_id, "⚠️ The assistant appears hung — restarting it.")
                        .await;
                }
                ProcessEvent::Takeover => {
                    let session = process.session_id();
                    // Detach without killing so the session can be driven
                    // from wherever it roamed to.
                    if let Some(key) = bridge.state.lock().await.entry_key.clone() {
                        bridge.registry.remove(&key);
                    }
                    bridge.hub.publish(
                        bridge.agent_id.as_str(),
                        session.as_deref(),
                        "session_takeover",
                        json!({}),
                    );
                    let _ = bridge
                        .sink
                        .send_message(
                            chat_id,
                            "⚠️ The session is now being driven from elsewhere — detaching.",
                        )
                        .await;
                }
                ProcessEvent::Exit { code } => {
                    bridge.on_exit(&process, &accumulator, &tracker, code).await;
                    break;
                }
                ProcessEvent::Error(message) => {
                    let _ = bridge
                        .sink
                        .send_message(chat_id, &format!("⚠️ {}", tgcc_telegram::html::escape_html(&message)))
                        .await;
                }
            }
        }
    }

    async fn on_cli_event(
        self: &Arc<Self>,
        process: &CliProcess,
        accumulator: &StreamAccumulator,
        tracker: &SubAgentTracker,
        chat_id: i64,
        subagent_blocks: &mut HashSet<usize>,
        event: CliEvent,
    ) {
        match event {
            CliEvent::Init(init) => {
                let mut st = self.state.lock().await;
                if let Some(old_key) = st.entry_key.clone() {
                    self.registry.rekey(&old_key, &init.session_id);
                    st.entry_key = Some((old_key.0, init.session_id.clone()));
                }
                drop(st);
                self.hub.publish(
                    self.agent_id.as_str(),
                    Some(&init.session_id),
                    "session_id",
                    json!({"model": init.model, "cwd": init.cwd}),
                );
            }
            CliEvent::Stream(stream) => match &stream {
                StreamEvent::MessageStart => {
                    subagent_blocks.clear();
                    accumulator.handle(&stream).await;
                }
                StreamEvent::ContentBlockStart {
                    index,
                    block: BlockStart::ToolUse { id, name },
                } => {
                    if tracker.handle_block_start(*index, id, name).await {
                        subagent_blocks.insert(*index);
                    } else {
                        accumulator.handle(&stream).await;
                    }
                }
                StreamEvent::ContentBlockDelta {
                    index,
                    delta: BlockDelta::InputJson(fragment),
                } => {
                    if subagent_blocks.contains(index) {
                        tracker.handle_input_delta(*index, fragment).await;
                    }
                }
                StreamEvent::ContentBlockStop { index } if subagent_blocks.contains(index) => {
                    tracker.handle_block_stop(*index).await;
                }
                _ => accumulator.handle(&stream).await,
            },
            CliEvent::Assistant(assistant) => {
                if let Some(usage) = assistant.usage {
                    accumulator
                        .set_usage(usage.into_turn_usage(None, assistant.model))
                        .await;
                }
            }
            CliEvent::User(user) => {
                for result in &user.tool_results {
                    if tracker.is_tracking(&result.tool_use_id).await {
                        tracker
                            .handle_tool_result(
                                &result.tool_use_id,
                                &result.text,
                                user.tool_use_result.as_ref(),
                                result.is_error,
                            )
                            .await;
                    }
                }
                if let Some(text) = &user.text {
                    tracker.handle_user_text(text).await;
                }
            }
            CliEvent::ToolResult(result) => {
                if tracker.is_tracking(&result.tool_use_id).await {
                    tracker
                        .handle_tool_result(&result.tool_use_id, &result.text, None, result.is_error)
                        .await;
                }
            }
            CliEvent::Result(result) => {
                if let Some(usage) = result.usage.clone() {
                    accumulator
                        .set_usage(usage.into_turn_usage(result.total_cost_usd, None))
                        .await;
                } else if result.total_cost_usd.is_some() {
                    accumulator
                        .set_usage(TurnUsage {
                            cost_usd: result.total_cost_usd,
                            ..Default::default()
                        })
                        .await;
                }
                accumulator.finalize().await;

                {
                    let mut st = self.state.lock().await;
                    if let Some(typing) = st.typing.take() {
                        typing.stop();
                    }
                }
                if tracker.dispatched_count().await == 0 {
                    tracker.reset().await;
                }
                subagent_blocks.clear();

                self.hub.publish(
                    self.agent_id.as_str(),
                    process.session_id().as_deref(),
                    "result",
                    json!({"subtype": result.subtype, "cost_usd": result.total_cost_usd}),
                );
            }
            CliEvent::ApiError(error) => {
                let text = if error.is_overloaded() {
                    format!(
                        "⚠️ API overloaded, retrying… ({}/{})",
                        error.retry_attempt.unwrap_or(0),
                        error.max_retries.unwrap_or(0)
                    )
                } else {
                    format!(
                        "⚠️ API error: {}",
                        tgcc_telegram::html::escape_html(
                            error.message.as_deref().unwrap_or("unknown")
                        )
                    )
                };
                let _ = self.sink.send_message(chat_id, &text).await;
            }
            CliEvent::CompactBoundary(boundary) => {
                let tokens = boundary
                    .pre_tokens
                    .map(|t| format!(" ({t} tokens before)"))
                    .unwrap_or_default();
                let _ = self
                    .sink
                    .send_message(chat_id, &format!("🗜 Context compacted{tokens}"))
                    .await;
            }
            CliEvent::PermissionRequest(request) => {
                let mut st = self.state.lock().await;
                st.pending_permissions.insert(
                    request.request_id.clone(),
                    (request.tool_name.clone(), request.input.clone()),
                );
                drop(st);

                let input = serde_json::to_string_pretty(&request.input).unwrap_or_default();
                let input = tgcc_telegram::html::escape_html(&truncate(&input, 800));
                let text = format!(
                    "🔐 The assistant wants to use <b>{}</b>:\n<pre>{input}</pre>",
                    tgcc_telegram::html::escape_html(&request.tool_name)
                );
                let buttons = vec![
                    (
                        "✅ Allow".to_string(),
                        format!("perm_allow:{}", request.request_id),
                    ),
                    (
                        "❌ Deny".to_string(),
                        format!("perm_deny:{}", request.request_id),
                    ),
                    (
                        "✅ Allow all".to_string(),
                        format!("perm_allow_all:{}", self.agent_id),
                    ),
                ];
                let _ = self.sink.send_with_buttons(chat_id, &text, &buttons).await;
            }
            // Task lifecycle feeds the supervisor's idle logic inside the
            // process; nothing to render.
            CliEvent::TaskStarted(_) | CliEvent::TaskProgress(_) | CliEvent::TaskCompleted(_) => {}
            CliEvent::ControlResponse(_) => {}
        }
    }

    async fn on_exit(
        &self,
        process: &CliProcess,
        accumulator: &StreamAccumulator,
        tracker: &SubAgentTracker,
        code: Option<i32>,
    ) {
        accumulator.finalize().await;
        tracker.reset().await;

        let session = process.session_id();
        let entry_key = {
            let mut st = self.state.lock().await;
            st.pending_permissions.clear();
            if let Some(typing) = st.typing.take() {
                typing.stop();
            }
            st.process = None;
            st.accumulator = None;
            st.tracker = None;
            st.event_task = None;
            st.entry_key.take()
        };
        if let Some(key) = entry_key {
            // The child already exited; drop the entry without another kill.
            self.registry.remove(&key);
        }

        self.hub.publish(
            self.agent_id.as_str(),
            session.as_deref(),
            "process_exit",
            json!({"code": code}),
        );
        info!(agent = %self.agent_id, code = ?code, "agent pipeline closed");
    }

    // ------------------------------------------------------------------
    // Command surface
    // ------------------------------------------------------------------

    pub async fn process_status(&self) -> Option<tgcc_agent::process::ProcessStatus> {
        Some(self.state.lock().await.process.as_ref()?.status())
    }

    pub async fn status_json(&self) -> Value {
        let st = self.state.lock().await;
        match &st.process {
            Some(process) => {
                let status = process.status();
                json!({
                    "agent": self.agent_id.as_str(),
                    "state": format!("{:?}", status.phase).to_lowercase(),
                    "session": status.session_id,
                    "cost_usd": status.cost_usd,
                    "uptime_secs": status.uptime.map(|u| u.as_secs()),
                })
            }
            None => json!({"agent": self.agent_id.as_str(), "state": "idle"}),
        }
    }

    /// Current session-level model/repo overrides (config defaults when
    /// unset).
    pub async fn session_settings(&self) -> (Option<String>, Option<String>, Option<PermissionMode>) {
        let st = self.state.lock().await;
        (st.model.clone(), st.repo.clone(), st.permission_mode)
    }

    pub async fn pending_resume(&self) -> Option<ResumeMode> {
        self.state.lock().await.pending_resume.clone()
    }

    pub async fn set_pending_resume(&self, resume: Option<ResumeMode>) {
        self.state.lock().await.pending_resume = resume;
    }

    /// Kill the current process; the next message spawns fresh.
    pub async fn kill_process(&self) {
        let process = self.state.lock().await.process.clone();
        if let Some(process) = process {
            process.kill();
        }
    }

    /// `/new`: forget the session and start over on next message.
    pub async fn new_session(&self) {
        self.set_pending_resume(None).await;
        self.kill_process().await;
    }

    /// `/continue`: remember the live session id (or fall back to
    /// `--continue`) and respawn with it on the next message.
    pub async fn continue_session(&self) {
        let session = {
            let st = self.state.lock().await;
            st.process.as_ref().and_then(|p| p.session_id())
        };
        let resume = match session {
            Some(id) => ResumeMode::SessionId(id),
            None => ResumeMode::Continue,
        };
        self.set_pending_resume(Some(resume)).await;
        self.kill_process().await;
    }

    pub async fn set_model(&self, model: Option<String>) {
        self.state.lock().await.model = model;
        self.kill_process().await;
    }

    pub async fn set_repo(&self, repo: Option<String>) {
        self.state.lock().await.repo = repo;
        self.kill_process().await;
    }

    pub async fn set_permission_mode(&self, mode: Option<PermissionMode>) {
        self.state.lock().await.permission_mode = mode;
        self.kill_process().await;
    }

    pub async fn cancel(&self) {
        let process = self.state.lock().await.process.clone();
        if let Some(process) = process {
            process.cancel();
        }
    }

    /// `/compact [hint]` — forwarded verbatim to the CLI.
    pub async fn compact(self: &Arc<Self>, hint: Option<&str>) {
        let text = match hint {
            Some(hint) => format!("/compact {hint}"),
            None => "/compact".to_string(),
        };
        self.inject_text(&text).await;
    }

    pub async fn discover_sessions(&self, user_id: i64, limit: usize) -> Vec<SessionInfo> {
        let Some(workdir) = self.resolve_workdir(user_id).await else {
            return Vec::new();
        };
        tgcc_sessions::discover_sessions(&self.global.claude_home, &workdir, limit)
    }

    /// Answer one pending permission prompt.
    pub async fn answer_permission(&self, request_id: &str, allow: bool) -> bool {
        let (known, process) = {
            let mut st = self.state.lock().await;
            (
                st.pending_permissions.remove(request_id).is_some(),
                st.process.clone(),
            )
        };
        if !known {
            return false;
        }
        if let Some(process) = process {
            process.respond_to_permission(request_id, allow, None);
        }
        true
    }

    /// Allow every currently pending prompt.
    pub async fn answer_all_permissions(&self) -> usize {
        let (requests, process) = {
            let mut st = self.state.lock().await;
            let requests: Vec<String> = st.pending_permissions.drain().map(|(id, _)| id).collect();
            (requests, st.process.clone())
        };
        let count = requests.len();
        if let Some(process) = process {
            for request_id in requests {
                process.respond_to_permission(&request_id, true, None);
            }
        }
        count
    }

    /// Graceful shutdown: SIGTERM the child, wait for exit up to 3 s,
    /// finalize renderers and drop registry state.
    pub async fn shutdown(&self) {
        let (process, accumulator, tracker, typing, event_task) = {
            let mut st = self.state.lock().await;
            (
                st.process.clone(),
                st.accumulator.clone(),
                st.tracker.clone(),
                st.typing.take(),
                st.event_task.take(),
            )
        };
        if let Some(typing) = typing {
            typing.stop();
        }
        if let Some(process) = process {
            let mut rx = process.subscribe();
            process.kill();
            let waited = tokio::time::timeout(SHUTDOWN_EXIT_WAIT, async {
                loop {
                    match rx.recv().await {
                        Ok(ProcessEvent::Exit { .. }) | Err(_) => break,
                        _ => continue,
                    }
                }
            })
            .await;
            if waited.is_err() {
                warn!(agent = %self.agent_id, "CLI did not exit within shutdown grace");
            }
        }
        if let Some(accumulator) = accumulator {
            accumulator.finalize().await;
        }
        if let Some(tracker) = tracker {
            tracker.reset().await;
        }
        let entry_key = self.state.lock().await.entry_key.take();
        if let Some(key) = entry_key {
            self.registry.remove(&key);
        }
        if let Some(task) = event_task {
            task.abort();
        }
    }

    /// Human status line for /status.
    pub async fn status_text(&self, user_id: i64) -> String {
        let st = self.state.lock().await;
        let config = self.config.lock().unwrap().clone();
        let model = st
            .model
            .clone()
            .or_else(|| config.model_for(user_id).map(String::from))
            .unwrap_or_else(|| "default".to_string());
        let repo = st
            .repo
            .clone()
            .or_else(|| config.repo_for(user_id).map(String::from))
            .unwrap_or_else(|| "unset".to_string());

        match &st.process {
            Some(process) => {
                let status = process.status();
                let session = status
                    .session_id
                    .as_deref()
                    .map(|s| s.chars().take(8).collect::<String>())
                    .unwrap_or_else(|| "—".to_string());
                let uptime = status
                    .uptime
                    .map(|u| format!("{}s", u.as_secs()))
                    .unwrap_or_else(|| "—".to_string());
                format!(
                    "<b>{}</b>\nState: {:?}\nUptime: {uptime}\nSession: <code>{session}</code>\nModel: {model}\nRepo: {repo}\nCost: ${:.4}",
                    self.agent_id, status.phase, status.cost_usd
                )
            }
            None => format!(
                "<b>{}</b>\nState: idle\nModel: {model}\nRepo: {repo}",
                self.agent_id
            ),
        }
    }

    pub async fn cost_text(&self) -> String {
        let st = self.state.lock().await;
        match &st.process {
            Some(process) => format!("Accumulated cost: ${:.4}", process.status().cost_usd),
            None => "No active process — cost resets per session.".to_string(),
        }
    }

    pub async fn ping_text(&self) -> String {
        let st = self.state.lock().await;
        match &st.process {
            Some(process) => format!("pong — process {:?}", process.status().phase),
            None => "pong — process idle".to_string(),
        }
    }

    pub async fn is_active(&self) -> bool {
        let st = self.state.lock().await;
        st.process
            .as_ref()
            .map(|p| p.status().phase != Phase::Idle)
            .unwrap_or(false)
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{cut}…")
    }
}
