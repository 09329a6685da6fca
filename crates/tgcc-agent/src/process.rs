//! Supervisor for one CLI child process.
//!
//! Owns spawn, the NDJSON stdin/stdout plumbing, the idle → spawning →
//! active state machine, hang detection and kill escalation. Parsed events
//! fan out to subscribers over a broadcast channel; the dispatcher never
//! blocks on user input or chat I/O.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tgcc_core::types::PermissionMode;
use tgcc_protocol::events::{self, BlockStart, CliEvent, StreamEvent};
use tgcc_protocol::outbound::Outbound;

/// Grace period between SIGTERM and SIGKILL.
const KILL_ESCALATION: Duration = Duration::from_secs(5);
/// Extra wait before declaring a descendant-less tool execution hung.
const HANG_GRACE: Duration = Duration::from_secs(60);
/// Cadence of the background-task descendant check.
const TASK_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Child lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Spawning,
    Active,
}

/// Derived activity, used only by hang detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Idle,
    Responding,
    ToolExecuting,
    WaitingForApi,
}

/// How to attach to an existing conversation at spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeMode {
    /// `--resume <session id>`
    SessionId(String),
    /// `--continue`
    Continue,
}

#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub binary: String,
    pub workdir: PathBuf,
    pub model: Option<String>,
    pub permission_mode: PermissionMode,
    pub max_turns: u32,
    pub resume: Option<ResumeMode>,
    pub mcp_config: Option<PathBuf>,
    /// Extra environment for the child (tool-socket coordinates).
    pub env: Vec<(String, String)>,
    pub idle_timeout: Duration,
    pub hang_timeout: Duration,
}

impl SpawnOptions {
    pub fn new(binary: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            workdir: workdir.into(),
            model: None,
            permission_mode: PermissionMode::Default,
            max_turns: 50,
            resume: None,
            mcp_config: None,
            env: Vec::new(),
            idle_timeout: Duration::from_secs(300),
            hang_timeout: Duration::from_secs(300),
        }
    }
}

/// What subscribers observe.
#[derive(Debug, Clone)]
pub enum ProcessEvent {
    /// Any parsed CLI stdout event.
    Cli(CliEvent),
    /// Hang detector fired; a kill follows.
    Hang,
    /// Unexpected exit not initiated by us — the session is being driven
    /// from elsewhere. Always emitted before the matching `Exit`.
    Takeover,
    Exit {
        code: Option<i32>,
    },
    Error(String),
}

/// Point-in-time snapshot for /status and admin queries.
#[derive(Debug, Clone)]
pub struct ProcessStatus {
    pub phase: Phase,
    pub activity: Activity,
    pub session_id: Option<String>,
    pub cost_usd: f64,
    pub uptime: Option<Duration>,
}

struct State {
    phase: Phase,
    activity: Activity,
    pid: Option<u32>,
    session_id: Option<String>,
    cost_usd: f64,
    spawned_at: Option<Instant>,
    queue: VecDeque<Outbound>,
    stdin_tx: Option<mpsc::UnboundedSender<String>>,
    killed_by_us: bool,
    taken_over: bool,
    background_tasks: HashSet<String>,
    /// Last stdout event or stdin write; the hang loop measures from here.
    last_activity_at: Instant,
    idle_timer: Option<JoinHandle<()>>,
    hang_timer: Option<JoinHandle<()>>,
    task_checker: Option<JoinHandle<()>>,
    sigkill_timer: Option<JoinHandle<()>>,
    /// Bumped on every spawn and exit so stale timer tasks no-op.
    epoch: u64,
}

impl State {
    fn clear_timers(&mut self) {
        for handle in [
            self.idle_timer.take(),
            self.hang_timer.take(),
            self.task_checker.take(),
            self.sigkill_timer.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

struct Inner {
    opts: SpawnOptions,
    events: broadcast::Sender<ProcessEvent>,
    state: Mutex<State>,
}

/// Handle to one supervised CLI process. Cheap to clone.
#[derive(Clone)]
pub struct CliProcess {
    inner: Arc<Inner>,
}

impl CliProcess {
    pub fn new(opts: SpawnOptions) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                opts,
                events,
                state: Mutex::new(State {
                    phase: Phase::Idle,
                    activity: Activity::Idle,
                    pid: None,
                    session_id: None,
                    cost_usd: 0.0,
                    spawned_at: None,
                    queue: VecDeque::new(),
                    stdin_tx: None,
                    killed_by_us: false,
                    taken_over: false,
                    background_tasks: HashSet::new(),
                    last_activity_at: Instant::now(),
                    idle_timer: None,
                    hang_timer: None,
                    task_checker: None,
                    sigkill_timer: None,
                    epoch: 0,
                }),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProcessEvent> {
        self.inner.events.subscribe()
    }

    pub fn status(&self) -> ProcessStatus {
        let state = self.inner.state.lock().unwrap();
        ProcessStatus {
            phase: state.phase,
            activity: state.activity,
            session_id: state.session_id.clone(),
            cost_usd: state.cost_usd,
            uptime: state.spawned_at.map(|at| at.elapsed()),
        }
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.state.lock().unwrap().session_id.clone()
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().unwrap().phase != Phase::Idle
    }

    /// Queue or deliver one user message.
    ///
    /// Idle: enqueue + spawn. Spawning: enqueue (flushed FIFO on
    /// activation). Active: write straight to stdin.
    pub async fn send(&self, msg: Outbound) {
        enum Action {
            Spawn,
            Queued,
            Write(String),
        }

        let action = {
            let mut state = self.inner.state.lock().unwrap();
            match state.phase {
                Phase::Idle => {
                    state.queue.push_back(msg);
                    state.phase = Phase::Spawning;
                    Action::Spawn
                }
                Phase::Spawning => {
                    state.queue.push_back(msg);
                    Action::Queued
                }
                Phase::Active => Action::Write(msg.to_line()),
            }
        };

        match action {
            Action::Spawn => {
                if let Err(e) = self.spawn_child().await {
                    warn!(error = %e, "CLI spawn failed");
                    let mut state = self.inner.state.lock().unwrap();
                    state.phase = Phase::Idle;
                    state.queue.clear();
                    drop(state);
                    let _ = self.inner.events.send(ProcessEvent::Error(e));
                }
            }
            Action::Queued => {}
            Action::Write(line) => Inner::write_line(&self.inner, line),
        }
    }

    /// SIGINT the active turn. No-op unless active; rearms the idle timer
    /// so the child cannot linger after a cancel.
    pub fn cancel(&self) {
        let pid = {
            let mut state = self.inner.state.lock().unwrap();
            if state.phase != Phase::Active {
                return;
            }
            Inner::arm_idle_timer(&self.inner, &mut state);
            state.pid
        };
        if let Some(pid) = pid {
            info!(pid, "interrupting CLI turn");
            unsafe {
                libc::kill(pid as i32, libc::SIGINT);
            }
        }
    }

    /// Deliberate shutdown: SIGTERM now, SIGKILL in 5 s unless exit
    /// arrives first.
    pub fn kill(&self) {
        Inner::kill(&self.inner);
    }

    /// Tear the pipeline down: drop anything still queued, then kill.
    /// Unlike `kill`, the owner is discarding the process, not restarting
    /// the turn.
    pub fn destroy(&self) {
        self.inner.state.lock().unwrap().queue.clear();
        Inner::kill(&self.inner);
    }

    /// `true` when both handles refer to the same supervised process.
    pub fn same_as(&self, other: &CliProcess) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Answer a pending `can_use_tool` prompt.
    pub fn respond_to_permission(&self, request_id: &str, allowed: bool, message: Option<String>) {
        let line = Outbound::permission_response(request_id, allowed, message).to_line();
        Inner::write_line(&self.inner, line);
    }

    async fn spawn_child(&self) -> Result<(), String> {
        let opts = &self.inner.opts;
        let mut cmd = Command::new(&opts.binary);
        cmd.arg("-p")
            .arg("--input-format")
            .arg("stream-json")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--include-partial-messages")
            .arg("--max-turns")
            .arg(opts.max_turns.to_string());

        match opts.permission_mode {
            PermissionMode::Skip => {
                cmd.arg("--dangerously-skip-permissions");
            }
            PermissionMode::AcceptEdits => {
                cmd.arg("--permission-mode").arg("acceptEdits");
            }
            PermissionMode::Plan => {
                cmd.arg("--permission-mode").arg("plan");
            }
            PermissionMode::Default => {}
        }
        if let Some(model) = &opts.model {
            cmd.arg("--model").arg(model);
        }
        match &opts.resume {
            Some(ResumeMode::SessionId(id)) => {
                cmd.arg("--resume").arg(id);
            }
            Some(ResumeMode::Continue) => {
                cmd.arg("--continue");
            }
            None => {}
        }
        if let Some(mcp) = &opts.mcp_config {
            cmd.arg("--mcp-config").arg(mcp);
        }
        for (key, value) in &opts.env {
            cmd.env(key, value);
        }

        cmd.current_dir(&opts.workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // Own process group, so kill escalation reaps the whole tree.
        unsafe {
            cmd.pre_exec(|| {
                libc::setpgid(0, 0);
                Ok(())
            });
        }

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                format!("CLI binary not found at '{}'", opts.binary)
            } else {
                format!("failed to spawn CLI: {e}")
            }
        })?;

        let pid = child.id().ok_or("child had no pid")?;
        let stdin = child.stdin.take().ok_or("no stdin handle")?;
        let stdout = child.stdout.take().ok_or("no stdout handle")?;
        let stderr = child.stderr.take().ok_or("no stderr handle")?;

        info!(pid, workdir = %opts.workdir.display(), "CLI process spawned");

        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<String>();

        {
            let mut state = self.inner.state.lock().unwrap();
            state.pid = Some(pid);
            state.stdin_tx = Some(stdin_tx);
            state.spawned_at = Some(Instant::now());
            state.session_id = None;
            state.killed_by_us = false;
            state.taken_over = false;
            state.cost_usd = 0.0;
            state.background_tasks.clear();
            state.last_activity_at = Instant::now();
            state.epoch += 1;
        }

        // Stdin writer.
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(line) = stdin_rx.recv().await {
                if let Err(e) = stdin.write_all(line.as_bytes()).await {
                    warn!(error = %e, "CLI stdin write failed, dropping message");
                    break;
                }
                if stdin.write_all(b"\n").await.is_err() || stdin.flush().await.is_err() {
                    warn!("CLI stdin closed mid-write");
                    break;
                }
            }
        });

        // Stdout reader → parse → dispatch.
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(event) = events::parse_line(&line) {
                    Inner::handle_event(&inner, &event);
                    let _ = inner.events.send(ProcessEvent::Cli(event));
                }
            }
            debug!("CLI stdout closed");
        });

        // Stderr is diagnostics only.
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(target: "tgcc::cli_stderr", "{line}");
            }
        });

        // Exit watcher.
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let status = child.wait().await;
            Inner::on_exit(&inner, status.ok());
        });

        // Handshake; activation completes on init or the control ack.
        Inner::write_line(&self.inner, Outbound::initialize(Uuid::new_v4().to_string()).to_line());
        Inner::arm_hang_timer(&self.inner);
        Ok(())
    }
}

impl Inner {
    /// Write one newline-terminated line to the child's stdin.
    ///
    /// Every stdin write marks the process as waiting on the upstream API,
    /// clears the idle timer and refreshes the hang clock.
    fn write_line(inner: &Arc<Inner>, line: String) {
        let mut state = inner.state.lock().unwrap();
        let Some(tx) = state.stdin_tx.clone() else {
            warn!("CLI stdin not available, dropping message");
            return;
        };
        state.activity = Activity::WaitingForApi;
        state.last_activity_at = Instant::now();
        if let Some(timer) = state.idle_timer.take() {
            timer.abort();
        }
        drop(state);
        if tx.send(line).is_err() {
            warn!("CLI stdin channel closed, dropping message");
        }
    }

    fn handle_event(inner: &Arc<Inner>, event: &CliEvent) {
        let mut state = inner.state.lock().unwrap();
        state.last_activity_at = Instant::now();

        match event {
            CliEvent::Init(init) => {
                state.session_id = Some(init.session_id.clone());
                Self::activate(inner, &mut state);
            }
            CliEvent::ControlResponse(ack) => {
                // Only a successful ack to the initialize handshake means
                // the child is ready; a rejection must not flush the queue.
                if ack.subtype.as_deref() == Some("success") {
                    Self::activate(inner, &mut state);
                }
            }
            CliEvent::Stream(StreamEvent::MessageStart)
            | CliEvent::Stream(StreamEvent::ContentBlockStart {
                block: BlockStart::ToolUse { .. },
                ..
            }) => {
                state.activity = Activity::Responding;
            }
            CliEvent::Assistant(assistant) if assistant.wants_tool_use() => {
                state.activity = Activity::ToolExecuting;
            }
            CliEvent::ToolResult(_) => {
                state.activity = Activity::WaitingForApi;
            }
            CliEvent::Result(result) => {
                state.activity = Activity::Idle;
                if let Some(cost) = result.total_cost_usd {
                    state.cost_usd = cost;
                }
                Self::arm_idle_timer(inner, &mut state);
            }
            CliEvent::TaskStarted(task) => {
                state.background_tasks.insert(task.task_id.clone());
                if let Some(timer) = state.idle_timer.take() {
                    timer.abort();
                }
                Self::ensure_task_checker(inner, &mut state);
            }
            CliEvent::TaskCompleted(task) => {
                state.background_tasks.remove(&task.task_id);
                if state.background_tasks.is_empty() && state.activity == Activity::Idle {
                    Self::arm_idle_timer(inner, &mut state);
                }
            }
            _ => {}
        }
    }

    /// Spawning → Active; flush the queue FIFO exactly once.
    fn activate(inner: &Arc<Inner>, state: &mut State) {
        if state.phase != Phase::Spawning {
            return;
        }
        state.phase = Phase::Active;
        let queued: Vec<String> = state.queue.drain(..).map(|m| m.to_line()).collect();
        info!(queued = queued.len(), "CLI process active, flushing queue");

        let Some(tx) = state.stdin_tx.clone() else {
            return;
        };
        state.activity = Activity::WaitingForApi;
        state.last_activity_at = Instant::now();
        for line in queued {
            if tx.send(line).is_err() {
                warn!("CLI stdin closed while flushing queue");
                break;
            }
        }
    }

    fn kill(inner: &Arc<Inner>) {
        let pid = {
            let mut state = inner.state.lock().unwrap();
            if state.phase == Phase::Idle {
                return;
            }
            state.killed_by_us = true;
            let pid = state.pid;

            if state.sigkill_timer.is_none() {
                if let Some(pid) = pid {
                    let inner2 = Arc::clone(inner);
                    let epoch = state.epoch;
                    state.sigkill_timer = Some(tokio::spawn(async move {
                        tokio::time::sleep(KILL_ESCALATION).await;
                        let state = inner2.state.lock().unwrap();
                        if state.epoch == epoch && state.pid == Some(pid) {
                            warn!(pid, "CLI ignored SIGTERM, escalating to SIGKILL");
                            unsafe {
                                libc::kill(-(pid as i32), libc::SIGKILL);
                            }
                        }
                    }));
                }
            }
            pid
        };
        if let Some(pid) = pid {
            info!(pid, "terminating CLI process");
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
    }

    fn on_exit(inner: &Arc<Inner>, status: Option<std::process::ExitStatus>) {
        use std::os::unix::process::ExitStatusExt;

        let (taken_over, code) = {
            let mut state = inner.state.lock().unwrap();
            state.clear_timers();
            state.epoch += 1;

            let code = status.as_ref().and_then(|s| s.code());
            let signalled = status.as_ref().and_then(|s| s.signal()).is_some();
            let taken_over = !state.killed_by_us && (code != Some(0) || signalled);

            state.phase = Phase::Idle;
            state.activity = Activity::Idle;
            state.pid = None;
            state.stdin_tx = None;
            state.spawned_at = None;
            state.queue.clear();
            state.background_tasks.clear();
            state.taken_over = taken_over;

            info!(code = ?code, taken_over, killed_by_us = state.killed_by_us, "CLI process exited");
            (taken_over, code)
        };

        if taken_over {
            let _ = inner.events.send(ProcessEvent::Takeover);
        }
        let _ = inner.events.send(ProcessEvent::Exit { code });
    }

    fn arm_idle_timer(inner: &Arc<Inner>, state: &mut State) {
        if let Some(timer) = state.idle_timer.take() {
            timer.abort();
        }
        let inner2 = Arc::clone(inner);
        let epoch = state.epoch;
        let timeout = inner.opts.idle_timeout;
        state.idle_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let fire = {
                let state = inner2.state.lock().unwrap();
                state.epoch == epoch
                    && state.phase == Phase::Active
                    && state.activity == Activity::Idle
                    && state.background_tasks.is_empty()
            };
            if fire {
                info!("CLI idle timeout reached, shutting process down");
                Inner::kill(&inner2);
            }
        }));
    }

    /// One hang loop per spawn: measures quiet time since the last stdout
    /// event or stdin write, then consults activity and the process tree.
    fn arm_hang_timer(inner: &Arc<Inner>) {
        let mut state = inner.state.lock().unwrap();
        if let Some(timer) = state.hang_timer.take() {
            timer.abort();
        }
        let inner2 = Arc::clone(inner);
        let epoch = state.epoch;
        let timeout = inner.opts.hang_timeout;
        state.hang_timer = Some(tokio::spawn(async move {
            let mut delay = timeout;
            loop {
                tokio::time::sleep(delay).await;
                delay = timeout;

                enum Verdict {
                    Wait(Duration),
                    Extend,
                    GraceRecheck(u32),
                    Hang,
                    Stop,
                }

                let verdict = {
                    let state = inner2.state.lock().unwrap();
                    if state.epoch != epoch || state.phase == Phase::Idle {
                        Verdict::Stop
                    } else {
                        let quiet = state.last_activity_at.elapsed();
                        if quiet < timeout {
                            Verdict::Wait(timeout - quiet)
                        } else {
                            match (state.activity, state.pid) {
                                (Activity::Idle, _) => Verdict::Stop,
                                (Activity::WaitingForApi, _) => Verdict::Extend,
                                (Activity::ToolExecuting, Some(pid)) => {
                                    if crate::proctree::has_descendants(pid) {
                                        Verdict::Extend
                                    } else {
                                        Verdict::GraceRecheck(pid)
                                    }
                                }
                                _ => Verdict::Hang,
                            }
                        }
                    }
                };

                match verdict {
                    Verdict::Stop => return,
                    Verdict::Extend => continue,
                    Verdict::Wait(remaining) => {
                        delay = remaining;
                        continue;
                    }
                    Verdict::GraceRecheck(pid) => {
                        tokio::time::sleep(HANG_GRACE).await;
                        let stale = {
                            let state = inner2.state.lock().unwrap();
                            state.epoch != epoch || state.last_activity_at.elapsed() < HANG_GRACE
                        };
                        if stale || crate::proctree::has_descendants(pid) {
                            continue;
                        }
                        warn!(pid, "CLI hang detected after grace recheck");
                        let _ = inner2.events.send(ProcessEvent::Hang);
                        Inner::kill(&inner2);
                        return;
                    }
                    Verdict::Hang => {
                        warn!("CLI hang detected, killing process");
                        let _ = inner2.events.send(ProcessEvent::Hang);
                        Inner::kill(&inner2);
                        return;
                    }
                }
            }
        }));
    }

    /// While background tasks are tracked, verify every 30 s that the
    /// child still has descendants; a task set with no processes behind it
    /// is stale and must not suppress the idle timer forever.
    fn ensure_task_checker(inner: &Arc<Inner>, state: &mut State) {
        if state.task_checker.is_some() {
            return;
        }
        let inner2 = Arc::clone(inner);
        let epoch = state.epoch;
        state.task_checker = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(TASK_CHECK_INTERVAL).await;
                let done = {
                    let mut state = inner2.state.lock().unwrap();
                    if state.epoch != epoch || state.background_tasks.is_empty() {
                        state.task_checker = None;
                        true
                    } else if let Some(pid) = state.pid {
                        if crate::proctree::has_descendants(pid) {
                            false
                        } else {
                            debug!("background tasks tracked but no descendants remain");
                            state.background_tasks.clear();
                            if state.activity == Activity::Idle {
                                Inner::arm_idle_timer(&inner2, &mut state);
                            }
                            state.task_checker = None;
                            true
                        }
                    } else {
                        state.task_checker = None;
                        true
                    }
                };
                if done {
                    return;
                }
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use tokio::time::timeout;

    /// Write a fake CLI to a temp file and return (dir guard, path).
    fn fake_cli(script: &str) -> (tempfile::TempDir, String) {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("fake-cli");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "#!/bin/sh\n{script}").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        (dir, path.to_string_lossy().to_string())
    }

    fn opts(binary: &str, workdir: &std::path::Path) -> SpawnOptions {
        SpawnOptions::new(binary, workdir)
    }

    async fn next_event(
        rx: &mut broadcast::Receiver<ProcessEvent>,
    ) -> Option<ProcessEvent> {
        timeout(Duration::from_secs(5), rx.recv()).await.ok()?.ok()
    }

    #[tokio::test]
    async fn spawn_activates_on_init_and_flushes_queue() {
        let (dir, binary) = fake_cli(
            r#"echo '{"type":"system","subtype":"init","session_id":"sess-1"}'
exec cat >/dev/null"#,
        );
        let process = CliProcess::new(opts(&binary, dir.path()));
        let mut rx = process.subscribe();

        process.send(Outbound::text("hello")).await;

        match next_event(&mut rx).await {
            Some(ProcessEvent::Cli(CliEvent::Init(init))) => {
                assert_eq!(init.session_id, "sess-1");
            }
            other => panic!("expected init, got {other:?}"),
        }

        // Activation happened; the queue was flushed into stdin.
        let status = process.status();
        assert_eq!(status.phase, Phase::Active);
        assert_eq!(process.session_id().as_deref(), Some("sess-1"));

        process.kill();
        loop {
            match next_event(&mut rx).await {
                Some(ProcessEvent::Exit { .. }) => break,
                Some(ProcessEvent::Takeover) => panic!("kill() must not read as takeover"),
                Some(_) => continue,
                None => panic!("no exit event"),
            }
        }
        assert_eq!(process.status().phase, Phase::Idle);
    }

    #[tokio::test]
    async fn successful_control_ack_activates() {
        let (dir, binary) = fake_cli(
            r#"echo '{"type":"control_response","response":{"subtype":"success","request_id":"init-1"}}'
exec cat >/dev/null"#,
        );
        let process = CliProcess::new(opts(&binary, dir.path()));
        let mut rx = process.subscribe();

        process.send(Outbound::text("hello")).await;

        match next_event(&mut rx).await {
            Some(ProcessEvent::Cli(CliEvent::ControlResponse(ack))) => {
                assert_eq!(ack.subtype.as_deref(), Some("success"));
            }
            other => panic!("expected control ack, got {other:?}"),
        }
        assert_eq!(process.status().phase, Phase::Active);

        process.kill();
    }

    #[tokio::test]
    async fn rejected_control_ack_does_not_activate() {
        let (dir, binary) = fake_cli(
            r#"echo '{"type":"control_response","response":{"subtype":"error","request_id":"init-1"}}'
exec cat >/dev/null"#,
        );
        let process = CliProcess::new(opts(&binary, dir.path()));
        let mut rx = process.subscribe();

        process.send(Outbound::text("hello")).await;

        match next_event(&mut rx).await {
            Some(ProcessEvent::Cli(CliEvent::ControlResponse(ack))) => {
                assert_eq!(ack.subtype.as_deref(), Some("error"));
            }
            other => panic!("expected control ack, got {other:?}"),
        }
        // The handshake was rejected; the queue must stay unflushed.
        assert_eq!(process.status().phase, Phase::Spawning);

        process.kill();
    }

    #[tokio::test]
    async fn unexpected_exit_emits_takeover_then_exit() {
        let (dir, binary) = fake_cli("exit 1");
        let process = CliProcess::new(opts(&binary, dir.path()));
        let mut rx = process.subscribe();

        process.send(Outbound::text("hi")).await;

        let mut saw_takeover = false;
        loop {
            match next_event(&mut rx).await {
                Some(ProcessEvent::Takeover) => saw_takeover = true,
                Some(ProcessEvent::Exit { code }) => {
                    assert!(saw_takeover, "takeover must precede exit");
                    assert_eq!(code, Some(1));
                    break;
                }
                Some(_) => continue,
                None => panic!("no exit event"),
            }
        }
        assert_eq!(process.status().phase, Phase::Idle);
    }

    #[tokio::test]
    async fn spawn_failure_emits_error_and_returns_to_idle() {
        let process = CliProcess::new(opts("/nonexistent/cli-binary", std::path::Path::new("/tmp")));
        let mut rx = process.subscribe();

        process.send(Outbound::text("hi")).await;

        match next_event(&mut rx).await {
            Some(ProcessEvent::Error(msg)) => assert!(msg.contains("not found")),
            other => panic!("expected error, got {other:?}"),
        }
        assert_eq!(process.status().phase, Phase::Idle);
    }

    #[tokio::test]
    async fn cancel_is_noop_when_idle() {
        let process = CliProcess::new(opts("true", std::path::Path::new("/tmp")));
        process.cancel();
        assert_eq!(process.status().phase, Phase::Idle);
    }

    #[tokio::test]
    async fn clean_exit_is_not_takeover() {
        let (dir, binary) = fake_cli("exit 0");
        let process = CliProcess::new(opts(&binary, dir.path()));
        let mut rx = process.subscribe();

        process.send(Outbound::text("hi")).await;

        loop {
            match next_event(&mut rx).await {
                Some(ProcessEvent::Takeover) => panic!("exit 0 is not a takeover"),
                Some(ProcessEvent::Exit { code }) => {
                    assert_eq!(code, Some(0));
                    break;
                }
                Some(_) => continue,
                None => panic!("no exit event"),
            }
        }
    }
}
