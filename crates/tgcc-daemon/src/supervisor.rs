//! Supervisor socket: a higher-level orchestrator registers once, then
//! drives agents through a command envelope and receives subscribed
//! events as pushes.
//!
//! Wire: newline-delimited JSON. First line must be
//! `{"type":"register_supervisor","agentId":…,"capabilities":[…]}`;
//! afterwards `{"type":"command","requestId":…,"action":…,"params":…}`
//! lines are answered with `{"type":"response","requestId":…,…}` and
//! subscribed events arrive as `{"type":"event","event":…,…}`.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bridge::AgentBridge;

struct Subscriber {
    tx: mpsc::UnboundedSender<String>,
    /// `agentId:*` or `agentId:sessionId` patterns.
    subscriptions: HashSet<String>,
}

struct HubState {
    subscribers: HashMap<u64, Subscriber>,
    next_id: u64,
    /// Session ids whose next `process_exit` is swallowed because a
    /// `session_takeover` was already delivered for them.
    suppress_exit: HashSet<String>,
}

/// Fan-out point for supervisor-visible events.
pub struct SupervisorHub {
    state: Mutex<HubState>,
}

impl SupervisorHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(HubState {
                subscribers: HashMap::new(),
                next_id: 0,
                suppress_exit: HashSet::new(),
            }),
        })
    }

    /// Push an event to every subscriber whose pattern matches.
    ///
    /// A `session_takeover` arms suppression of the next `process_exit`
    /// for the same session id.
    pub fn publish(&self, agent_id: &str, session_id: Option<&str>, event: &str, payload: Value) {
        let mut state = self.state.lock().unwrap();

        if event == "session_takeover" {
            if let Some(session) = session_id {
                state.suppress_exit.insert(session.to_string());
            }
        }
        if event == "process_exit" {
            if let Some(session) = session_id {
                if state.suppress_exit.remove(session) {
                    debug!(session, "suppressing process_exit after takeover");
                    return;
                }
            }
        }

        let mut frame = json!({
            "type": "event",
            "event": event,
            "agentId": agent_id,
        });
        if let Some(session) = session_id {
            frame["sessionId"] = json!(session);
        }
        if let Value::Object(extra) = payload {
            for (key, value) in extra {
                frame[key] = value;
            }
        }
        let line = frame.to_string();

        state.subscribers.retain(|_, sub| {
            let wants = sub.subscriptions.iter().any(|pattern| {
                pattern == &format!("{agent_id}:*")
                    || session_id.is_some_and(|s| pattern == &format!("{agent_id}:{s}"))
            });
            if !wants {
                return true;
            }
            sub.tx.send(line.clone()).is_ok()
        });
    }
}

/// Accept supervisor connections on `path` until the task is aborted.
pub async fn serve(
    hub: Arc<SupervisorHub>,
    bridges: HashMap<String, Arc<AgentBridge>>,
    path: PathBuf,
) -> std::io::Result<()> {
    if path.exists() {
        std::fs::remove_file(&path)?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(&path)?;
    info!(path = %path.display(), "supervisor socket listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let hub = Arc::clone(&hub);
        let bridges = bridges.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(hub, bridges, stream).await {
                debug!(error = %e, "supervisor connection closed");
            }
        });
    }
}

async fn handle_connection(
    hub: Arc<SupervisorHub>,
    bridges: HashMap<String, Arc<AgentBridge>>,
    stream: UnixStream,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    // Registration must come first.
    let Some(first) = lines.next_line().await? else {
        return Ok(());
    };
    let registration: Value = match serde_json::from_str(&first) {
        Ok(v) => v,
        Err(_) => {
            write_half
                .write_all(b"{\"type\":\"error\",\"error\":\"invalid JSON\"}\n")
                .await?;
            return Ok(());
        }
    };
    if registration.get("type").and_then(|t| t.as_str()) != Some("register_supervisor") {
        write_half
            .write_all(b"{\"type\":\"error\",\"error\":\"expected register_supervisor\"}\n")
            .await?;
        return Ok(());
    }
    let supervisor_agent = registration
        .get("agentId")
        .and_then(|a| a.as_str())
        .unwrap_or("")
        .to_string();
    info!(agent = %supervisor_agent, "supervisor registered");

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let subscriber_id = {
        let mut state = hub.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        state.subscribers.insert(
            id,
            Subscriber {
                tx: tx.clone(),
                subscriptions: HashSet::new(),
            },
        );
        id
    };

    let _ = tx.send(json!({"type": "response", "requestId": null, "result": "registered"}).to_string());

    // Writer task: both command responses and event pushes flow through
    // the same channel so lines never interleave.
    let writer = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if write_half.write_all(b"\n").await.is_err() {
                break;
            }
        }
    });

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = dispatch_command(&hub, &bridges, subscriber_id, &line).await;
        let _ = tx.send(response.to_string());
    }

    hub.state.lock().unwrap().subscribers.remove(&subscriber_id);
    writer.abort();
    Ok(())
}

async fn dispatch_command(
    hub: &Arc<SupervisorHub>,
    bridges: &HashMap<String, Arc<AgentBridge>>,
    subscriber_id: u64,
    line: &str,
) -> Value {
    let request: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            return json!({"type": "response", "requestId": null, "error": format!("invalid JSON: {e}")})
        }
    };
    let request_id = request.get("requestId").cloned().unwrap_or(Value::Null);
    let action = request.get("action").and_then(|a| a.as_str()).unwrap_or("");
    let params = request.get("params").cloned().unwrap_or(Value::Null);

    let agent = params
        .get("agentId")
        .and_then(|a| a.as_str())
        .map(String::from);
    let bridge = agent.as_deref().and_then(|id| bridges.get(id));

    let result: Result<Value, String> = match action {
        "ping" => Ok(json!("pong")),
        "subscribe" => {
            let pattern = params
                .get("pattern")
                .and_then(|p| p.as_str())
                .unwrap_or_default()
                .to_string();
            if pattern.is_empty() {
                Err("pattern required".to_string())
            } else {
                let mut state = hub.state.lock().unwrap();
                if let Some(sub) = state.subscribers.get_mut(&subscriber_id) {
                    sub.subscriptions.insert(pattern);
                }
                Ok(json!("subscribed"))
            }
        }
        "unsubscribe" => {
            let pattern = params
                .get("pattern")
                .and_then(|p| p.as_str())
                .unwrap_or_default();
            let mut state = hub.state.lock().unwrap();
            if let Some(sub) = state.subscribers.get_mut(&subscriber_id) {
                sub.subscriptions.remove(pattern);
            }
            Ok(json!("unsubscribed"))
        }
        "status" => match bridge {
            Some(bridge) => Ok(bridge.status_json().await),
            None => Err("unknown agent".to_string()),
        },
        "send_message" => match (bridge, params.get("text").and_then(|t| t.as_str())) {
            (Some(bridge), Some(text)) => {
                bridge.inject_text(text).await;
                Ok(json!("queued"))
            }
            (None, _) => Err("unknown agent".to_string()),
            (_, None) => Err("text required".to_string()),
        },
        "send_to_cc" => match (bridge, params.get("text").and_then(|t| t.as_str())) {
            (Some(bridge), Some(text)) => {
                bridge.inject_text(text).await;
                Ok(json!("sent"))
            }
            (None, _) => Err("unknown agent".to_string()),
            (_, None) => Err("text required".to_string()),
        },
        "kill_cc" => match bridge {
            Some(bridge) => {
                bridge.kill_process().await;
                Ok(json!("killed"))
            }
            None => Err("unknown agent".to_string()),
        },
        other => Err(format!("unknown action: {other}")),
    };

    match result {
        Ok(result) => json!({"type": "response", "requestId": request_id, "result": result}),
        Err(error) => {
            warn!(action, error = %error, "supervisor command failed");
            json!({"type": "response", "requestId": request_id, "error": error})
        }
    }
}
