//! Per-agent control socket for the companion CLI.
//!
//! Path: `<socket dir>/ctl/<agentId>.sock`. One JSON request per line,
//! one JSON response per line, 10 s read inactivity timeout. Malformed
//! JSON gets an error envelope, not a dropped connection.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info};

use crate::bridge::AgentBridge;

const READ_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct CtlRequest {
    #[serde(rename = "type")]
    request_type: String,
    #[serde(default)]
    #[allow(dead_code)]
    agent: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    session: Option<String>,
}

pub fn socket_path(socket_dir: &Path, agent_id: &str) -> PathBuf {
    socket_dir.join("ctl").join(format!("{agent_id}.sock"))
}

/// Serve the control socket for one agent until aborted.
pub async fn serve(bridge: Arc<AgentBridge>, path: PathBuf) -> std::io::Result<()> {
    if path.exists() {
        std::fs::remove_file(&path)?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(&path)?;
    info!(agent = %bridge.agent_id(), path = %path.display(), "control socket listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let bridge = Arc::clone(&bridge);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(bridge, stream).await {
                debug!(error = %e, "control connection closed");
            }
        });
    }
}

async fn handle_connection(bridge: Arc<AgentBridge>, stream: UnixStream) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    loop {
        let line = match tokio::time::timeout(READ_TIMEOUT, lines.next_line()).await {
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) | Ok(Err(_)) => return Ok(()),
            Err(_) => {
                debug!("control connection idle, closing");
                return Ok(());
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<CtlRequest>(&line) {
            Ok(request) => handle_request(&bridge, request).await,
            Err(e) => json!({"type": "error", "error": format!("invalid JSON: {e}")}),
        };
        write_half.write_all(response.to_string().as_bytes()).await?;
        write_half.write_all(b"\n").await?;
    }
}

async fn handle_request(bridge: &Arc<AgentBridge>, request: CtlRequest) -> serde_json::Value {
    match request.request_type.as_str() {
        "message" => match request.text {
            Some(text) if !text.is_empty() => {
                if let Some(session) = request.session {
                    bridge
                        .set_pending_resume(Some(
                            tgcc_agent::process::ResumeMode::SessionId(session),
                        ))
                        .await;
                }
                bridge.inject_text(&text).await;
                json!({"type": "ack"})
            }
            _ => json!({"type": "error", "error": "text required"}),
        },
        "status" => {
            let mut status = bridge.status_json().await;
            status["type"] = json!("status");
            status
        }
        other => json!({"type": "error", "error": format!("unknown request type: {other}")}),
    }
}
