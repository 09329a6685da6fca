//! Tool-exposure socket: the CLI's grandchild (the MCP tool server)
//! connects here to deliver files, images and voice notes straight to
//! the chat.
//!
//! Path: `<socket dir>/sockets/<agentId>-<userId>.sock`, handed to the
//! child via environment at spawn. The daemon is the server; requests
//! are `{id, tool, agentId, userId, params:{path, caption?}}` and every
//! request gets `{id, success, error?}` back.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use tgcc_telegram::sink::ChatSink;

/// A tool call must finish within this window.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct ToolRequest {
    id: serde_json::Value,
    tool: String,
    #[serde(default)]
    #[allow(dead_code)]
    #[serde(rename = "agentId")]
    agent_id: Option<String>,
    #[serde(default)]
    #[serde(rename = "userId")]
    user_id: Option<i64>,
    #[serde(default)]
    params: ToolParams,
}

#[derive(Debug, Default, Deserialize)]
struct ToolParams {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    caption: Option<String>,
}

pub fn socket_path(socket_dir: &Path, agent_id: &str, user_id: i64) -> PathBuf {
    socket_dir
        .join("sockets")
        .join(format!("{agent_id}-{user_id}.sock"))
}

/// Serve one (agent, user) tool socket. `chat_id` is the chat files are
/// delivered to — the DM of the user the socket belongs to.
pub async fn serve(
    sink: Arc<dyn ChatSink>,
    path: PathBuf,
    chat_id: i64,
) -> std::io::Result<()> {
    if path.exists() {
        std::fs::remove_file(&path)?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(&path)?;
    info!(path = %path.display(), "tool socket listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let sink = Arc::clone(&sink);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(sink, stream, chat_id).await {
                debug!(error = %e, "tool connection closed");
            }
        });
    }
}

async fn handle_connection(
    sink: Arc<dyn ChatSink>,
    stream: UnixStream,
    chat_id: i64,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<ToolRequest>(&line) {
            Ok(request) => {
                let id = request.id.clone();
                match tokio::time::timeout(REQUEST_TIMEOUT, dispatch(&sink, chat_id, request)).await
                {
                    Ok(Ok(())) => json!({"id": id, "success": true}),
                    Ok(Err(error)) => json!({"id": id, "success": false, "error": error}),
                    Err(_) => json!({"id": id, "success": false, "error": "timed out"}),
                }
            }
            Err(e) => json!({"id": null, "success": false, "error": format!("invalid JSON: {e}")}),
        };
        write_half.write_all(response.to_string().as_bytes()).await?;
        write_half.write_all(b"\n").await?;
    }
    Ok(())
}

async fn dispatch(
    sink: &Arc<dyn ChatSink>,
    chat_id: i64,
    request: ToolRequest,
) -> Result<(), String> {
    let path = request
        .params
        .path
        .as_deref()
        .ok_or_else(|| "params.path required".to_string())?;
    let path = Path::new(path);
    if !path.exists() {
        return Err(format!("no such file: {}", path.display()));
    }
    debug!(tool = %request.tool, user = ?request.user_id, path = %path.display(), "tool delivery");

    match request.tool.as_str() {
        "send_file" => sink
            .send_document(chat_id, path)
            .await
            .map_err(|e| e.to_string()),
        "send_image" => {
            let bytes = std::fs::read(path).map_err(|e| e.to_string())?;
            sink.send_photo(chat_id, bytes, request.params.caption)
                .await
                .map(|_| ())
                .map_err(|e| e.to_string())
        }
        "send_voice" => sink
            .send_voice(chat_id, path)
            .await
            .map_err(|e| e.to_string()),
        other => {
            warn!(tool = other, "unknown tool request");
            Err(format!("unknown tool: {other}"))
        }
    }
}
