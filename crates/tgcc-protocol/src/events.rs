//! Typed view of the CLI's stdout NDJSON stream.
//!
//! One JSON event per line. The parser is total: empty lines, malformed
//! JSON and unknown event types all yield `None` (logged at debug), never
//! an error — a garbled line must not take the process supervisor down.

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use tgcc_core::types::TurnUsage;

/// Everything the CLI can emit on stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum CliEvent {
    /// `system/init` — session is up.
    Init(InitEvent),
    /// `system/api_error` — transient upstream failure, the CLI retries.
    ApiError(ApiErrorEvent),
    /// `system/compact_boundary` — context was compacted.
    CompactBoundary(CompactBoundary),
    /// `system/task_started`
    TaskStarted(TaskEvent),
    /// `system/task_progress`
    TaskProgress(TaskEvent),
    /// `system/task_completed`
    TaskCompleted(TaskEvent),
    /// Full assistant message (content blocks + usage + stop reason).
    Assistant(AssistantEvent),
    /// User-side message as replayed by the CLI (tool results live here).
    User(UserEvent),
    /// Direct synchronous tool result.
    ToolResult(ToolResultBlock),
    /// Turn terminator.
    Result(ResultEvent),
    /// Fine-grained streaming delta, unwrapped from `stream_event`.
    Stream(StreamEvent),
    /// `control_request/can_use_tool` — permission prompt.
    PermissionRequest(PermissionRequest),
    /// Acknowledgement of a control request we sent.
    ControlResponse(ControlAck),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InitEvent {
    pub session_id: String,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ApiErrorEvent {
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default, rename = "retryAttempt")]
    pub retry_attempt: Option<u32>,
    #[serde(default, rename = "maxRetries")]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ApiErrorEvent {
    /// HTTP 529 and anything self-describing as overloaded render as a
    /// retry notice rather than an error.
    pub fn is_overloaded(&self) -> bool {
        self.status == Some(529)
            || self
                .message
                .as_deref()
                .is_some_and(|m| m.to_lowercase().contains("overloaded"))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CompactBoundary {
    pub trigger: CompactTrigger,
    #[serde(default)]
    pub pre_tokens: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactTrigger {
    Auto,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TaskEvent {
    pub task_id: String,
    #[serde(default)]
    pub tool_use_id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub last_tool_name: Option<String>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssistantEvent {
    pub content: Vec<ContentItem>,
    pub usage: Option<Usage>,
    pub stop_reason: Option<String>,
    pub model: Option<String>,
}

impl AssistantEvent {
    pub fn wants_tool_use(&self) -> bool {
        self.stop_reason.as_deref() == Some("tool_use")
    }
}

/// One block of an assistant message.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentItem {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
}

/// User-side event: tool results plus the optional structured sibling.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UserEvent {
    pub tool_results: Vec<ToolResultBlock>,
    /// Plain text content, when present — background-agent notification
    /// XML is injected here.
    pub text: Option<String>,
    pub tool_use_result: Option<ToolUseResult>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolResultBlock {
    pub tool_use_id: String,
    pub text: String,
    pub is_error: bool,
}

/// Structured metadata the CLI attaches next to some tool results.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ToolUseResult {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, rename = "agentName")]
    pub agent_name: Option<String>,
    #[serde(default, rename = "outputFile")]
    pub output_file: Option<String>,
}

impl ToolUseResult {
    pub fn is_async_launched(&self) -> bool {
        self.status
            .as_deref()
            .is_some_and(|s| s == "async_launched" || s == "teammate_spawned")
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ResultEvent {
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
    #[serde(default)]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl ResultEvent {
    pub fn is_success(&self) -> bool {
        self.subtype.as_deref() == Some("success") && !self.is_error
    }
}

/// Wire shape of a `usage` object.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
}

impl Usage {
    pub fn into_turn_usage(self, cost_usd: Option<f64>, model: Option<String>) -> TurnUsage {
        TurnUsage {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            cache_read_tokens: self.cache_read_input_tokens,
            cache_creation_tokens: self.cache_creation_input_tokens,
            cost_usd,
            model,
        }
    }
}

/// The fine-grained delta union wrapped in `stream_event`.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    MessageStart,
    ContentBlockStart { index: usize, block: BlockStart },
    ContentBlockDelta { index: usize, delta: BlockDelta },
    ContentBlockStop { index: usize },
    MessageStop,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BlockStart {
    Text,
    Thinking,
    ToolUse { id: String, name: String },
    Image,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BlockDelta {
    Text(String),
    Thinking(String),
    InputJson(String),
    Image(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PermissionRequest {
    pub request_id: String,
    pub tool_name: String,
    pub input: Value,
    pub tool_use_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControlAck {
    pub request_id: Option<String>,
    pub subtype: Option<String>,
}

/// Parse one stdout line into a typed event.
///
/// Returns `None` for empty lines, malformed JSON and unknown event types.
pub fn parse_line(line: &str) -> Option<CliEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, "dropping malformed CLI output line");
            return None;
        }
    };

    let event_type = value.get("type").and_then(|t| t.as_str()).unwrap_or("");
    match event_type {
        "system" => parse_system(&value),
        "assistant" => parse_assistant(&value),
        "user" => Some(CliEvent::User(parse_user(&value))),
        "tool_result" => parse_direct_tool_result(&value),
        "result" => serde_json::from_value(value).ok().map(CliEvent::Result),
        "stream_event" => parse_stream(value.get("event")?),
        "control_request" => parse_control_request(&value),
        "control_response" => Some(CliEvent::ControlResponse(ControlAck {
            request_id: value
                .pointer("/response/request_id")
                .and_then(|v| v.as_str())
                .map(String::from),
            subtype: value
                .pointer("/response/subtype")
                .and_then(|v| v.as_str())
                .map(String::from),
        })),
        other => {
            debug!(event_type = other, "dropping unknown CLI event type");
            None
        }
    }
}

fn parse_system(value: &Value) -> Option<CliEvent> {
    let subtype = value.get("subtype").and_then(|s| s.as_str()).unwrap_or("");
    let inner = value.clone();
    match subtype {
        "init" => serde_json::from_value(inner).ok().map(CliEvent::Init),
        "api_error" => serde_json::from_value(inner).ok().map(CliEvent::ApiError),
        "compact_boundary" => serde_json::from_value(inner)
            .ok()
            .map(CliEvent::CompactBoundary),
        "task_started" => serde_json::from_value(inner).ok().map(CliEvent::TaskStarted),
        "task_progress" => serde_json::from_value(inner)
            .ok()
            .map(CliEvent::TaskProgress),
        "task_completed" => serde_json::from_value(inner)
            .ok()
            .map(CliEvent::TaskCompleted),
        other => {
            debug!(subtype = other, "dropping unknown system event");
            None
        }
    }
}

fn parse_assistant(value: &Value) -> Option<CliEvent> {
    let message = value.get("message")?;
    let content = message
        .get("content")
        .and_then(|c| c.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value(item.clone()).ok())
                .collect()
        })
        .unwrap_or_default();

    Some(CliEvent::Assistant(AssistantEvent {
        content,
        usage: message
            .get("usage")
            .and_then(|u| serde_json::from_value(u.clone()).ok()),
        stop_reason: message
            .get("stop_reason")
            .and_then(|s| s.as_str())
            .map(String::from),
        model: message
            .get("model")
            .and_then(|m| m.as_str())
            .map(String::from),
    }))
}

fn parse_user(value: &Value) -> UserEvent {
    let mut event = UserEvent {
        tool_use_result: value
            .get("tool_use_result")
            .and_then(|r| serde_json::from_value(r.clone()).ok()),
        ..Default::default()
    };

    let content = value.pointer("/message/content");
    match content {
        Some(Value::String(s)) => event.text = Some(s.clone()),
        Some(Value::Array(items)) => {
            let mut text = String::new();
            for item in items {
                match item.get("type").and_then(|t| t.as_str()) {
                    Some("tool_result") => {
                        let tool_use_id = item
                            .get("tool_use_id")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string();
                        event.tool_results.push(ToolResultBlock {
                            tool_use_id,
                            text: flatten_result_content(item.get("content")),
                            is_error: item
                                .get("is_error")
                                .and_then(|v| v.as_bool())
                                .unwrap_or(false),
                        });
                    }
                    Some("text") => {
                        if let Some(t) = item.get("text").and_then(|t| t.as_str()) {
                            if !text.is_empty() {
                                text.push('\n');
                            }
                            text.push_str(t);
                        }
                    }
                    _ => {}
                }
            }
            if !text.is_empty() {
                event.text = Some(text);
            }
        }
        _ => {}
    }
    event
}

/// A tool_result `content` is either a plain string or an array of
/// text/image/document blocks; collapse it to the text parts.
fn flatten_result_content(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => {
            let mut out = String::new();
            for part in parts {
                if part.get("type").and_then(|t| t.as_str()) == Some("text") {
                    if let Some(t) = part.get("text").and_then(|t| t.as_str()) {
                        if !out.is_empty() {
                            out.push('\n');
                        }
                        out.push_str(t);
                    }
                }
            }
            out
        }
        _ => String::new(),
    }
}

fn parse_direct_tool_result(value: &Value) -> Option<CliEvent> {
    Some(CliEvent::ToolResult(ToolResultBlock {
        tool_use_id: value
            .get("tool_use_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        text: flatten_result_content(value.get("content")),
        is_error: value
            .get("is_error")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
    }))
}

fn parse_stream(event: &Value) -> Option<CliEvent> {
    let kind = event.get("type").and_then(|t| t.as_str())?;
    let index = event.get("index").and_then(|i| i.as_u64()).unwrap_or(0) as usize;

    let stream = match kind {
        "message_start" => StreamEvent::MessageStart,
        "message_stop" => StreamEvent::MessageStop,
        "content_block_start" => {
            let block = event.get("content_block")?;
            let block = match block.get("type").and_then(|t| t.as_str())? {
                "text" => BlockStart::Text,
                "thinking" => BlockStart::Thinking,
                "image" => BlockStart::Image,
                "tool_use" => BlockStart::ToolUse {
                    id: block
                        .get("id")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    name: block
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                },
                other => {
                    debug!(block_type = other, "dropping unknown content block start");
                    return None;
                }
            };
            StreamEvent::ContentBlockStart { index, block }
        }
        "content_block_delta" => {
            let delta = event.get("delta")?;
            let delta = match delta.get("type").and_then(|t| t.as_str())? {
                "text_delta" => BlockDelta::Text(
                    delta.get("text").and_then(|v| v.as_str())?.to_string(),
                ),
                "thinking_delta" => BlockDelta::Thinking(
                    delta.get("thinking").and_then(|v| v.as_str())?.to_string(),
                ),
                "input_json_delta" => BlockDelta::InputJson(
                    delta
                        .get("partial_json")
                        .and_then(|v| v.as_str())?
                        .to_string(),
                ),
                "image_delta" => BlockDelta::Image(
                    delta.get("data").and_then(|v| v.as_str())?.to_string(),
                ),
                other => {
                    debug!(delta_type = other, "dropping unknown delta type");
                    return None;
                }
            };
            StreamEvent::ContentBlockDelta { index, delta }
        }
        "content_block_stop" => StreamEvent::ContentBlockStop { index },
        other => {
            debug!(stream_type = other, "dropping unknown stream event");
            return None;
        }
    };
    Some(CliEvent::Stream(stream))
}

fn parse_control_request(value: &Value) -> Option<CliEvent> {
    let request = value.get("request")?;
    match request.get("subtype").and_then(|s| s.as_str()) {
        Some("can_use_tool") => Some(CliEvent::PermissionRequest(PermissionRequest {
            request_id: value
                .get("request_id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            tool_name: request
                .get("tool_name")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            input: request.get("input").cloned().unwrap_or(Value::Null),
            tool_use_id: request
                .get("tool_use_id")
                .and_then(|v| v.as_str())
                .map(String::from),
        })),
        other => {
            debug!(subtype = ?other, "dropping unknown control request");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_and_garbage_lines_yield_none() {
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("   "), None);
        assert_eq!(parse_line("{not json"), None);
        assert_eq!(parse_line(r#"{"type":"wat"}"#), None);
    }

    #[test]
    fn init_event_parses() {
        let line = r#"{"type":"system","subtype":"init","session_id":"abc-1","cwd":"/srv/work","tools":["Bash","Read"],"model":"claude-sonnet-4-6"}"#;
        match parse_line(line) {
            Some(CliEvent::Init(init)) => {
                assert_eq!(init.session_id, "abc-1");
                assert_eq!(init.cwd.as_deref(), Some("/srv/work"));
                assert_eq!(init.tools, vec!["Bash", "Read"]);
            }
            other => panic!("expected Init, got {other:?}"),
        }
    }

    #[test]
    fn api_error_overloaded_detection() {
        let line = r#"{"type":"system","subtype":"api_error","status":529,"retryAttempt":2,"maxRetries":10}"#;
        match parse_line(line) {
            Some(CliEvent::ApiError(e)) => {
                assert!(e.is_overloaded());
                assert_eq!(e.retry_attempt, Some(2));
            }
            other => panic!("expected ApiError, got {other:?}"),
        }

        let by_message = ApiErrorEvent {
            status: Some(500),
            retry_attempt: None,
            max_retries: None,
            message: Some("Overloaded".to_string()),
        };
        assert!(by_message.is_overloaded());
    }

    #[test]
    fn assistant_event_with_tool_use_stop() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Let me check."},{"type":"tool_use","id":"tu_1","name":"Bash","input":{"command":"ls"}}],"stop_reason":"tool_use","usage":{"input_tokens":100,"output_tokens":20}}}"#;
        match parse_line(line) {
            Some(CliEvent::Assistant(a)) => {
                assert!(a.wants_tool_use());
                assert_eq!(a.content.len(), 2);
                assert_eq!(a.usage.as_ref().unwrap().input_tokens, 100);
            }
            other => panic!("expected Assistant, got {other:?}"),
        }
    }

    #[test]
    fn user_event_extracts_tool_results_and_text() {
        let line = r#"{"type":"user","message":{"role":"user","content":[{"type":"tool_result","tool_use_id":"tu_1","content":[{"type":"text","text":"done"}]},{"type":"text","text":"<background_agent_notification>x</background_agent_notification>"}]},"tool_use_result":{"status":"async_launched","agentName":"scout","outputFile":"/tmp/out.md"}}"#;
        match parse_line(line) {
            Some(CliEvent::User(u)) => {
                assert_eq!(u.tool_results.len(), 1);
                assert_eq!(u.tool_results[0].tool_use_id, "tu_1");
                assert_eq!(u.tool_results[0].text, "done");
                assert!(u.text.unwrap().contains("background_agent_notification"));
                let meta = u.tool_use_result.unwrap();
                assert!(meta.is_async_launched());
                assert_eq!(meta.agent_name.as_deref(), Some("scout"));
            }
            other => panic!("expected User, got {other:?}"),
        }
    }

    #[test]
    fn result_event_subtypes() {
        let line = r#"{"type":"result","subtype":"success","total_cost_usd":0.12,"usage":{"input_tokens":5,"output_tokens":7},"session_id":"abc"}"#;
        match parse_line(line) {
            Some(CliEvent::Result(r)) => {
                assert!(r.is_success());
                assert_eq!(r.total_cost_usd, Some(0.12));
            }
            other => panic!("expected Result, got {other:?}"),
        }

        let err = r#"{"type":"result","subtype":"error_max_turns","is_error":true}"#;
        match parse_line(err) {
            Some(CliEvent::Result(r)) => assert!(!r.is_success()),
            other => panic!("expected Result, got {other:?}"),
        }
    }

    #[test]
    fn stream_delta_union() {
        let start = r#"{"type":"stream_event","event":{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"tu_9","name":"Dispatch"}}}"#;
        match parse_line(start) {
            Some(CliEvent::Stream(StreamEvent::ContentBlockStart {
                index: 0,
                block: BlockStart::ToolUse { id, name },
            })) => {
                assert_eq!(id, "tu_9");
                assert_eq!(name, "Dispatch");
            }
            other => panic!("unexpected: {other:?}"),
        }

        let delta = r#"{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}}"#;
        assert_eq!(
            parse_line(delta),
            Some(CliEvent::Stream(StreamEvent::ContentBlockDelta {
                index: 0,
                delta: BlockDelta::Text("Hi".to_string()),
            }))
        );

        let stop = r#"{"type":"stream_event","event":{"type":"message_stop"}}"#;
        assert_eq!(
            parse_line(stop),
            Some(CliEvent::Stream(StreamEvent::MessageStop))
        );
    }

    #[test]
    fn permission_request_parses() {
        let line = r#"{"type":"control_request","request_id":"req-5","request":{"subtype":"can_use_tool","tool_name":"Bash","input":{"command":"rm -rf /tmp/x"},"tool_use_id":"tu_2"}}"#;
        match parse_line(line) {
            Some(CliEvent::PermissionRequest(p)) => {
                assert_eq!(p.request_id, "req-5");
                assert_eq!(p.tool_name, "Bash");
                assert_eq!(p.input["command"], "rm -rf /tmp/x");
            }
            other => panic!("expected PermissionRequest, got {other:?}"),
        }
    }

    #[test]
    fn control_response_ack() {
        let line = r#"{"type":"control_response","response":{"subtype":"success","request_id":"init-1"}}"#;
        match parse_line(line) {
            Some(CliEvent::ControlResponse(ack)) => {
                assert_eq!(ack.request_id.as_deref(), Some("init-1"));
            }
            other => panic!("expected ControlResponse, got {other:?}"),
        }
    }
}
