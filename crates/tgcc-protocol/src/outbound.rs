//! Messages the bridge writes to the CLI's stdin.
//!
//! Everything here serializes to a single newline-terminated JSON line;
//! the supervisor appends the newline.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stdin frame union, tagged on `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    User {
        message: UserPayload,
        uuid: String,
    },
    ControlRequest {
        request_id: String,
        request: ControlRequestBody,
    },
    ControlResponse {
        response: ControlResponseBody,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPayload {
    pub role: String,
    pub content: UserContent,
}

/// Either a plain string or an array of content blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Image { source: ImageSource },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub source_type: String,
    pub media_type: String,
    pub data: String,
}

impl ImageSource {
    pub fn base64(media_type: &str, data: String) -> Self {
        Self {
            source_type: "base64".to_string(),
            media_type: media_type.to_string(),
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum ControlRequestBody {
    Initialize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum ControlResponseBody {
    Success {
        request_id: String,
        response: PermissionDecision,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionDecision {
    pub behavior: String,
    #[serde(skip_serializing_if = "Option::is_none", rename = "updatedInput")]
    pub updated_input: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Outbound {
    /// Plain text user message with a fresh uuid.
    pub fn text(text: impl Into<String>) -> Self {
        Outbound::User {
            message: UserPayload {
                role: "user".to_string(),
                content: UserContent::Text(text.into()),
            },
            uuid: Uuid::new_v4().to_string(),
        }
    }

    /// Content-block user message (text parts + base64 images).
    pub fn blocks(blocks: Vec<ContentBlock>) -> Self {
        Outbound::User {
            message: UserPayload {
                role: "user".to_string(),
                content: UserContent::Blocks(blocks),
            },
            uuid: Uuid::new_v4().to_string(),
        }
    }

    /// Document variant: a text body naming the file for the CLI to open
    /// itself with its own file tools.
    pub fn document(path: &str, filename: &str) -> Self {
        Self::text(format!(
            "The user sent a file: {filename}\nIt is saved at: {path}\nOpen and inspect it as needed."
        ))
    }

    /// The initialize handshake, sent exactly once right after spawn.
    pub fn initialize(request_id: impl Into<String>) -> Self {
        Outbound::ControlRequest {
            request_id: request_id.into(),
            request: ControlRequestBody::Initialize,
        }
    }

    /// Answer to a `can_use_tool` permission prompt.
    pub fn permission_response(request_id: &str, allow: bool, message: Option<String>) -> Self {
        Outbound::ControlResponse {
            response: ControlResponseBody::Success {
                request_id: request_id.to_string(),
                response: PermissionDecision {
                    behavior: if allow { "allow" } else { "deny" }.to_string(),
                    updated_input: None,
                    message,
                },
            },
        }
    }

    /// Serialize to one stdin line (without the trailing newline).
    pub fn to_line(&self) -> String {
        // The enum is serializable by construction.
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_message_wire_shape() {
        let msg = Outbound::text("hello");
        let line = msg.to_line();
        assert!(line.contains(r#""type":"user""#));
        assert!(line.contains(r#""role":"user""#));
        assert!(line.contains(r#""content":"hello""#));
        assert!(line.contains(r#""uuid""#));
        assert!(!line.contains('\n'));
    }

    #[test]
    fn initialize_wire_shape() {
        let line = Outbound::initialize("init-1").to_line();
        assert!(line.contains(r#""type":"control_request""#));
        assert!(line.contains(r#""request_id":"init-1""#));
        assert!(line.contains(r#""subtype":"initialize""#));
    }

    #[test]
    fn permission_deny_wire_shape() {
        let line =
            Outbound::permission_response("req-2", false, Some("denied by user".into())).to_line();
        assert!(line.contains(r#""behavior":"deny""#));
        assert!(line.contains(r#""request_id":"req-2""#));
        assert!(line.contains(r#""message":"denied by user""#));
        // allow leaves message off entirely
        let allow = Outbound::permission_response("req-3", true, None).to_line();
        assert!(allow.contains(r#""behavior":"allow""#));
        assert!(!allow.contains(r#""message""#));
    }

    #[test]
    fn document_names_path_and_filename() {
        let line = Outbound::document("/tmp/tgcc/media/report.pdf", "report.pdf").to_line();
        assert!(line.contains("/tmp/tgcc/media/report.pdf"));
        assert!(line.contains("report.pdf"));
    }
}
