//! JSON frames exchanged over a chat socket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{error::ServiceError, store::Conversation};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GenerateCommand {
    pub message: String,
    #[serde(default)]
    pub chat_id: Option<i64>,
    #[serde(default)]
    pub max_length: Option<usize>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub top_k: Option<usize>,
    /// Upload path, relative to the uploads directory. Vision chat only.
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundCommand {
    Generate(GenerateCommand),
    Stop,
}

/// Parses one text frame. Frames that are not JSON objects, carry an unknown
/// `command`, or a malformed `generate` body are validation errors.
pub fn parse_command(raw: &str) -> Result<InboundCommand, ServiceError> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| ServiceError::validation(format!("invalid JSON frame: {e}")))?;
    let command = value
        .get("command")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    match command.as_str() {
        "generate" => serde_json::from_value(value)
            .map(InboundCommand::Generate)
            .map_err(|e| ServiceError::validation(format!("invalid generate command: {e}"))),
        "stop" => Ok(InboundCommand::Stop),
        other => Err(ServiceError::validation(format!("Unknown command: {other}"))),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationSummary {
    pub id: i64,
    pub title: String,
    pub created_at: DateTime<Utc>,
    #[serde(rename = "lastMessageTimestamp")]
    pub last_message_timestamp: DateTime<Utc>,
}

impl From<&Conversation> for ConversationSummary {
    fn from(conversation: &Conversation) -> Self {
        Self {
            id: conversation.id,
            title: conversation.title.clone(),
            created_at: conversation.created_at,
            last_message_timestamp: conversation.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OutboundEvent {
    Connected {
        status: &'static str,
        session_id: Uuid,
    },
    Token {
        token: String,
    },
    Complete {
        status: &'static str,
        conversation: ConversationSummary,
        finish_reason: String,
    },
    Error {
        error: String,
    },
}

impl OutboundEvent {
    pub fn connected(session_id: Uuid) -> Self {
        OutboundEvent::Connected {
            status: "connected",
            session_id,
        }
    }

    pub fn token(token: impl Into<String>) -> Self {
        OutboundEvent::Token {
            token: token.into(),
        }
    }

    pub fn complete(conversation: ConversationSummary, finish_reason: impl Into<String>) -> Self {
        OutboundEvent::Complete {
            status: "complete",
            conversation,
            finish_reason: finish_reason.into(),
        }
    }

    pub fn error(error: impl ToString) -> Self {
        OutboundEvent::Error {
            error: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_generate_with_optional_fields() {
        let cmd = parse_command(
            r#"{"command":"generate","message":"hi","chat_id":4,"max_length":12,"temperature":0}"#,
        )
        .unwrap();
        let InboundCommand::Generate(cmd) = cmd else {
            panic!("expected generate");
        };
        assert_eq!(cmd.message, "hi");
        assert_eq!(cmd.chat_id, Some(4));
        assert_eq!(cmd.max_length, Some(12));
        assert_eq!(cmd.temperature, Some(0.0));
        assert!(cmd.top_p.is_none());
    }

    #[test]
    fn parses_stop() {
        assert_eq!(
            parse_command(r#"{"command":"stop"}"#).unwrap(),
            InboundCommand::Stop
        );
    }

    #[test]
    fn unknown_command_names_the_value() {
        let err = parse_command(r#"{"command":"dance"}"#).unwrap_err();
        assert_eq!(err.to_string(), "Unknown command: dance");

        let err = parse_command(r#"{"message":"no command"}"#).unwrap_err();
        assert_eq!(err.to_string(), "Unknown command: ");
    }

    #[test]
    fn malformed_frames_are_validation_errors() {
        assert!(matches!(
            parse_command("not json"),
            Err(ServiceError::Validation(_))
        ));
        assert!(matches!(
            parse_command(r#"{"command":"generate"}"#),
            Err(ServiceError::Validation(_))
        ));
    }

    #[test]
    fn events_serialize_to_flat_objects() {
        assert_eq!(
            serde_json::to_value(OutboundEvent::token("Hel")).unwrap(),
            json!({ "token": "Hel" })
        );
        assert_eq!(
            serde_json::to_value(OutboundEvent::error("boom")).unwrap(),
            json!({ "error": "boom" })
        );

        let now = Utc::now();
        let summary = ConversationSummary {
            id: 7,
            title: "Hello".into(),
            created_at: now,
            last_message_timestamp: now,
        };
        let value = serde_json::to_value(OutboundEvent::complete(summary, "length")).unwrap();
        assert_eq!(value["status"], "complete");
        assert_eq!(value["finish_reason"], "length");
        assert_eq!(value["conversation"]["id"], 7);
        assert!(value["conversation"]["lastMessageTimestamp"].is_string());
    }
}
