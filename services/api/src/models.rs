//! API Models
//!
//! Request and response payloads of the HTTP surface, annotated for OpenAPI
//! generation with `utoipa`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;
use vaani_core::turn::{Speaker, Turn};

#[derive(Debug, Serialize, Deserialize, ToSchema, Clone, Copy, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Agent,
}

impl From<Speaker> for MessageRole {
    fn from(speaker: Speaker) -> Self {
        match speaker {
            Speaker::User => MessageRole::User,
            Speaker::Agent => MessageRole::Agent,
        }
    }
}

/// One finalized turn as seen by clients.
#[derive(Serialize, Deserialize, ToSchema, Debug, Clone)]
pub struct Message {
    #[schema(value_type = String, format = Uuid)]
    pub id: Uuid,
    #[schema(value_type = String, example = "user")]
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl From<Turn> for Message {
    fn from(turn: Turn) -> Self {
        Self {
            id: turn.id,
            role: turn.speaker.into(),
            content: turn.content,
            timestamp: turn.timestamp,
        }
    }
}

/// Connection offer from the client. A missing session id is generated.
#[derive(Deserialize, ToSchema)]
pub struct OfferPayload {
    #[schema(example = "tab-3f2a")]
    pub session_id: Option<String>,
    pub sdp: String,
    #[serde(rename = "type")]
    #[schema(example = "offer")]
    pub kind: String,
}

#[derive(Serialize, Deserialize, ToSchema, Debug)]
pub struct AnswerResponse {
    pub session_id: String,
    pub sdp: String,
    #[serde(rename = "type")]
    #[schema(example = "answer")]
    pub kind: String,
}

#[derive(Deserialize, ToSchema)]
pub struct TextMessagePayload {
    #[schema(example = "What's the weather like on Mars?")]
    pub content: String,
}

#[derive(Serialize, Deserialize, ToSchema, Debug)]
pub struct ChatHistoryResponse {
    pub session_id: String,
    pub messages: Vec<Message>,
    /// Number of turns in the session, regardless of `limit`.
    pub total: usize,
}

#[derive(Deserialize, IntoParams)]
pub struct HistoryQuery {
    /// Return only the most recent `limit` messages.
    pub limit: Option<usize>,
}

#[derive(Serialize, Deserialize, ToSchema, Debug)]
pub struct ClearResponse {
    pub session_id: String,
    pub deleted: usize,
}

#[derive(Serialize, Deserialize, ToSchema, Debug)]
pub struct HealthResponse {
    #[schema(example = "ok")]
    pub status: String,
    pub active_sessions: usize,
    pub timestamp: DateTime<Utc>,
    pub service: String,
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json;

    #[test]
    fn test_message_role_serialization() {
        assert_eq!(serde_json::to_string(&MessageRole::User).unwrap(), "\"user\"");
        assert_eq!(serde_json::to_string(&MessageRole::Agent).unwrap(), "\"agent\"");
    }

    #[test]
    fn test_message_from_turn() {
        let turn = Turn::agent("Hello!");
        let message = Message::from(turn.clone());
        assert_eq!(message.id, turn.id);
        assert_eq!(message.role, MessageRole::Agent);
        assert_eq!(message.content, "Hello!");
        assert_eq!(message.timestamp, turn.timestamp);
    }

    #[test]
    fn test_offer_payload_deserialization() {
        let payload: OfferPayload =
            serde_json::from_str(r#"{"sdp":"v=0","type":"offer"}"#).unwrap();
        assert_eq!(payload.session_id, None);
        assert_eq!(payload.kind, "offer");

        let payload: OfferPayload =
            serde_json::from_str(r#"{"session_id":"tab-1","sdp":"v=0","type":"offer"}"#).unwrap();
        assert_eq!(payload.session_id.as_deref(), Some("tab-1"));
    }

    #[test]
    fn test_answer_serialization() {
        let answer = AnswerResponse {
            session_id: "tab-1".into(),
            sdp: "v=0".into(),
            kind: "answer".into(),
        };
        let json = serde_json::to_value(&answer).unwrap();
        assert_eq!(json["type"], "answer");
        assert_eq!(json["session_id"], "tab-1");
    }

    #[test]
    fn test_history_response_serialization() {
        let response = ChatHistoryResponse {
            session_id: "s".into(),
            messages: vec![Message::from(Turn::user("hi"))],
            total: 1,
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"role\":\"user\""));
        assert!(json.contains("\"total\":1"));
    }
}
