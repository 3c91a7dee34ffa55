//! Control messages exchanged over the media socket as JSON text frames.
//! Audio travels as binary frames and never appears here.

use serde::{Deserialize, Serialize};
use vaani_core::transport::MediaEvent;

/// Messages sent from the client (browser) to the server.
#[derive(Deserialize, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// The user ended the call from the client.
    Hangup,
}

/// Messages sent from the server to the client (browser).
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// An update on the user's speech-to-text transcription.
    Transcript { text: String, is_final: bool },
    /// A chunk of the agent's streamed text reply.
    ResponseChunk { generation: u64, text: String },
    /// The agent started speaking; audio of this generation follows.
    AgentSpeaking { generation: u64 },
    AgentDone { generation: u64 },
    /// Drop any buffered audio of this generation.
    Interrupted { generation: u64 },
    Error { message: String },
}

impl ServerMessage {
    /// Control message for a pipeline event, `None` for audio.
    pub fn from_event(event: &MediaEvent) -> Option<Self> {
        let message = match event {
            MediaEvent::Audio(_) => return None,
            MediaEvent::Transcript { text, is_final } => ServerMessage::Transcript {
                text: text.clone(),
                is_final: *is_final,
            },
            MediaEvent::ResponseChunk { generation, text } => ServerMessage::ResponseChunk {
                generation: generation.0,
                text: text.clone(),
            },
            MediaEvent::AgentSpeaking { generation } => ServerMessage::AgentSpeaking {
                generation: generation.0,
            },
            MediaEvent::AgentDone { generation } => ServerMessage::AgentDone {
                generation: generation.0,
            },
            MediaEvent::Interrupted { generation } => ServerMessage::Interrupted {
                generation: generation.0,
            },
            MediaEvent::Error { message } => ServerMessage::Error {
                message: message.clone(),
            },
        };
        Some(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vaani_core::{
        audio::{AudioFrame, TaggedFrame},
        turn::Generation,
    };

    #[test]
    fn test_server_message_wire_format() {
        let message = ServerMessage::from_event(&MediaEvent::Interrupted {
            generation: Generation(3),
        })
        .unwrap();
        assert_eq!(
            serde_json::to_string(&message).unwrap(),
            r#"{"type":"interrupted","generation":3}"#
        );

        let message = ServerMessage::from_event(&MediaEvent::Transcript {
            text: "hi".into(),
            is_final: true,
        })
        .unwrap();
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "transcript");
        assert_eq!(json["is_final"], true);
    }

    #[test]
    fn test_audio_is_not_a_control_message() {
        let audio = MediaEvent::Audio(TaggedFrame {
            generation: Generation(1),
            frame: AudioFrame::new(vec![0u8; 2], 24_000),
        });
        assert_eq!(ServerMessage::from_event(&audio), None);
    }

    #[test]
    fn test_client_hangup() {
        let message: ClientMessage = serde_json::from_str(r#"{"type":"hangup"}"#).unwrap();
        assert_eq!(message, ClientMessage::Hangup);
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"dance"}"#).is_err());
    }
}
