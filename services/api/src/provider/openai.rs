//! Speech recognition over the OpenAI Realtime API.
//!
//! A realtime session is configured for input transcription only: server VAD
//! segments the user's speech, but no model response is ever created.

use crate::audio_utils::{
    self, CLIENT_CAPTURE_SAMPLE_RATE, OPENAI_REALTIME_API_PCM16_SAMPLE_RATE, StreamResampler,
};
use async_openai::types::realtime::{
    self as oai_realtime, ClientEvent as OAIClientEvent, ServerEvent as OAIServerEvent,
};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, client::IntoClientRequest, protocol::Message as WsMessage},
};
use tracing::{Instrument, debug, info, warn};
use vaani_core::{
    audio::AudioFrame,
    stage::{Recognizer, StageError, StageKind, StageStream, TranscriptFragment},
};

const REALTIME_MODEL: &str = "gpt-4o-realtime-preview-2024-10-01";
const TRANSCRIPTION_MODEL: &str = "whisper-1";

type FragmentResult = Result<TranscriptFragment, StageError>;

pub struct OpenAIRealtimeRecognizer {
    api_key: String,
}

impl OpenAIRealtimeRecognizer {
    pub fn new(api_key: String) -> Self {
        Self { api_key }
    }

    fn session_update() -> OAIClientEvent {
        let session = oai_realtime::SessionResource {
            model: Some(REALTIME_MODEL.to_string()),
            modalities: Some(vec!["text".to_string()]),
            input_audio_format: Some(oai_realtime::AudioFormat::PCM16),
            input_audio_transcription: Some(oai_realtime::AudioTranscription {
                model: Some(TRANSCRIPTION_MODEL.to_string()),
                ..Default::default()
            }),
            turn_detection: Some(oai_realtime::TurnDetection::ServerVAD {
                threshold: 0.5,
                prefix_padding_ms: 300,
                silence_duration_ms: 700,
                interrupt_response: Some(false),
                create_response: Some(false),
            }),
            ..Default::default()
        };
        OAIClientEvent::SessionUpdate(oai_realtime::SessionUpdateEvent {
            session,
            event_id: None,
        })
    }
}

fn recognizer_error(message: impl Into<String>) -> StageError {
    StageError::transient(StageKind::Recognizer, message)
}

/// Authentication and authorization failures will not improve on retry.
fn connect_error(error: tungstenite::Error) -> StageError {
    match &error {
        tungstenite::Error::Http(response)
            if matches!(response.status().as_u16(), 401 | 403) =>
        {
            StageError::fatal(StageKind::Recognizer, error.to_string())
        }
        tungstenite::Error::Http(response) if response.status().as_u16() == 429 => {
            StageError::RateLimited {
                stage: StageKind::Recognizer,
                message: error.to_string(),
            }
        }
        _ => recognizer_error(error.to_string()),
    }
}

fn server_error(message: String) -> StageError {
    let lowered = message.to_lowercase();
    if lowered.contains("api key") || lowered.contains("authentication") {
        StageError::fatal(StageKind::Recognizer, message)
    } else {
        recognizer_error(message)
    }
}

/// Turns realtime server events into transcript fragments. Deltas are
/// accumulated so every provisional fragment carries the whole hypothesis.
#[derive(Default)]
struct TranscriptAssembler {
    partial: String,
}

impl TranscriptAssembler {
    fn on_event(&mut self, event: OAIServerEvent) -> Option<FragmentResult> {
        match event {
            OAIServerEvent::ConversationItemInputAudioTranscriptionDelta(e) => {
                self.partial.push_str(&e.delta);
                let text = self.partial.trim();
                (!text.is_empty()).then(|| Ok(TranscriptFragment::provisional(text)))
            }
            OAIServerEvent::ConversationItemInputAudioTranscriptionCompleted(e) => {
                self.partial.clear();
                let text = e.transcript.trim();
                (!text.is_empty()).then(|| Ok(TranscriptFragment::final_text(text)))
            }
            OAIServerEvent::Error(e) => Some(Err(server_error(e.error.message))),
            _ => None,
        }
    }
}

#[async_trait]
impl Recognizer for OpenAIRealtimeRecognizer {
    async fn recognize(
        &self,
        mut audio: mpsc::Receiver<AudioFrame>,
    ) -> Result<StageStream<TranscriptFragment>, StageError> {
        let url = format!("wss://api.openai.com/v1/realtime?model={REALTIME_MODEL}");
        let mut request = url
            .into_client_request()
            .map_err(|e| StageError::fatal(StageKind::Recognizer, e.to_string()))?;
        let headers = request.headers_mut();
        headers.insert(
            "Authorization",
            format!("Bearer {}", self.api_key)
                .parse()
                .map_err(|_| StageError::fatal(StageKind::Recognizer, "invalid API key header"))?,
        );
        headers.insert("OpenAI-Beta", tungstenite::http::HeaderValue::from_static("realtime=v1"));

        let (ws_stream, _) = connect_async(request).await.map_err(connect_error)?;
        let (mut openai_tx, mut openai_rx) = ws_stream.split();
        info!("Connected to OpenAI Realtime API for transcription");

        let update = serde_json::to_string(&Self::session_update())
            .map_err(|e| StageError::fatal(StageKind::Recognizer, e.to_string()))?;
        openai_tx
            .send(WsMessage::Text(update.into()))
            .await
            .map_err(connect_error)?;

        let mut resampler =
            StreamResampler::new(CLIENT_CAPTURE_SAMPLE_RATE, OPENAI_REALTIME_API_PCM16_SAMPLE_RATE)
                .map_err(|e| StageError::fatal(StageKind::Recognizer, e.to_string()))?;

        let (tx, rx) = mpsc::channel::<FragmentResult>(64);
        tokio::spawn(
            async move {
                let mut assembler = TranscriptAssembler::default();
                loop {
                    tokio::select! {
                        frame = audio.recv() => match frame {
                            Some(frame) => {
                                let samples = resampler.push_pcm16(&frame.pcm);
                                if samples.is_empty() {
                                    continue;
                                }
                                let append = OAIClientEvent::InputAudioBufferAppend(
                                    oai_realtime::InputAudioBufferAppendEvent {
                                        audio: audio_utils::encode_f32_to_base64_i16(&samples),
                                        event_id: None,
                                    },
                                );
                                let sent = match serde_json::to_string(&append) {
                                    Ok(text) => openai_tx.send(WsMessage::Text(text.into())).await,
                                    Err(e) => {
                                        warn!(error = %e, "Failed to encode audio event");
                                        continue;
                                    }
                                };
                                if let Err(e) = sent {
                                    let _ = tx.send(Err(recognizer_error(e.to_string()))).await;
                                    return;
                                }
                            }
                            None => {
                                debug!("Audio input closed, ending transcription session");
                                let _ = openai_tx.close().await;
                                return;
                            }
                        },
                        msg = openai_rx.next() => match msg {
                            Some(Ok(WsMessage::Text(text))) => {
                                let Ok(event) = serde_json::from_str::<OAIServerEvent>(&text) else {
                                    continue;
                                };
                                if let Some(item) = assembler.on_event(event) {
                                    let failed = item.is_err();
                                    if tx.send(item).await.is_err() || failed {
                                        return;
                                    }
                                }
                            }
                            Some(Ok(WsMessage::Close(_))) | None => {
                                let _ = tx.send(Err(recognizer_error("realtime socket closed"))).await;
                                return;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                let _ = tx.send(Err(recognizer_error(e.to_string()))).await;
                                return;
                            }
                        },
                    }
                }
            }
            .in_current_span(),
        );

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(json: &str) -> OAIServerEvent {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_session_update_disables_responses() {
        let json = serde_json::to_value(OpenAIRealtimeRecognizer::session_update()).unwrap();
        assert_eq!(json["type"], "session.update");
        assert_eq!(json["session"]["turn_detection"]["create_response"], false);
        assert_eq!(json["session"]["modalities"][0], "text");
    }

    #[test]
    fn test_assembler_accumulates_deltas() {
        let mut assembler = TranscriptAssembler::default();
        let first = assembler.on_event(event(
            r#"{"type":"conversation.item.input_audio_transcription.delta","event_id":"e1","item_id":"i1","content_index":0,"delta":"Hel"}"#,
        ));
        assert_eq!(first, Some(Ok(TranscriptFragment::provisional("Hel"))));
        let second = assembler.on_event(event(
            r#"{"type":"conversation.item.input_audio_transcription.delta","event_id":"e2","item_id":"i1","content_index":0,"delta":"lo"}"#,
        ));
        assert_eq!(second, Some(Ok(TranscriptFragment::provisional("Hello"))));
        let done = assembler.on_event(event(
            r#"{"type":"conversation.item.input_audio_transcription.completed","event_id":"e3","item_id":"i1","content_index":0,"transcript":"Hello."}"#,
        ));
        assert_eq!(done, Some(Ok(TranscriptFragment::final_text("Hello."))));
        assert!(assembler.partial.is_empty());
    }

    #[test]
    fn test_server_error_classification() {
        assert!(matches!(
            server_error("Incorrect API key provided".into()),
            StageError::Fatal { .. }
        ));
        assert!(server_error("Server overloaded".into()).is_recoverable());
    }
}
