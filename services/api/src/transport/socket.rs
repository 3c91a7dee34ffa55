//! Pumps one attached media socket to and from its pipeline.

use super::protocol::{ClientMessage, ServerMessage};
use anyhow::Result;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{
    Sink, SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use vaani_core::{
    audio::{AudioFrame, INBOUND_SAMPLE_RATE},
    transport::{MediaEvent, PeerEnd},
};

/// How long events still queued by a closing pipeline are forwarded.
const CLOSE_FLUSH: Duration = Duration::from_secs(1);

#[instrument(name = "media_socket", skip_all, fields(session_id = %session_id))]
pub async fn run_media_socket(socket: WebSocket, session_id: String, mut peer: PeerEnd) {
    info!("Media socket open");
    let (mut socket_tx, mut socket_rx) = socket.split();

    if let Err(e) = pump(&mut socket_tx, &mut socket_rx, &mut peer).await {
        warn!(error = ?e, "Media socket failed");
    }
    peer.close();

    // The pipeline drains after the close; pass on whatever it still says.
    let flush = async {
        while let Some(event) = peer.next_event().await {
            if send_event(&mut socket_tx, event).await.is_err() {
                break;
            }
        }
    };
    if tokio::time::timeout(CLOSE_FLUSH, flush).await.is_err() {
        debug!("Stopped flushing events of closing pipeline");
    }
    let _ = socket_tx.close().await;
    info!("Media socket closed");
}

async fn pump(
    socket_tx: &mut SplitSink<WebSocket, Message>,
    socket_rx: &mut SplitStream<WebSocket>,
    peer: &mut PeerEnd,
) -> Result<()> {
    let closed = peer.closed.clone();
    let mut dropped: u64 = 0;
    loop {
        tokio::select! {
            _ = closed.cancelled() => {
                info!("Pipeline closed the media channel");
                return Ok(());
            }
            event = peer.next_event() => match event {
                Some(event) => send_event(socket_tx, event).await?,
                None => return Ok(()),
            },
            msg = socket_rx.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    if !peer.offer_frame(AudioFrame::new(data, INBOUND_SAMPLE_RATE)) {
                        dropped += 1;
                        if dropped.is_power_of_two() {
                            warn!(dropped, "Pipeline is behind, dropping client audio");
                        }
                    }
                }
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::Hangup) => {
                        info!("Client hung up");
                        return Ok(());
                    }
                    Err(e) => debug!(error = %e, "Ignoring unexpected text message"),
                },
                Some(Ok(Message::Close(_))) | None => {
                    info!("Client closed the media socket");
                    return Ok(());
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Err(e)) => return Err(e.into()),
            },
        }
    }
}

async fn send_event<S>(socket_tx: &mut S, event: MediaEvent) -> Result<()>
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let message = match event {
        MediaEvent::Audio(tagged) => Message::Binary(tagged.frame.pcm),
        other => match ServerMessage::from_event(&other) {
            Some(control) => Message::Text(serde_json::to_string(&control)?.into()),
            None => return Ok(()),
        },
    };
    socket_tx.send(message).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vaani_core::{audio::TaggedFrame, turn::Generation};

    #[tokio::test]
    async fn test_send_event_encodes_control_and_audio() {
        let mut sent: Vec<Message> = Vec::new();
        send_event(
            &mut sent,
            MediaEvent::AgentDone {
                generation: Generation(2),
            },
        )
        .await
        .unwrap();
        send_event(
            &mut sent,
            MediaEvent::Audio(TaggedFrame {
                generation: Generation(2),
                frame: AudioFrame::new(vec![1u8, 2, 3, 4], 24_000),
            }),
        )
        .await
        .unwrap();

        assert_eq!(sent.len(), 2);
        match &sent[0] {
            Message::Text(text) => {
                assert_eq!(text.as_str(), r#"{"type":"agent_done","generation":2}"#)
            }
            other => panic!("expected text, got {other:?}"),
        }
        match &sent[1] {
            Message::Binary(data) => assert_eq!(&data[..], &[1u8, 2, 3, 4]),
            other => panic!("expected binary, got {other:?}"),
        }
    }
}
