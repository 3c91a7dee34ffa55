//! Transport Negotiation Contract
//!
//! A negotiator turns a client's offer descriptor into an answer plus a live
//! [`MediaChannel`]. The pipeline owns the channel; the transport keeps the
//! matching [`PeerEnd`] and pumps it to and from the remote client.

use crate::{
    audio::{AudioFrame, TaggedFrame},
    floor::GenerationGate,
    turn::Generation,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Connection-offer descriptor, opaque to everything but the negotiator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum NegotiationError {
    #[error("Malformed offer: {0}")]
    MalformedOffer(String),
    #[error("No session slot available")]
    NoCapacity,
    #[error("Transport rejected the connection: {0}")]
    Rejected(String),
}

/// Events the pipeline emits toward the remote client.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    Audio(TaggedFrame),
    Transcript { text: String, is_final: bool },
    ResponseChunk { generation: Generation, text: String },
    AgentSpeaking { generation: Generation },
    AgentDone { generation: Generation },
    /// The client should drop any buffered audio of `generation`.
    Interrupted { generation: Generation },
    Error { message: String },
}

/// Pipeline side of a negotiated media channel.
pub struct MediaChannel {
    pub inbound: mpsc::Receiver<AudioFrame>,
    pub outbound: mpsc::Sender<MediaEvent>,
    /// Cancelled by whichever side closes first.
    pub closed: CancellationToken,
    pub gate: GenerationGate,
}

/// Transport side of a negotiated media channel.
pub struct PeerEnd {
    inbound: mpsc::Sender<AudioFrame>,
    outbound: mpsc::Receiver<MediaEvent>,
    pub closed: CancellationToken,
    gate: GenerationGate,
}

/// Creates a connected channel pair with bounded queues in both directions.
pub fn media_channel(inbound_capacity: usize, outbound_capacity: usize) -> (MediaChannel, PeerEnd) {
    let (in_tx, in_rx) = mpsc::channel(inbound_capacity);
    let (out_tx, out_rx) = mpsc::channel(outbound_capacity);
    let closed = CancellationToken::new();
    let gate = GenerationGate::new();
    (
        MediaChannel {
            inbound: in_rx,
            outbound: out_tx,
            closed: closed.clone(),
            gate: gate.clone(),
        },
        PeerEnd {
            inbound: in_tx,
            outbound: out_rx,
            closed,
            gate,
        },
    )
}

impl PeerEnd {
    /// Offers a frame to the pipeline without waiting. Returns `false` when
    /// the frame was dropped because the inbound queue is full or closed.
    pub fn offer_frame(&self, frame: AudioFrame) -> bool {
        self.inbound.try_send(frame).is_ok()
    }

    /// Next event for the client. Audio from a superseded generation is
    /// skipped. Returns `None` once the pipeline has dropped its sender.
    pub async fn next_event(&mut self) -> Option<MediaEvent> {
        loop {
            let event = self.outbound.recv().await?;
            match &event {
                MediaEvent::Audio(tagged) if !self.gate.is_current(tagged.generation) => {
                    tracing::trace!(generation = %tagged.generation, "Dropping stale audio at transport");
                    continue;
                }
                _ => return Some(event),
            }
        }
    }

    pub fn close(&self) {
        self.closed.cancel();
    }
}

/// Performs the one-shot handshake for a session.
#[async_trait]
pub trait TransportNegotiator: Send + Sync {
    /// Returns the answer together with a channel that already accepts media.
    async fn negotiate(
        &self,
        session_id: &str,
        offer: &Offer,
    ) -> Result<(Answer, MediaChannel), NegotiationError>;
}
