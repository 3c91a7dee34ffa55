//! WebSocket-backed transport negotiator.
//!
//! Negotiation parks the transport end of a fresh media channel under a
//! random token and answers with the socket path for that token. The client
//! has `attach_timeout` to open the socket; an unclaimed slot is closed, which
//! ends the pipeline behind it.

use super::sdp;
use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use vaani_core::transport::{
    Answer, MediaChannel, NegotiationError, Offer, PeerEnd, TransportNegotiator, media_channel,
};

struct PendingMedia {
    session_id: String,
    peer: PeerEnd,
}

pub struct WsNegotiator {
    pending: Arc<Mutex<HashMap<String, PendingMedia>>>,
    attach_timeout: Duration,
    inbound_capacity: usize,
    outbound_capacity: usize,
}

impl WsNegotiator {
    pub fn new(attach_timeout: Duration) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            attach_timeout,
            inbound_capacity: 64,
            outbound_capacity: 256,
        }
    }

    /// Claims the slot behind `token`. Each token can be claimed once.
    pub async fn attach(&self, token: &str) -> Option<(String, PeerEnd)> {
        let slot = self.pending.lock().await.remove(token)?;
        debug!(session_id = %slot.session_id, "Media socket attached");
        Some((slot.session_id, slot.peer))
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    fn new_token() -> String {
        format!("{:032x}", rand::random::<u128>())
    }

    /// Closes the slot if nobody claims it in time, or forgets it once the
    /// pipeline behind it has already gone.
    fn expire(&self, token: String, peer_closed: tokio_util::sync::CancellationToken) {
        let pending = self.pending.clone();
        let timeout = self.attach_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {}
                _ = peer_closed.cancelled() => {}
            }
            if let Some(slot) = pending.lock().await.remove(&token) {
                warn!(session_id = %slot.session_id, "Media socket never attached, closing slot");
                slot.peer.close();
            }
        });
    }
}

#[async_trait]
impl TransportNegotiator for WsNegotiator {
    async fn negotiate(
        &self,
        session_id: &str,
        offer: &Offer,
    ) -> Result<(Answer, MediaChannel), NegotiationError> {
        sdp::validate_offer(offer)?;

        let token = Self::new_token();
        let (channel, peer) = media_channel(self.inbound_capacity, self.outbound_capacity);
        let closed = peer.closed.clone();
        self.pending.lock().await.insert(
            token.clone(),
            PendingMedia {
                session_id: session_id.to_string(),
                peer,
            },
        );
        self.expire(token.clone(), closed);
        info!(session_id, "Media slot allocated");

        Ok((
            Answer {
                sdp: sdp::build_answer(&token),
                kind: "answer".into(),
            },
            channel,
        ))
    }
}
