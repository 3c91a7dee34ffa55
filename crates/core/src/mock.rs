//! Deterministic adapters for development and tests.
//!
//! They implement the same contracts as the vendor adapters, but everything
//! they produce is either derived from their input or fed by the caller.

use crate::{
    audio::{AudioFrame, OUTBOUND_SAMPLE_RATE, TaggedFrame},
    floor::GenerationGate,
    stage::{
        Recognizer, Responder, StageError, StageKind, StageStream, SynthesisOutput,
        SynthesisRequest, Synthesizer, TranscriptFragment,
    },
    transport::{
        Answer, MediaChannel, NegotiationError, Offer, PeerEnd, TransportNegotiator,
        media_channel,
    },
    turn::Turn,
};
use async_trait::async_trait;
use futures::stream;
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};
use tokio::sync::{Mutex, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

type FragmentResult = Result<TranscriptFragment, StageError>;

/// Recognizer whose transcripts are pushed by the caller through a
/// [`TranscriptFeed`]. Audio is consumed and counted.
pub struct ChannelRecognizer {
    feed: Arc<Mutex<mpsc::UnboundedReceiver<FragmentResult>>>,
    frames: Arc<AtomicUsize>,
    sessions: AtomicUsize,
}

/// Caller side of a [`ChannelRecognizer`].
#[derive(Clone)]
pub struct TranscriptFeed {
    tx: mpsc::UnboundedSender<FragmentResult>,
    frames: Arc<AtomicUsize>,
}

impl ChannelRecognizer {
    pub fn new() -> (Self, TranscriptFeed) {
        let (tx, rx) = mpsc::unbounded_channel();
        let frames = Arc::new(AtomicUsize::new(0));
        (
            Self {
                feed: Arc::new(Mutex::new(rx)),
                frames: frames.clone(),
                sessions: AtomicUsize::new(0),
            },
            TranscriptFeed { tx, frames },
        )
    }

    /// Number of recognition sessions opened so far.
    pub fn sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }
}

impl TranscriptFeed {
    pub fn provisional(&self, text: &str) {
        let _ = self.tx.send(Ok(TranscriptFragment::provisional(text)));
    }

    pub fn final_text(&self, text: &str) {
        let _ = self.tx.send(Ok(TranscriptFragment::final_text(text)));
    }

    pub fn fail(&self, error: StageError) {
        let _ = self.tx.send(Err(error));
    }

    /// Audio frames the recognizer has consumed.
    pub fn frames(&self) -> usize {
        self.frames.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Recognizer for ChannelRecognizer {
    async fn recognize(
        &self,
        mut audio: mpsc::Receiver<AudioFrame>,
    ) -> Result<StageStream<TranscriptFragment>, StageError> {
        self.sessions.fetch_add(1, Ordering::SeqCst);
        let input_closed = CancellationToken::new();
        let frames = self.frames.clone();
        let closed = input_closed.clone();
        tokio::spawn(async move {
            while audio.recv().await.is_some() {
                frames.fetch_add(1, Ordering::SeqCst);
            }
            closed.cancel();
        });

        let feed = self.feed.clone();
        Ok(Box::pin(stream::unfold(
            (feed, input_closed),
            |(feed, input_closed)| async move {
                let next = tokio::select! {
                    biased;
                    item = async { feed.lock().await.recv().await } => item,
                    _ = input_closed.cancelled() => None,
                };
                next.map(|item| (item, (feed, input_closed)))
            },
        )))
    }
}

/// Replies "You said: {text}", streamed one word at a time.
#[derive(Debug, Default)]
pub struct MockResponder;

impl MockResponder {
    pub fn reply_for(user_text: &str) -> String {
        format!("You said: {}", user_text.trim())
    }
}

#[async_trait]
impl Responder for MockResponder {
    async fn respond(
        &self,
        _history: &[Turn],
        user_text: &str,
    ) -> Result<StageStream<String>, StageError> {
        let reply = Self::reply_for(user_text);
        let mut words: Vec<Result<String, StageError>> = Vec::new();
        for (i, word) in reply.split(' ').enumerate() {
            let chunk = if i == 0 {
                word.to_string()
            } else {
                format!(" {word}")
            };
            words.push(Ok(chunk));
        }
        Ok(Box::pin(stream::iter(words)))
    }
}

/// One `respond` call observed by a [`ChannelResponder`].
pub struct ResponseCall {
    pub history: Vec<Turn>,
    pub user_text: String,
    /// Fragments of the reply. Dropping the sender completes the response.
    pub reply: mpsc::UnboundedSender<Result<String, StageError>>,
}

/// Responder driven step by step by the caller.
pub struct ChannelResponder {
    calls: mpsc::UnboundedSender<ResponseCall>,
}

impl ChannelResponder {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ResponseCall>) {
        let (calls, rx) = mpsc::unbounded_channel();
        (Self { calls }, rx)
    }
}

#[async_trait]
impl Responder for ChannelResponder {
    async fn respond(
        &self,
        history: &[Turn],
        user_text: &str,
    ) -> Result<StageStream<String>, StageError> {
        let (reply, rx) = mpsc::unbounded_channel();
        self.calls
            .send(ResponseCall {
                history: history.to_vec(),
                user_text: user_text.to_string(),
                reply,
            })
            .map_err(|_| StageError::fatal(StageKind::Responder, "responder script closed"))?;
        Ok(Box::pin(tokio_stream::wrappers::UnboundedReceiverStream::new(rx)))
    }
}

/// Emits one frame per text request whose payload is the text's bytes, and
/// `Done` for every flush. Stale requests are skipped.
#[derive(Debug, Default)]
pub struct MockSynthesizer;

#[async_trait]
impl Synthesizer for MockSynthesizer {
    async fn synthesize(
        &self,
        mut requests: mpsc::Receiver<SynthesisRequest>,
        gate: GenerationGate,
    ) -> Result<StageStream<SynthesisOutput>, StageError> {
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                if !gate.is_current(request.generation()) {
                    continue;
                }
                let output = match request {
                    SynthesisRequest::Text { generation, text } => {
                        SynthesisOutput::Audio(TaggedFrame {
                            generation,
                            frame: AudioFrame::new(text.into_bytes(), OUTBOUND_SAMPLE_RATE),
                        })
                    }
                    SynthesisRequest::Flush { generation } => SynthesisOutput::Done { generation },
                };
                if tx.send(Ok(output)).await.is_err() {
                    break;
                }
            }
        });
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

/// Negotiator that hands out in-process channels. The transport side of each
/// session is kept for the caller to take.
pub struct LoopbackNegotiator {
    peers: Mutex<HashMap<String, PeerEnd>>,
    inbound_capacity: usize,
    outbound_capacity: usize,
}

impl Default for LoopbackNegotiator {
    fn default() -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            inbound_capacity: 64,
            outbound_capacity: 256,
        }
    }
}

impl LoopbackNegotiator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the transport end negotiated most recently for `session_id`.
    pub async fn take_peer(&self, session_id: &str) -> Option<PeerEnd> {
        self.peers.lock().await.remove(session_id)
    }
}

#[async_trait]
impl TransportNegotiator for LoopbackNegotiator {
    async fn negotiate(
        &self,
        session_id: &str,
        offer: &Offer,
    ) -> Result<(Answer, MediaChannel), NegotiationError> {
        if offer.kind != "offer" {
            return Err(NegotiationError::MalformedOffer(format!(
                "expected type \"offer\", got \"{}\"",
                offer.kind
            )));
        }
        if offer.sdp.trim().is_empty() {
            return Err(NegotiationError::MalformedOffer("empty sdp".into()));
        }
        let (channel, peer) = media_channel(self.inbound_capacity, self.outbound_capacity);
        self.peers.lock().await.insert(session_id.to_string(), peer);
        Ok((
            Answer {
                sdp: format!("v=0\r\ns=loopback {session_id}\r\n"),
                kind: "answer".into(),
            },
            channel,
        ))
    }
}
