//! Streaming Stage Adapters
//!
//! The pipeline talks to recognition, response generation and synthesis
//! engines only through the three traits in this module. Concrete vendors are
//! chosen by configuration when a [`StageSet`] is assembled.

use crate::{
    audio::{AudioFrame, TaggedFrame},
    floor::GenerationGate,
    turn::{Generation, Turn},
};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::{fmt, pin::Pin, sync::Arc};
use tokio::sync::mpsc;

/// Which adapter raised an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Recognizer,
    Responder,
    Synthesizer,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageKind::Recognizer => write!(f, "recognizer"),
            StageKind::Responder => write!(f, "responder"),
            StageKind::Synthesizer => write!(f, "synthesizer"),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum StageError {
    #[error("{stage} is rate limited: {message}")]
    RateLimited { stage: StageKind, message: String },
    #[error("{stage} transient failure: {message}")]
    Transient { stage: StageKind, message: String },
    #[error("{stage} failed: {message}")]
    Fatal { stage: StageKind, message: String },
}

impl StageError {
    pub fn transient(stage: StageKind, message: impl Into<String>) -> Self {
        Self::Transient {
            stage,
            message: message.into(),
        }
    }

    pub fn fatal(stage: StageKind, message: impl Into<String>) -> Self {
        Self::Fatal {
            stage,
            message: message.into(),
        }
    }

    /// Whether one retry at the adapter boundary is allowed.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, StageError::Fatal { .. })
    }

    pub fn stage(&self) -> StageKind {
        match self {
            StageError::RateLimited { stage, .. }
            | StageError::Transient { stage, .. }
            | StageError::Fatal { stage, .. } => *stage,
        }
    }
}

pub type StageStream<T> = Pin<Box<dyn Stream<Item = Result<T, StageError>> + Send>>;

/// Incremental recognizer output.
///
/// Provisional fragments carry the whole current hypothesis for the utterance
/// in progress; the final fragment carries the finished utterance.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptFragment {
    pub text: String,
    pub is_final: bool,
}

impl TranscriptFragment {
    pub fn provisional(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
        }
    }

    pub fn final_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
        }
    }
}

/// Input to a synthesizer session.
#[derive(Debug, Clone, PartialEq)]
pub enum SynthesisRequest {
    Text { generation: Generation, text: String },
    /// No more text will follow for this generation.
    Flush { generation: Generation },
}

impl SynthesisRequest {
    pub fn generation(&self) -> Generation {
        match self {
            SynthesisRequest::Text { generation, .. } | SynthesisRequest::Flush { generation } => {
                *generation
            }
        }
    }
}

/// Output of a synthesizer session.
#[derive(Debug, Clone, PartialEq)]
pub enum SynthesisOutput {
    Audio(TaggedFrame),
    /// Everything for this generation has been emitted.
    Done { generation: Generation },
}

impl SynthesisOutput {
    pub fn generation(&self) -> Generation {
        match self {
            SynthesisOutput::Audio(tagged) => tagged.generation,
            SynthesisOutput::Done { generation } => *generation,
        }
    }
}

/// Audio to text, incremental.
#[async_trait]
pub trait Recognizer: Send + Sync {
    /// Opens a recognition session fed by `audio`. The returned stream ends
    /// when `audio` is closed or the service disconnects.
    async fn recognize(
        &self,
        audio: mpsc::Receiver<AudioFrame>,
    ) -> Result<StageStream<TranscriptFragment>, StageError>;
}

/// Conversation plus new user text to agent text.
#[async_trait]
pub trait Responder: Send + Sync {
    /// Streams the reply as ordered text fragments. The end of the stream is
    /// the completion marker.
    async fn respond(
        &self,
        history: &[Turn],
        user_text: &str,
    ) -> Result<StageStream<String>, StageError>;

    /// Single request/response variant used by the text-chat path.
    async fn complete(&self, history: &[Turn], user_text: &str) -> Result<String, StageError> {
        let mut stream = self.respond(history, user_text).await?;
        let mut reply = String::new();
        while let Some(fragment) = stream.next().await {
            reply.push_str(&fragment?);
        }
        Ok(reply)
    }
}

/// Generation-tagged text to generation-tagged audio.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Opens a synthesis session fed by `requests`. Output for a generation
    /// must preserve request order and end with `SynthesisOutput::Done` after
    /// that generation's `Flush`.
    ///
    /// Requests whose generation `gate` no longer reports as current belong
    /// to an interrupted response and should be skipped without synthesis.
    async fn synthesize(
        &self,
        requests: mpsc::Receiver<SynthesisRequest>,
        gate: GenerationGate,
    ) -> Result<StageStream<SynthesisOutput>, StageError>;
}

/// The three adapters a pipeline is built from.
#[derive(Clone)]
pub struct StageSet {
    pub recognizer: Arc<dyn Recognizer>,
    pub responder: Arc<dyn Responder>,
    pub synthesizer: Arc<dyn Synthesizer>,
}

/// Runs `op`, retrying once after a recoverable failure.
pub async fn with_single_retry<T, F, Fut>(stage: StageKind, mut op: F) -> Result<T, StageError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, StageError>>,
{
    match op().await {
        Err(e) if e.is_recoverable() => {
            tracing::warn!(%stage, error = %e, "Stage call failed, retrying once");
            op().await
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_error_classification() {
        let rate = StageError::RateLimited {
            stage: StageKind::Responder,
            message: "slow down".into(),
        };
        assert!(rate.is_recoverable());
        assert!(StageError::transient(StageKind::Recognizer, "reset").is_recoverable());
        let fatal = StageError::fatal(StageKind::Synthesizer, "bad voice");
        assert!(!fatal.is_recoverable());
        assert_eq!(fatal.stage(), StageKind::Synthesizer);
        assert_eq!(fatal.to_string(), "synthesizer failed: bad voice");
    }

    #[tokio::test]
    async fn test_single_retry_on_transient() {
        let calls = AtomicUsize::new(0);
        let result = with_single_retry(StageKind::Responder, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(StageError::transient(StageKind::Responder, "blip"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_no_retry_on_fatal_and_only_one_retry() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = with_single_retry(StageKind::Responder, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StageError::fatal(StageKind::Responder, "nope")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = with_single_retry(StageKind::Responder, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StageError::transient(StageKind::Responder, "again")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
