//! Per-Call Pipeline
//!
//! A pipeline binds one negotiated media channel to one [`StageSet`] and runs
//! recognition, response generation and synthesis for a single call:
//!
//! - `runner`: the owned run loop and its state machine.
//! - `forward`: the transport-facing stage that forwards synthesized audio and
//!   rejects output from superseded generations.
//!
//! A [`Pipeline`] is a handle to that task. Dropping the handle does not stop
//! the call; [`Pipeline::drain`] does.

mod forward;
mod runner;

use crate::{
    context::ContextAccumulator,
    floor::BargeInPolicy,
    persistence::Recorder,
    stage::{StageError, StageSet},
    transport::MediaChannel,
};
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Building,
    Running,
    Draining,
    Closed,
    Errored,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Closed | PipelineState::Errored)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub barge_in: BargeInPolicy,
    /// Frames buffered toward the recognizer before inbound audio is dropped.
    pub audio_queue: usize,
    /// Text fragments buffered toward the synthesizer.
    pub text_queue: usize,
    /// A provisional utterance with no final fragment for this long is
    /// finalized by the pipeline.
    pub utterance_timeout: Duration,
    /// Upper bound on waiting for each stage during teardown.
    pub drain_timeout: Duration,
    /// Number of recent turns given to the responder; `None` for all.
    pub history_window: Option<usize>,
    /// Instruction for an opening agent response, not recorded as a turn.
    pub greeting: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            barge_in: BargeInPolicy::default(),
            audio_queue: 64,
            text_queue: 32,
            utterance_timeout: Duration::from_secs(2),
            drain_timeout: Duration::from_secs(2),
            history_window: Some(20),
            greeting: None,
        }
    }
}

/// How a pipeline ended.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutcome {
    pub state: PipelineState,
    pub error: Option<StageError>,
}

impl PipelineOutcome {
    pub fn closed() -> Self {
        Self {
            state: PipelineState::Closed,
            error: None,
        }
    }

    pub fn errored(error: StageError) -> Self {
        Self {
            state: PipelineState::Errored,
            error: Some(error),
        }
    }
}

/// Sent once when a pipeline task finishes on its own or after a drain.
#[derive(Debug, Clone)]
pub struct PipelineExit {
    pub session_id: String,
    pub pipeline_id: Uuid,
    pub outcome: PipelineOutcome,
}

/// Everything a pipeline needs besides its media channel.
pub struct PipelineParts {
    pub stages: StageSet,
    pub context: Arc<ContextAccumulator>,
    pub recorder: Recorder,
    pub config: PipelineConfig,
}

/// Handle to a running pipeline task.
pub struct Pipeline {
    id: Uuid,
    session_id: String,
    state: watch::Receiver<PipelineState>,
    cancel: CancellationToken,
    drain_timeout: Duration,
    task: JoinHandle<PipelineOutcome>,
}

impl Pipeline {
    /// Spawns the pipeline task. It starts in `Building` and reports its
    /// outcome on `exits` when it finishes.
    pub fn spawn(
        session_id: &str,
        channel: MediaChannel,
        parts: PipelineParts,
        exits: Option<mpsc::UnboundedSender<PipelineExit>>,
    ) -> Self {
        let id = Uuid::new_v4();
        let (state_tx, state_rx) = watch::channel(PipelineState::Building);
        let cancel = CancellationToken::new();
        let drain_timeout = parts.config.drain_timeout;

        let runner = runner::Runner::new(
            session_id.to_string(),
            channel,
            parts,
            state_tx,
            cancel.clone(),
        );
        let span = tracing::info_span!("pipeline", session_id = %session_id, pipeline_id = %id);
        let owner = session_id.to_string();
        let task = tokio::spawn(
            async move {
                let outcome = runner.run().await;
                if let Some(exits) = exits {
                    let _ = exits.send(PipelineExit {
                        session_id: owner,
                        pipeline_id: id,
                        outcome: outcome.clone(),
                    });
                }
                outcome
            }
            .instrument(span),
        );

        Self {
            id,
            session_id: session_id.to_string(),
            state: state_rx,
            cancel,
            drain_timeout,
            task,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.state.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Requests shutdown and waits for the task. Each stage gets
    /// `drain_timeout` inside the task; a task that still does not finish is
    /// aborted.
    pub async fn drain(self) -> PipelineOutcome {
        self.cancel.cancel();
        let grace = self.drain_timeout * 4;
        let mut task = self.task;
        match tokio::time::timeout(grace, &mut task).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join_err)) => {
                warn!(pipeline_id = %self.id, error = %join_err, "Pipeline task did not complete cleanly");
                PipelineOutcome::closed()
            }
            Err(_) => {
                warn!(pipeline_id = %self.id, "Pipeline did not drain in time, aborting");
                task.abort();
                PipelineOutcome::closed()
            }
        }
    }
}
