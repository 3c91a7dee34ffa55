use super::{PipelineConfig, PipelineOutcome, PipelineParts, PipelineState, forward::forward_synthesis};
use crate::{
    audio::AudioFrame,
    context::ContextAccumulator,
    floor::{Floor, FloorEvent, GenerationGate, TurnController},
    persistence::Recorder,
    stage::{
        Responder, StageError, StageKind, StageSet, StageStream, SynthesisRequest,
        TranscriptFragment, with_single_retry,
    },
    transport::{MediaChannel, MediaEvent},
    turn::{Generation, PendingTurn, Speaker, Turn},
};
use futures::{Stream, StreamExt};
use std::sync::Arc;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, trace, warn};

const CONTROL_QUEUE: usize = 64;

/// Messages from the pipeline's helper tasks back to the run loop.
#[derive(Debug)]
pub(super) enum Control {
    Fragment {
        generation: Generation,
        text: String,
    },
    ResponseDone {
        generation: Generation,
    },
    ResponseFailed {
        generation: Generation,
        error: StageError,
    },
    SynthesisStarted {
        generation: Generation,
    },
    SynthesisDone {
        generation: Generation,
    },
    SynthesisFailed(StageError),
}

pub(super) struct Runner {
    session_id: String,
    inbound: mpsc::Receiver<AudioFrame>,
    outbound: mpsc::Sender<MediaEvent>,
    closed: CancellationToken,
    stages: StageSet,
    context: Arc<ContextAccumulator>,
    recorder: Recorder,
    config: PipelineConfig,
    state: watch::Sender<PipelineState>,
    cancel: CancellationToken,
    controller: TurnController,

    control_tx: mpsc::Sender<Control>,
    control_rx: mpsc::Receiver<Control>,
    stage_cancel: CancellationToken,

    audio_tx: Option<mpsc::Sender<AudioFrame>>,
    transcripts: Option<StageStream<TranscriptFragment>>,
    recognizer_retry: bool,

    synth_tx: Option<mpsc::Sender<SynthesisRequest>>,
    synth_cancel: Option<CancellationToken>,
    forwarder: Option<JoinHandle<()>>,
    synthesizer_retry: bool,

    pending: Option<PendingTurn>,
    responding: Option<(Generation, JoinHandle<()>)>,
    /// User text waiting for the agent to finish speaking when barge-in is off.
    deferred: Option<String>,

    /// Latest provisional text of the utterance in progress.
    hypothesis: Option<String>,
    stall_deadline: Option<Instant>,
    /// Text finalized on timeout, so an identical late final is not doubled.
    forced_final: Option<String>,
    dropped_frames: u64,
}

impl Runner {
    pub(super) fn new(
        session_id: String,
        channel: MediaChannel,
        parts: PipelineParts,
        state: watch::Sender<PipelineState>,
        cancel: CancellationToken,
    ) -> Self {
        let MediaChannel {
            inbound,
            outbound,
            closed,
            gate,
        } = channel;
        let PipelineParts {
            stages,
            context,
            recorder,
            config,
        } = parts;
        let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE);
        Self {
            session_id,
            inbound,
            outbound,
            closed,
            stages,
            context,
            recorder,
            controller: TurnController::new(config.barge_in.clone(), gate),
            config,
            state,
            cancel,
            control_tx,
            control_rx,
            stage_cancel: CancellationToken::new(),
            audio_tx: None,
            transcripts: None,
            recognizer_retry: true,
            synth_tx: None,
            synth_cancel: None,
            forwarder: None,
            synthesizer_retry: true,
            pending: None,
            responding: None,
            deferred: None,
            hypothesis: None,
            stall_deadline: None,
            forced_final: None,
            dropped_frames: 0,
        }
    }

    pub(super) async fn run(mut self) -> PipelineOutcome {
        info!("Pipeline building");
        let cancel = self.cancel.clone();
        let built = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.build() => Some(result),
        };
        match built {
            None => return self.drain().await,
            Some(Err(error)) => return self.fail(error).await,
            Some(Ok(())) => {}
        }

        self.set_state(PipelineState::Running);
        info!("Pipeline running");

        if let Some(greeting) = self.config.greeting.clone() {
            let history = self.context.recent(self.config.history_window).await;
            self.start_response(history, greeting);
        }

        match self.run_loop().await {
            Ok(()) => self.drain().await,
            Err(error) => self.fail(error).await,
        }
    }

    async fn build(&mut self) -> Result<(), StageError> {
        self.open_recognizer().await?;
        self.open_synthesizer().await
    }

    async fn run_loop(&mut self) -> Result<(), StageError> {
        let cancel = self.cancel.clone();
        let closed = self.closed.clone();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Pipeline end requested");
                    return Ok(());
                }
                _ = closed.cancelled() => {
                    info!("Transport closed");
                    return Ok(());
                }
                Some(control) = self.control_rx.recv() => self.on_control(control).await?,
                frame = self.inbound.recv() => match frame {
                    Some(frame) => self.on_audio(frame),
                    None => {
                        info!("Transport stopped sending audio");
                        return Ok(());
                    }
                },
                item = next_item(&mut self.transcripts) => self.on_recognizer_item(item).await?,
                _ = sleep_until(self.stall_deadline) => self.on_stalled_utterance().await,
            }
        }
    }

    // ---- stages ----

    async fn open_recognizer(&mut self) -> Result<(), StageError> {
        let recognizer = self.stages.recognizer.clone();
        let queue = self.config.audio_queue;
        let (audio_tx, transcripts) = with_single_retry(StageKind::Recognizer, || {
            let (tx, rx) = mpsc::channel(queue);
            let recognizer = recognizer.clone();
            async move { recognizer.recognize(rx).await.map(|stream| (tx, stream)) }
        })
        .await?;
        self.audio_tx = Some(audio_tx);
        self.transcripts = Some(transcripts);
        debug!("Recognizer session open");
        Ok(())
    }

    async fn open_synthesizer(&mut self) -> Result<(), StageError> {
        if let Some(cancel) = self.synth_cancel.take() {
            cancel.cancel();
        }
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        let synthesizer = self.stages.synthesizer.clone();
        let queue = self.config.text_queue;
        let gate = self.controller.gate().clone();
        let (synth_tx, output) = with_single_retry(StageKind::Synthesizer, || {
            let (tx, rx) = mpsc::channel(queue);
            let synthesizer = synthesizer.clone();
            let gate = gate.clone();
            async move {
                synthesizer
                    .synthesize(rx, gate)
                    .await
                    .map(|stream| (tx, stream))
            }
        })
        .await?;

        let cancel = self.stage_cancel.child_token();
        self.forwarder = Some(tokio::spawn(
            forward_synthesis(
                output,
                self.controller.gate().clone(),
                self.outbound.clone(),
                self.control_tx.clone(),
                cancel.clone(),
            )
            .in_current_span(),
        ));
        self.synth_tx = Some(synth_tx);
        self.synth_cancel = Some(cancel);
        debug!("Synthesizer session open");
        Ok(())
    }

    async fn on_recognizer_item(
        &mut self,
        item: Option<Result<TranscriptFragment, StageError>>,
    ) -> Result<(), StageError> {
        match item {
            Some(Ok(fragment)) => {
                self.recognizer_retry = true;
                self.on_transcript(fragment).await;
                Ok(())
            }
            Some(Err(error)) => self.reopen_recognizer(error).await,
            None => {
                self.reopen_recognizer(StageError::transient(
                    StageKind::Recognizer,
                    "recognition session ended",
                ))
                .await
            }
        }
    }

    async fn reopen_recognizer(&mut self, error: StageError) -> Result<(), StageError> {
        self.transcripts = None;
        self.audio_tx = None;
        if !error.is_recoverable() || !self.recognizer_retry {
            return Err(error);
        }
        self.recognizer_retry = false;
        warn!(%error, "Recognizer failed, reconnecting once");
        self.open_recognizer().await
    }

    async fn reopen_synthesizer(&mut self, error: StageError) -> Result<(), StageError> {
        self.synth_tx = None;
        if !error.is_recoverable() || !self.synthesizer_retry {
            return Err(error);
        }
        self.synthesizer_retry = false;
        warn!(%error, "Synthesizer failed, reconnecting once");
        // Whatever was being spoken is lost with the old session.
        if let Some(interrupted) = self.controller.interrupt() {
            self.discard_response(interrupted);
        }
        self.open_synthesizer().await
    }

    // ---- user side ----

    fn on_audio(&mut self, frame: AudioFrame) {
        if let FloorEvent::BargeIn { interrupted, .. } = self.controller.observe_audio(&frame) {
            self.discard_response(interrupted);
        }
        let Some(audio_tx) = &self.audio_tx else {
            return;
        };
        if let Err(mpsc::error::TrySendError::Full(_)) = audio_tx.try_send(frame) {
            self.dropped_frames += 1;
            if self.dropped_frames.is_power_of_two() {
                warn!(dropped = self.dropped_frames, "Recognizer is behind, dropping inbound audio");
            }
        }
    }

    fn on_user_activity(&mut self) {
        if let FloorEvent::BargeIn { interrupted, .. } = self.controller.on_user_activity() {
            self.discard_response(interrupted);
        }
    }

    async fn on_transcript(&mut self, fragment: TranscriptFragment) {
        let text = fragment.text.trim().to_string();
        if !fragment.is_final {
            if text.is_empty() {
                return;
            }
            self.on_user_activity();
            if self
                .forced_final
                .as_deref()
                .is_some_and(|forced| !same_utterance(forced, &text))
            {
                self.forced_final = None;
            }
            self.hypothesis = Some(text.clone());
            self.stall_deadline = Some(Instant::now() + self.config.utterance_timeout);
            self.emit(MediaEvent::Transcript {
                text,
                is_final: false,
            });
            return;
        }

        self.stall_deadline = None;
        self.hypothesis = None;
        if text.is_empty() {
            return;
        }
        if self
            .forced_final
            .take()
            .is_some_and(|forced| same_utterance(&forced, &text))
        {
            debug!("Final transcript matches timed-out utterance, ignoring");
            return;
        }
        self.on_user_activity();
        self.emit(MediaEvent::Transcript {
            text: text.clone(),
            is_final: true,
        });
        self.finish_user_turn(text, true).await;
    }

    async fn on_stalled_utterance(&mut self) {
        self.stall_deadline = None;
        let Some(text) = self.hypothesis.take() else {
            return;
        };
        info!(
            timeout_ms = self.config.utterance_timeout.as_millis() as u64,
            "No final transcript in time, finalizing provisional text"
        );
        self.forced_final = Some(text.clone());
        self.emit(MediaEvent::Transcript {
            text: text.clone(),
            is_final: true,
        });
        self.finish_user_turn(text, true).await;
    }

    /// Records a user turn and, when `respond` is set, starts the agent reply.
    ///
    /// With barge-in disabled the agent keeps the floor: the reply waits until
    /// the current response has been spoken.
    async fn finish_user_turn(&mut self, text: String, respond: bool) {
        let history = self.context.recent(self.config.history_window).await;
        self.commit(Turn::user(text.clone())).await;
        if !respond {
            return;
        }
        if !self.config.barge_in.enabled && self.controller.floor() == Floor::Agent {
            debug!("Agent holds the floor, deferring reply");
            self.deferred = Some(text);
            return;
        }
        self.start_response(history, text);
    }

    /// Starts the reply held back by [`Self::finish_user_turn`], if any.
    async fn start_deferred(&mut self) {
        let Some(text) = self.deferred.take() else {
            return;
        };
        // The user turn is already in context; the responder gets it separately.
        let window = self.config.history_window;
        let mut history = self.context.recent(window.map(|n| n + 1)).await;
        if let Some(own) = history
            .iter()
            .rposition(|turn| turn.speaker == Speaker::User && turn.content == text)
        {
            history.remove(own);
        }
        if let Some(window) = window {
            let excess = history.len().saturating_sub(window);
            history.drain(..excess);
        }
        self.start_response(history, text);
    }

    async fn commit(&mut self, turn: Turn) {
        match self.context.append(turn).await {
            Ok(Some(stored)) => {
                info!(speaker = %stored.speaker, turn_id = %stored.id, "Turn finalized");
                self.recorder.record(&self.session_id, &stored);
            }
            Ok(None) => debug!("Turn already in context"),
            Err(e) => warn!(error = %e, "Turn rejected by context"),
        }
    }

    // ---- agent side ----

    fn start_response(&mut self, history: Vec<Turn>, user_text: String) {
        let (generation, superseded) = self.controller.begin_response();
        if let Some(old) = superseded {
            self.discard_response(old);
        }
        let Some(synth) = self.synth_tx.clone() else {
            warn!(%generation, "No synthesizer session, skipping response");
            self.controller.response_finished(generation);
            return;
        };
        self.pending = Some(PendingTurn::new(generation));
        let task = stream_response(
            self.stages.responder.clone(),
            history,
            user_text,
            generation,
            self.controller.gate().clone(),
            synth,
            self.control_tx.clone(),
        )
        .instrument(tracing::info_span!("response", %generation));
        self.responding = Some((generation, tokio::spawn(task)));
    }

    /// Commits the agent turn of `generation` once, from whichever of the
    /// response or synthesis completions arrives first.
    async fn finalize_agent_turn(&mut self, generation: Generation) {
        if self
            .pending
            .as_ref()
            .is_some_and(|pending| pending.generation == generation)
        {
            if let Some(turn) = self.pending.take().and_then(PendingTurn::finalize) {
                self.commit(turn).await;
            }
        }
    }

    /// Drops everything belonging to `generation`. The gate has already moved
    /// past it, so late output is rejected downstream.
    fn discard_response(&mut self, generation: Generation) {
        if self
            .responding
            .as_ref()
            .is_some_and(|(owner, _)| *owner <= generation)
        {
            if let Some((_, task)) = self.responding.take() {
                task.abort();
            }
        }
        if self
            .pending
            .as_ref()
            .is_some_and(|pending| pending.generation == generation)
        {
            self.pending = None;
            debug!(%generation, "Discarded unfinished agent turn");
        }
        self.emit(MediaEvent::Interrupted { generation });
    }

    async fn on_control(&mut self, control: Control) -> Result<(), StageError> {
        match control {
            Control::Fragment { generation, text } => {
                if let Some(pending) = self
                    .pending
                    .as_mut()
                    .filter(|pending| pending.generation == generation)
                {
                    pending.push(&text);
                    self.emit(MediaEvent::ResponseChunk { generation, text });
                }
            }
            Control::ResponseDone { generation } => {
                self.release_responder(generation);
                self.finalize_agent_turn(generation).await;
            }
            Control::ResponseFailed { generation, error } => {
                if self.controller.active_response() != Some(generation) {
                    return Ok(());
                }
                self.release_responder(generation);
                self.pending = None;
                if !error.is_recoverable() {
                    return Err(error);
                }
                warn!(%generation, %error, "Response failed after retry");
                self.controller.response_finished(generation);
                self.emit(MediaEvent::Error {
                    message: error.to_string(),
                });
                self.start_deferred().await;
            }
            Control::SynthesisStarted { generation } => {
                if self.controller.synthesis_started(generation) {
                    self.emit(MediaEvent::AgentSpeaking { generation });
                }
            }
            Control::SynthesisDone { generation } => {
                self.synthesizer_retry = true;
                if self.controller.response_finished(generation) {
                    // Every fragment was reported before the flush that led here.
                    self.finalize_agent_turn(generation).await;
                    self.emit(MediaEvent::AgentDone { generation });
                    self.start_deferred().await;
                }
            }
            Control::SynthesisFailed(error) => self.reopen_synthesizer(error).await?,
        }
        Ok(())
    }

    // ---- teardown ----

    async fn drain(mut self) -> PipelineOutcome {
        self.set_state(PipelineState::Draining);
        info!("Pipeline draining");
        self.stop_stages();
        self.collect_final_transcripts().await;
        if let Some(text) = self.hypothesis.take() {
            if !self
                .forced_final
                .as_deref()
                .is_some_and(|forced| same_utterance(forced, &text))
            {
                self.finish_user_turn(text, false).await;
            }
        }
        self.join_forwarder().await;
        self.set_state(PipelineState::Closed);
        info!(dropped_frames = self.dropped_frames, "Pipeline closed");
        PipelineOutcome::closed()
    }

    async fn fail(mut self, error: StageError) -> PipelineOutcome {
        error!(%error, "Pipeline errored");
        self.emit(MediaEvent::Error {
            message: error.to_string(),
        });
        self.stop_stages();
        self.transcripts = None;
        self.join_forwarder().await;
        self.set_state(PipelineState::Errored);
        PipelineOutcome::errored(error)
    }

    /// Signals every stage and the transport to stop. Closing the audio and
    /// text queues ends the adapter sessions.
    fn stop_stages(&mut self) {
        self.stage_cancel.cancel();
        self.closed.cancel();
        self.audio_tx = None;
        self.synth_tx = None;
        self.stall_deadline = None;
        self.deferred = None;
        if let Some((_, task)) = self.responding.take() {
            task.abort();
        }
        if let Some(pending) = self.pending.take() {
            debug!(generation = %pending.generation, "Dropping unfinished agent turn on shutdown");
        }
    }

    /// Commits final fragments the recognizer still delivers after its input
    /// closed, without starting responses.
    async fn collect_final_transcripts(&mut self) {
        let Some(mut transcripts) = self.transcripts.take() else {
            return;
        };
        let deadline = Instant::now() + self.config.drain_timeout;
        loop {
            match tokio::time::timeout_at(deadline, transcripts.next()).await {
                Ok(Some(Ok(fragment))) => {
                    let text = fragment.text.trim().to_string();
                    if !fragment.is_final {
                        if !text.is_empty() {
                            self.hypothesis = Some(text);
                        }
                        continue;
                    }
                    self.hypothesis = None;
                    let repeated = self
                        .forced_final
                        .take()
                        .is_some_and(|forced| same_utterance(&forced, &text));
                    if text.is_empty() || repeated {
                        continue;
                    }
                    self.finish_user_turn(text, false).await;
                }
                Ok(Some(Err(error))) => {
                    warn!(%error, "Recognizer failed while draining");
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    warn!("Recognizer did not finish within drain timeout, abandoning it");
                    break;
                }
            }
        }
    }

    async fn join_forwarder(&mut self) {
        let Some(mut forwarder) = self.forwarder.take() else {
            return;
        };
        if tokio::time::timeout(self.config.drain_timeout, &mut forwarder)
            .await
            .is_err()
        {
            warn!("Synthesis forwarder did not stop within drain timeout, abandoning it");
            forwarder.abort();
        }
    }

    /// Forgets the response task once `generation` has finished with it. A
    /// late report from an older generation leaves the newer task in place.
    fn release_responder(&mut self, generation: Generation) {
        if self
            .responding
            .as_ref()
            .is_some_and(|(owner, _)| *owner == generation)
        {
            self.responding = None;
        }
    }

    fn set_state(&self, state: PipelineState) {
        self.state.send_replace(state);
    }

    fn emit(&self, event: MediaEvent) {
        if let Err(e) = self.outbound.try_send(event) {
            trace!(error = %e, "Dropping transport event");
        }
    }
}

/// Streams one agent response to the synthesizer and reports each fragment
/// back to the run loop. Stops as soon as `generation` is superseded.
async fn stream_response(
    responder: Arc<dyn Responder>,
    history: Vec<Turn>,
    user_text: String,
    generation: Generation,
    gate: GenerationGate,
    synth: mpsc::Sender<SynthesisRequest>,
    control: mpsc::Sender<Control>,
) {
    let opened = with_single_retry(StageKind::Responder, || {
        responder.respond(&history, &user_text)
    })
    .await;
    let mut fragments = match opened {
        Ok(fragments) => fragments,
        Err(error) => {
            let _ = control
                .send(Control::ResponseFailed { generation, error })
                .await;
            return;
        }
    };

    while let Some(item) = fragments.next().await {
        if !gate.is_current(generation) {
            debug!("Response superseded, stopping");
            return;
        }
        match item {
            Ok(text) if text.is_empty() => continue,
            Ok(text) => {
                let request = SynthesisRequest::Text {
                    generation,
                    text: text.clone(),
                };
                if synth.send(request).await.is_err() {
                    return;
                }
                if control
                    .send(Control::Fragment { generation, text })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Err(error) => {
                let _ = control
                    .send(Control::ResponseFailed { generation, error })
                    .await;
                return;
            }
        }
    }

    if !gate.is_current(generation) {
        return;
    }
    let _ = synth.send(SynthesisRequest::Flush { generation }).await;
    let _ = control.send(Control::ResponseDone { generation }).await;
}

/// Whether two transcripts are the same words, ignoring case, punctuation
/// and spacing. Recognizers often re-punctuate an utterance when finalizing.
fn same_utterance(a: &str, b: &str) -> bool {
    let words = |text: &str| {
        text.chars()
            .filter(|c| c.is_alphanumeric())
            .flat_map(char::to_lowercase)
            .collect::<String>()
    };
    words(a) == words(b)
}

/// Next item of an optional stream; pending forever when there is none.
async fn next_item<S>(stream: &mut Option<S>) -> Option<S::Item>
where
    S: Stream + Unpin,
{
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
