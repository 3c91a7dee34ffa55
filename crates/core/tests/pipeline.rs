mod common;

use common::{WAIT, eventually, expect_event};
use async_trait::async_trait;
use futures::stream;
use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::sync::{Semaphore, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use vaani_core::{
    audio::{AudioFrame, INBOUND_SAMPLE_RATE, OUTBOUND_SAMPLE_RATE, TaggedFrame, encode_pcm16},
    context::ContextAccumulator,
    floor::GenerationGate,
    mock::{ChannelRecognizer, ChannelResponder, MockSynthesizer, ResponseCall, TranscriptFeed},
    persistence::{InMemoryGateway, PersistenceGateway, Recorder},
    pipeline::{Pipeline, PipelineConfig, PipelineParts, PipelineState},
    stage::{
        StageError, StageKind, StageSet, StageStream, SynthesisOutput, SynthesisRequest,
        Synthesizer,
    },
    transport::{MediaEvent, PeerEnd, media_channel},
    turn::{Generation, Speaker},
};

struct Harness {
    feed: TranscriptFeed,
    recognizer: Arc<ChannelRecognizer>,
    calls: mpsc::UnboundedReceiver<ResponseCall>,
    peer: PeerEnd,
    pipeline: Pipeline,
    context: Arc<ContextAccumulator>,
    gateway: Arc<InMemoryGateway>,
}

fn harness(config: PipelineConfig) -> Harness {
    harness_with(config, Arc::new(MockSynthesizer))
}

fn harness_with(config: PipelineConfig, synthesizer: Arc<dyn Synthesizer>) -> Harness {
    let (recognizer, feed) = ChannelRecognizer::new();
    let recognizer = Arc::new(recognizer);
    let (responder, calls) = ChannelResponder::new();
    let stages = StageSet {
        recognizer: recognizer.clone(),
        responder: Arc::new(responder),
        synthesizer,
    };
    let (channel, peer) = media_channel(64, 256);
    let context = Arc::new(ContextAccumulator::new());
    let gateway = Arc::new(InMemoryGateway::new());
    let (recorder, _writer) = Recorder::spawn(gateway.clone(), 64);
    let pipeline = Pipeline::spawn(
        "session-1",
        channel,
        PipelineParts {
            stages,
            context: context.clone(),
            recorder,
            config,
        },
        None,
    );
    Harness {
        feed,
        recognizer,
        calls,
        peer,
        pipeline,
        context,
        gateway,
    }
}

async fn next_call(calls: &mut mpsc::UnboundedReceiver<ResponseCall>) -> ResponseCall {
    tokio::time::timeout(WAIT, calls.recv())
        .await
        .expect("timed out waiting for responder call")
        .expect("responder closed")
}

async fn wait_for_state(pipeline: &Pipeline, state: PipelineState) {
    let mut rx = pipeline.subscribe();
    tokio::time::timeout(WAIT, rx.wait_for(|s| *s == state))
        .await
        .expect("timed out waiting for pipeline state")
        .expect("pipeline state channel closed");
}

fn voiced_frame(ms: u64) -> AudioFrame {
    let samples = (INBOUND_SAMPLE_RATE as u64 * ms / 1000) as usize;
    AudioFrame::new(encode_pcm16(&vec![0.3; samples]), INBOUND_SAMPLE_RATE)
}

#[tokio::test]
async fn test_final_transcript_produces_ordered_turns() {
    let mut h = harness(PipelineConfig::default());
    wait_for_state(&h.pipeline, PipelineState::Running).await;

    h.feed.provisional("hel");
    h.feed.final_text("hello");
    let call = next_call(&mut h.calls).await;
    assert_eq!(call.user_text, "hello");
    assert!(call.history.is_empty());

    call.reply.send(Ok("Hi ".into())).unwrap();
    call.reply.send(Ok("there.".into())).unwrap();
    drop(call);

    expect_event(&mut h.peer, |e| matches!(e, MediaEvent::AgentDone { .. })).await;
    let context = h.context.clone();
    eventually(|| {
        let context = context.clone();
        async move { context.len().await == 2 }
    })
    .await;

    let turns = h.context.snapshot().await;
    assert_eq!(turns[0].speaker, Speaker::User);
    assert_eq!(turns[0].content, "hello");
    assert_eq!(turns[1].speaker, Speaker::Agent);
    assert_eq!(turns[1].content, "Hi there.");
    assert!(turns[0].timestamp <= turns[1].timestamp);

    let outcome = h.pipeline.drain().await;
    assert_eq!(outcome.state, PipelineState::Closed);

    let gateway = h.gateway.clone();
    eventually(|| {
        let gateway = gateway.clone();
        async move { gateway.read_all("session-1").await.unwrap().len() == 2 }
    })
    .await;
}

#[tokio::test]
async fn test_barge_in_discards_interrupted_turn() {
    let mut h = harness(PipelineConfig::default());
    wait_for_state(&h.pipeline, PipelineState::Running).await;

    h.feed.final_text("tell me a story");
    let first = next_call(&mut h.calls).await;
    first.reply.send(Ok("Once upon a time".into())).unwrap();
    let speaking =
        expect_event(&mut h.peer, |e| matches!(e, MediaEvent::AgentSpeaking { .. })).await;
    assert_eq!(
        speaking,
        MediaEvent::AgentSpeaking {
            generation: Generation(1)
        }
    );

    // The user talks over the agent.
    h.feed.provisional("wait");
    expect_event(&mut h.peer, |e| {
        matches!(e, MediaEvent::Interrupted { generation } if *generation == Generation(1))
    })
    .await;
    let _ = first.reply.send(Ok(" there was a dragon".into()));
    drop(first);

    h.feed.final_text("wait, stop");
    let second = next_call(&mut h.calls).await;
    assert_eq!(second.user_text, "wait, stop");
    assert_eq!(second.history.len(), 1);
    second.reply.send(Ok("Okay.".into())).unwrap();
    drop(second);

    let context = h.context.clone();
    eventually(|| {
        let context = context.clone();
        async move { context.len().await == 3 }
    })
    .await;

    let turns = h.context.snapshot().await;
    let contents: Vec<_> = turns.iter().map(|t| t.content.as_str()).collect();
    assert_eq!(contents, vec!["tell me a story", "wait, stop", "Okay."]);
    assert!(!turns.iter().any(|t| t.content.contains("Once upon")));

    // Nothing from the interrupted generation reaches the client afterwards.
    h.pipeline.drain().await;
    while let Some(event) = h.peer.next_event().await {
        if let MediaEvent::Audio(tagged) = event {
            assert_ne!(tagged.generation, Generation(1));
        }
    }
}

#[tokio::test]
async fn test_sustained_audio_barges_in() {
    let mut h = harness(PipelineConfig::default());
    wait_for_state(&h.pipeline, PipelineState::Running).await;

    h.feed.final_text("go on");
    let call = next_call(&mut h.calls).await;
    call.reply.send(Ok("Sure, ".into())).unwrap();
    expect_event(&mut h.peer, |e| matches!(e, MediaEvent::AgentSpeaking { .. })).await;

    // Two 100 ms voiced frames reach the default 200 ms threshold.
    assert!(h.peer.offer_frame(voiced_frame(100)));
    assert!(h.peer.offer_frame(voiced_frame(100)));
    expect_event(&mut h.peer, |e| matches!(e, MediaEvent::Interrupted { .. })).await;
    drop(call);

    let feed = h.feed.clone();
    eventually(|| {
        let feed = feed.clone();
        async move { feed.frames() == 2 }
    })
    .await;
    let turns = h.context.snapshot().await;
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].speaker, Speaker::User);
    h.pipeline.drain().await;
}

/// Synthesizer that speaks one request per permit handed out by the test,
/// like an engine that is busy with the previous sentence.
#[derive(Clone)]
struct SlowSynthesizer {
    engine: Arc<Semaphore>,
    seen: Arc<AtomicUsize>,
    spoken: Arc<Mutex<Vec<(Generation, String)>>>,
}

impl Default for SlowSynthesizer {
    fn default() -> Self {
        Self {
            engine: Arc::new(Semaphore::new(0)),
            seen: Arc::default(),
            spoken: Arc::default(),
        }
    }
}

#[async_trait]
impl Synthesizer for SlowSynthesizer {
    async fn synthesize(
        &self,
        mut requests: mpsc::Receiver<SynthesisRequest>,
        gate: GenerationGate,
    ) -> Result<StageStream<SynthesisOutput>, StageError> {
        let (tx, rx) = mpsc::channel(32);
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                let Ok(permit) = this.engine.acquire().await else {
                    break;
                };
                permit.forget();
                let stale = !gate.is_current(request.generation());
                let output = match request {
                    _ if stale => None,
                    SynthesisRequest::Text { generation, text } => {
                        this.spoken.lock().unwrap().push((generation, text.clone()));
                        Some(SynthesisOutput::Audio(TaggedFrame {
                            generation,
                            frame: AudioFrame::new(text.into_bytes(), OUTBOUND_SAMPLE_RATE),
                        }))
                    }
                    SynthesisRequest::Flush { generation } => {
                        Some(SynthesisOutput::Done { generation })
                    }
                };
                this.seen.fetch_add(1, Ordering::SeqCst);
                if let Some(output) = output {
                    if tx.send(Ok(output)).await.is_err() {
                        break;
                    }
                }
            }
        });
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

#[tokio::test]
async fn test_barge_in_stops_synthesis_of_queued_text() {
    let synthesizer = SlowSynthesizer::default();
    let mut h = harness_with(PipelineConfig::default(), Arc::new(synthesizer.clone()));
    wait_for_state(&h.pipeline, PipelineState::Running).await;

    h.feed.final_text("read me the list");
    let call = next_call(&mut h.calls).await;
    for i in 0..10 {
        call.reply.send(Ok(format!("item {i}. "))).unwrap();
    }
    for _ in 0..10 {
        expect_event(&mut h.peer, |e| matches!(e, MediaEvent::ResponseChunk { .. })).await;
    }

    synthesizer.engine.add_permits(1);
    expect_event(&mut h.peer, |e| matches!(e, MediaEvent::AgentSpeaking { .. })).await;
    h.feed.provisional("stop");
    expect_event(&mut h.peer, |e| matches!(e, MediaEvent::Interrupted { .. })).await;

    // The engine frees up; what is left in its queue is stale.
    synthesizer.engine.add_permits(9);
    let seen = synthesizer.seen.clone();
    eventually(|| {
        let seen = seen.clone();
        async move { seen.load(Ordering::SeqCst) == 10 }
    })
    .await;
    let spoken = synthesizer.spoken.lock().unwrap().clone();
    assert_eq!(spoken, vec![(Generation(1), "item 0. ".to_string())]);
    drop(call);
    h.pipeline.drain().await;
}

#[tokio::test]
async fn test_barge_in_disabled_lets_agent_finish() {
    let mut config = PipelineConfig::default();
    config.barge_in.enabled = false;
    let mut h = harness(config);
    wait_for_state(&h.pipeline, PipelineState::Running).await;

    h.feed.final_text("go on");
    let call = next_call(&mut h.calls).await;
    call.reply.send(Ok("Sure.".into())).unwrap();
    expect_event(&mut h.peer, |e| matches!(e, MediaEvent::AgentSpeaking { .. })).await;
    h.feed.provisional("hmm");
    drop(call);

    expect_event(&mut h.peer, |e| matches!(e, MediaEvent::AgentDone { .. })).await;
    let context = h.context.clone();
    eventually(|| {
        let context = context.clone();
        async move { context.len().await == 2 }
    })
    .await;
    h.pipeline.drain().await;
}

#[tokio::test(start_paused = true)]
async fn test_stalled_provisional_is_finalized_once() {
    let config = PipelineConfig {
        utterance_timeout: Duration::from_secs(2),
        ..PipelineConfig::default()
    };
    let mut h = harness(config);
    wait_for_state(&h.pipeline, PipelineState::Running).await;

    h.feed.provisional("are you there");
    let call = next_call(&mut h.calls).await;
    assert_eq!(call.user_text, "are you there");

    // The recognizer catches up with the same text; it must not count twice.
    h.feed.final_text("are you there");
    call.reply.send(Ok("Yes.".into())).unwrap();
    drop(call);

    let context = h.context.clone();
    eventually(|| {
        let context = context.clone();
        async move { context.len().await == 2 }
    })
    .await;
    h.pipeline.drain().await;

    let contents: Vec<_> = h
        .context
        .snapshot()
        .await
        .into_iter()
        .map(|t| t.content)
        .collect();
    assert_eq!(contents, vec!["are you there", "Yes."]);
    assert!(h.calls.try_recv().is_err());
}

#[tokio::test]
async fn test_drain_flushes_pending_utterance() {
    let mut h = harness(PipelineConfig::default());
    wait_for_state(&h.pipeline, PipelineState::Running).await;

    h.feed.provisional("half a thought");
    expect_event(&mut h.peer, |e| {
        matches!(e, MediaEvent::Transcript { is_final: false, .. })
    })
    .await;

    let state = h.pipeline.subscribe();
    let outcome = h.pipeline.drain().await;
    assert_eq!(outcome.state, PipelineState::Closed);
    assert_eq!(*state.borrow(), PipelineState::Closed);

    let turns = h.context.snapshot().await;
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].content, "half a thought");
    assert!(h.calls.try_recv().is_err());
}

#[tokio::test]
async fn test_fatal_stage_error_moves_to_errored() {
    let mut h = harness(PipelineConfig::default());
    wait_for_state(&h.pipeline, PipelineState::Running).await;

    h.feed
        .fail(StageError::fatal(StageKind::Recognizer, "invalid credentials"));
    expect_event(&mut h.peer, |e| matches!(e, MediaEvent::Error { .. })).await;
    wait_for_state(&h.pipeline, PipelineState::Errored).await;

    let outcome = h.pipeline.drain().await;
    assert_eq!(outcome.state, PipelineState::Errored);
    assert!(matches!(outcome.error, Some(StageError::Fatal { .. })));
    assert!(h.peer.closed.is_cancelled());
}

#[tokio::test]
async fn test_transient_recognizer_error_reconnects_once() {
    let mut h = harness(PipelineConfig::default());
    wait_for_state(&h.pipeline, PipelineState::Running).await;
    assert_eq!(h.recognizer.sessions(), 1);

    h.feed
        .fail(StageError::transient(StageKind::Recognizer, "socket reset"));
    let recognizer = h.recognizer.clone();
    eventually(|| {
        let recognizer = recognizer.clone();
        async move { recognizer.sessions() == 2 }
    })
    .await;

    h.feed.final_text("still here");
    let call = next_call(&mut h.calls).await;
    assert_eq!(call.user_text, "still here");
    drop(call);
    assert_eq!(h.pipeline.state(), PipelineState::Running);
    h.pipeline.drain().await;
}

#[tokio::test]
async fn test_transport_close_ends_pipeline() {
    let h = harness(PipelineConfig::default());
    wait_for_state(&h.pipeline, PipelineState::Running).await;
    h.peer.close();
    wait_for_state(&h.pipeline, PipelineState::Closed).await;
    assert!(h.pipeline.drain().await.error.is_none());
}

#[tokio::test]
async fn test_barge_in_disabled_defers_reply_until_agent_finishes() {
    let mut config = PipelineConfig::default();
    config.barge_in.enabled = false;
    let mut h = harness(config);
    wait_for_state(&h.pipeline, PipelineState::Running).await;

    h.feed.final_text("go on");
    let first = next_call(&mut h.calls).await;
    first.reply.send(Ok("Sure.".into())).unwrap();
    expect_event(&mut h.peer, |e| matches!(e, MediaEvent::AgentSpeaking { .. })).await;

    // Spoken while the agent still holds the floor.
    h.feed.final_text("and then?");
    let context = h.context.clone();
    eventually(|| {
        let context = context.clone();
        async move { context.len().await == 2 }
    })
    .await;
    assert!(h.calls.try_recv().is_err());

    drop(first);
    expect_event(&mut h.peer, |e| {
        matches!(e, MediaEvent::AgentDone { generation } if *generation == Generation(1))
    })
    .await;
    let second = next_call(&mut h.calls).await;
    assert_eq!(second.user_text, "and then?");
    let history: Vec<_> = second.history.iter().map(|t| t.content.as_str()).collect();
    assert_eq!(history, vec!["go on", "Sure."]);
    second.reply.send(Ok("Then it ended.".into())).unwrap();
    drop(second);

    let context = h.context.clone();
    eventually(|| {
        let context = context.clone();
        async move { context.len().await == 4 }
    })
    .await;
    let contents: Vec<_> = h
        .context
        .snapshot()
        .await
        .into_iter()
        .map(|t| t.content)
        .collect();
    assert_eq!(contents, vec!["go on", "and then?", "Sure.", "Then it ended."]);
    h.pipeline.drain().await;
}

#[tokio::test]
async fn test_recoverable_responder_error_keeps_call_running() {
    let mut h = harness(PipelineConfig::default());
    wait_for_state(&h.pipeline, PipelineState::Running).await;

    h.feed.final_text("hi");
    let call = next_call(&mut h.calls).await;
    call.reply.send(Ok("Hel".into())).unwrap();
    call.reply
        .send(Err(StageError::transient(StageKind::Responder, "upstream hiccup")))
        .unwrap();
    let error = expect_event(&mut h.peer, |e| matches!(e, MediaEvent::Error { .. })).await;
    assert!(matches!(error, MediaEvent::Error { message } if message.contains("upstream hiccup")));
    assert_eq!(h.pipeline.state(), PipelineState::Running);

    h.feed.final_text("hello again");
    let retry = next_call(&mut h.calls).await;
    assert_eq!(retry.user_text, "hello again");
    retry.reply.send(Ok("Hello.".into())).unwrap();
    drop(retry);
    drop(call);

    let context = h.context.clone();
    eventually(|| {
        let context = context.clone();
        async move { context.len().await == 3 }
    })
    .await;
    let contents: Vec<_> = h
        .context
        .snapshot()
        .await
        .into_iter()
        .map(|t| t.content)
        .collect();
    assert_eq!(contents, vec!["hi", "hello again", "Hello."]);
    h.pipeline.drain().await;
}

#[tokio::test]
async fn test_greeting_is_spoken_without_a_user_turn() {
    let config = PipelineConfig {
        greeting: Some("Greet the caller.".into()),
        ..PipelineConfig::default()
    };
    let mut h = harness(config);

    let call = next_call(&mut h.calls).await;
    assert_eq!(call.user_text, "Greet the caller.");
    assert!(call.history.is_empty());
    call.reply.send(Ok("Welcome!".into())).unwrap();
    drop(call);

    expect_event(&mut h.peer, |e| matches!(e, MediaEvent::AgentDone { .. })).await;
    let context = h.context.clone();
    eventually(|| {
        let context = context.clone();
        async move { context.len().await == 1 }
    })
    .await;
    let turns = h.context.snapshot().await;
    assert_eq!(turns[0].speaker, Speaker::Agent);
    assert_eq!(turns[0].content, "Welcome!");
    h.pipeline.drain().await;
}

/// Synthesizer whose first session breaks on its first request.
#[derive(Default)]
struct FlakySynthesizer {
    sessions: AtomicUsize,
}

#[async_trait]
impl Synthesizer for FlakySynthesizer {
    async fn synthesize(
        &self,
        mut requests: mpsc::Receiver<SynthesisRequest>,
        gate: GenerationGate,
    ) -> Result<StageStream<SynthesisOutput>, StageError> {
        if self.sessions.fetch_add(1, Ordering::SeqCst) > 0 {
            return MockSynthesizer.synthesize(requests, gate).await;
        }
        Ok(Box::pin(stream::once(async move {
            let _ = requests.recv().await;
            Err::<SynthesisOutput, _>(StageError::transient(
                StageKind::Synthesizer,
                "voice socket reset",
            ))
        })))
    }
}

#[tokio::test]
async fn test_transient_synthesizer_error_reconnects_once() {
    let synthesizer = Arc::new(FlakySynthesizer::default());
    let mut h = harness_with(PipelineConfig::default(), synthesizer.clone());
    wait_for_state(&h.pipeline, PipelineState::Running).await;

    h.feed.final_text("hello");
    let call = next_call(&mut h.calls).await;
    call.reply.send(Ok("Hi.".into())).unwrap();
    expect_event(&mut h.peer, |e| {
        matches!(e, MediaEvent::Interrupted { generation } if *generation == Generation(1))
    })
    .await;
    let sessions = synthesizer.clone();
    eventually(|| {
        let sessions = sessions.clone();
        async move { sessions.sessions.load(Ordering::SeqCst) == 2 }
    })
    .await;
    drop(call);
    assert_eq!(h.pipeline.state(), PipelineState::Running);

    h.feed.final_text("are you back");
    let call = next_call(&mut h.calls).await;
    call.reply.send(Ok("Yes.".into())).unwrap();
    drop(call);
    expect_event(&mut h.peer, |e| matches!(e, MediaEvent::AgentDone { .. })).await;
    h.pipeline.drain().await;
}
