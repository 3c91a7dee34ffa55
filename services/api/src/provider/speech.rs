//! Speech synthesis through the OpenAI speech endpoint.

use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{CreateSpeechRequestArgs, SpeechModel, SpeechResponseFormat, Voice},
};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{Instrument, debug};
use vaani_core::{
    audio::{AudioFrame, OUTBOUND_SAMPLE_RATE, TaggedFrame},
    floor::GenerationGate,
    llm_client::classify,
    sentence::SentenceAggregator,
    stage::{StageError, StageKind, StageStream, SynthesisOutput, SynthesisRequest, Synthesizer},
    turn::Generation,
};

/// Sentences shorter than this are joined with the next one.
const MIN_SENTENCE_CHARS: usize = 12;
/// 100 ms of 24 kHz PCM16 per outbound frame.
const FRAME_BYTES: usize = OUTBOUND_SAMPLE_RATE as usize / 10 * 2;

type OutputResult = Result<SynthesisOutput, StageError>;

pub struct OpenAISpeechSynthesizer {
    client: Client<OpenAIConfig>,
    voice: Voice,
}

impl OpenAISpeechSynthesizer {
    pub fn new(api_key: String) -> Self {
        Self {
            client: Client::with_config(OpenAIConfig::new().with_api_key(api_key)),
            voice: Voice::Alloy,
        }
    }
}

/// Splits raw PCM into fixed-size outbound frames, keeping sample alignment.
fn frames(pcm: Bytes, generation: Generation) -> impl Iterator<Item = SynthesisOutput> {
    let len = pcm.len() - pcm.len() % 2;
    (0..len).step_by(FRAME_BYTES).map(move |start| {
        let end = (start + FRAME_BYTES).min(len);
        SynthesisOutput::Audio(TaggedFrame {
            generation,
            frame: AudioFrame::new(pcm.slice(start..end), OUTBOUND_SAMPLE_RATE),
        })
    })
}

struct SpeechSession {
    client: Client<OpenAIConfig>,
    voice: Voice,
    output: mpsc::Sender<OutputResult>,
    gate: GenerationGate,
    current: Option<(Generation, SentenceAggregator)>,
}

impl SpeechSession {
    async fn run(mut self, mut requests: mpsc::Receiver<SynthesisRequest>) {
        while let Some(request) = requests.recv().await {
            let generation = request.generation();
            if !self.gate.is_current(generation) {
                debug!(%generation, "Skipping text of an interrupted response");
                self.discard(generation);
                continue;
            }
            let outcome = match request {
                SynthesisRequest::Text { generation, text } => {
                    let sentences = self.aggregator(generation).push(&text);
                    self.speak_all(generation, sentences).await
                }
                SynthesisRequest::Flush { generation } => self.finish(generation).await,
            };
            if let Err(error) = outcome {
                let _ = self.output.send(Err(error)).await;
                return;
            }
            if self.output.is_closed() {
                return;
            }
        }
    }

    /// A new generation supersedes whatever text the previous one left.
    fn aggregator(&mut self, generation: Generation) -> &mut SentenceAggregator {
        let current = self
            .current
            .get_or_insert_with(|| (generation, SentenceAggregator::new(MIN_SENTENCE_CHARS)));
        if current.0 != generation {
            *current = (generation, SentenceAggregator::new(MIN_SENTENCE_CHARS));
        }
        &mut current.1
    }

    fn discard(&mut self, generation: Generation) {
        if self.current.as_ref().is_some_and(|(g, _)| *g == generation) {
            self.current = None;
        }
    }

    async fn finish(&mut self, generation: Generation) -> Result<(), StageError> {
        let rest = match self.current.take() {
            Some((g, mut aggregator)) if g == generation => aggregator.flush(),
            other => {
                self.current = other;
                None
            }
        };
        self.speak_all(generation, rest.into_iter().collect()).await?;
        let _ = self
            .output
            .send(Ok(SynthesisOutput::Done { generation }))
            .await;
        Ok(())
    }

    async fn speak_all(
        &mut self,
        generation: Generation,
        sentences: Vec<String>,
    ) -> Result<(), StageError> {
        for sentence in sentences {
            if !self.gate.is_current(generation) {
                return Ok(());
            }
            debug!(%generation, chars = sentence.len(), "Synthesizing sentence");
            let request = CreateSpeechRequestArgs::default()
                .model(SpeechModel::Tts1)
                .voice(self.voice.clone())
                .input(sentence)
                .response_format(SpeechResponseFormat::Pcm)
                .build()
                .map_err(|e| classify(StageKind::Synthesizer, e))?;
            let response = self
                .client
                .audio()
                .speech(request)
                .await
                .map_err(|e| classify(StageKind::Synthesizer, e))?;
            for frame in frames(response.bytes, generation) {
                if self.output.send(Ok(frame)).await.is_err() {
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Synthesizer for OpenAISpeechSynthesizer {
    async fn synthesize(
        &self,
        requests: mpsc::Receiver<SynthesisRequest>,
        gate: GenerationGate,
    ) -> Result<StageStream<SynthesisOutput>, StageError> {
        let (tx, rx) = mpsc::channel(64);
        let session = SpeechSession {
            client: self.client.clone(),
            voice: self.voice.clone(),
            output: tx,
            gate,
            current: None,
        };
        tokio::spawn(session.run(requests).in_current_span());
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}
