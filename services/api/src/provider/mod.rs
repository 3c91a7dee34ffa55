//! Stage adapters selected by configuration.
//!
//! - `openai`: realtime transcription as the recognizer.
//! - `speech`: the speech endpoint as the synthesizer.
//!
//! Replies come from any OpenAI-compatible chat API through
//! [`OpenAICompatibleResponder`], with the built-in tools attached unless
//! disabled.

pub mod openai;
pub mod speech;

use crate::config::{Config, ResponderProvider, SpeechProvider};
use anyhow::{Context, Result};
use async_openai::config::OpenAIConfig;
use std::sync::Arc;
use tracing::{info, warn};
use vaani_core::{
    llm_client::{GEMINI_BASE_URL, GROQ_BASE_URL, OpenAICompatibleResponder},
    mock::{ChannelRecognizer, MockResponder, MockSynthesizer, TranscriptFeed},
    stage::{Responder, StageSet},
    tools::ToolBox,
};

/// The configured adapters. `transcript_feed` is set with mock speech and must
/// outlive the server, since dropping it ends every recognition session.
pub struct Stages {
    pub set: StageSet,
    pub transcript_feed: Option<TranscriptFeed>,
}

pub async fn build_stages(config: &Config, system_prompt: String) -> Result<Stages> {
    let responder: Arc<dyn Responder> = match config.responder_provider {
        ResponderProvider::Mock => {
            warn!("Using mock responder; replies echo the user.");
            Arc::new(MockResponder)
        }
        ref provider => {
            let openai_config = match provider {
                ResponderProvider::OpenAI => OpenAIConfig::new().with_api_key(
                    config
                        .openai_api_key
                        .as_deref()
                        .context("OPENAI_API_KEY is required")?,
                ),
                ResponderProvider::Groq => OpenAIConfig::new()
                    .with_api_key(
                        config
                            .groq_api_key
                            .as_deref()
                            .context("GROQ_API_KEY is required")?,
                    )
                    .with_api_base(GROQ_BASE_URL),
                _ => OpenAIConfig::new()
                    .with_api_key(
                        config
                            .gemini_api_key
                            .as_deref()
                            .context("GEMINI_API_KEY is required")?,
                    )
                    .with_api_base(GEMINI_BASE_URL),
            };
            info!(?provider, model = %config.chat_model, "Using chat responder.");
            let responder = OpenAICompatibleResponder::new(
                openai_config,
                config.chat_model.clone(),
                system_prompt,
            );
            if config.tools_enabled {
                let tools = ToolBox::start()
                    .await
                    .context("Failed to start agent tools")?;
                Arc::new(responder.with_tools(Arc::new(tools)))
            } else {
                Arc::new(responder)
            }
        }
    };

    let stages = match config.speech_provider {
        SpeechProvider::OpenAI => {
            let api_key = config
                .openai_api_key
                .clone()
                .context("OPENAI_API_KEY is required for speech")?;
            Stages {
                set: StageSet {
                    recognizer: Arc::new(openai::OpenAIRealtimeRecognizer::new(api_key.clone())),
                    responder,
                    synthesizer: Arc::new(speech::OpenAISpeechSynthesizer::new(api_key)),
                },
                transcript_feed: None,
            }
        }
        SpeechProvider::Mock => {
            warn!("Using mock speech; calls will not hear the user.");
            let (recognizer, feed) = ChannelRecognizer::new();
            Stages {
                set: StageSet {
                    recognizer: Arc::new(recognizer),
                    responder,
                    synthesizer: Arc::new(MockSynthesizer),
                },
                transcript_feed: Some(feed),
            }
        }
    };
    Ok(stages)
}
