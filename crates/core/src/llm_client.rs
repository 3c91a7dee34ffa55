use crate::{
    stage::{Responder, StageError, StageKind, StageStream},
    tools::ToolExecutor,
    turn::{Speaker, Turn},
};
use async_openai::{
    Client,
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestToolMessageArgs,
        ChatCompletionRequestUserMessageArgs, ChatCompletionTool, CreateChatCompletionRequestArgs,
    },
};
use async_trait::async_trait;
use futures::{Stream, StreamExt, stream};
use std::{pin::Pin, sync::Arc};
use tracing::{debug, info, warn};

/// Base URL of Groq's OpenAI-compatible API.
pub const GROQ_BASE_URL: &str = "https://api.groq.com/openai/v1";
/// Base URL of Gemini's OpenAI-compatible API.
pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/openai";

/// Model calls allowed per reply before giving up on tools.
pub const MAX_TOOL_ROUNDS: usize = 3;
/// Reply used when the model is still calling tools after [`MAX_TOOL_ROUNDS`].
pub const TOOLS_EXHAUSTED_REPLY: &str =
    "I'm having trouble retrieving that information right now. Please try again.";

const TEMPERATURE: f32 = 0.6;
const MAX_TOKENS: u32 = 1024;

/// Represents a tool call requested by the LLM.
pub type ToolCall = async_openai::types::ChatCompletionMessageToolCall;

/// A stream of text chunks from the LLM.
pub type LLMStream = Pin<Box<dyn Stream<Item = Result<String, OpenAIError>> + Send>>;

/// The two possible outcomes of a non-streaming model turn.
#[derive(Debug, Clone)]
pub enum LLMAction {
    /// The LLM decided to respond directly with text.
    TextResponse(String),
    /// The LLM decided to call one or more tools.
    ToolCall(Vec<ToolCall>),
}

/// A generic client for interacting with an LLM.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LLMClient: Send + Sync {
    /// Makes a single, non-streaming call that either answers or asks for
    /// tools. An empty `tools` list offers none.
    async fn decide_action(
        &self,
        messages: Vec<ChatCompletionRequestMessage>,
        tools: Vec<ChatCompletionTool>,
    ) -> Result<LLMAction, OpenAIError>;

    /// Streams a plain text answer.
    async fn stream_reply(
        &self,
        messages: Vec<ChatCompletionRequestMessage>,
    ) -> Result<LLMStream, OpenAIError>;
}

/// An implementation of `LLMClient` for any OpenAI-compatible API.
pub struct OpenAICompatibleClient {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAICompatibleClient {
    /// Creates a new client for an OpenAI-compatible service.
    ///
    /// # Arguments
    ///
    /// * `config` - API key and base URL of the service.
    /// * `model` - The model identifier to use for chat completions (e.g., "gpt-4o-mini").
    pub fn new(config: OpenAIConfig, model: String) -> Self {
        Self {
            client: Client::with_config(config),
            model,
        }
    }
}

#[async_trait]
impl LLMClient for OpenAICompatibleClient {
    async fn decide_action(
        &self,
        messages: Vec<ChatCompletionRequestMessage>,
        tools: Vec<ChatCompletionTool>,
    ) -> Result<LLMAction, OpenAIError> {
        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(&self.model)
            .messages(messages)
            .temperature(TEMPERATURE)
            .max_completion_tokens(MAX_TOKENS);
        if !tools.is_empty() {
            args.tools(tools).tool_choice("auto");
        }
        let request = args.build()?;

        debug!(model = %self.model, "Requesting completion");
        let response = self.client.chat().create(request).await?;
        let Some(choice) = response.choices.into_iter().next() else {
            return Ok(LLMAction::TextResponse(String::new()));
        };
        match choice.message.tool_calls {
            Some(tool_calls) if !tool_calls.is_empty() => Ok(LLMAction::ToolCall(tool_calls)),
            _ => Ok(LLMAction::TextResponse(
                choice.message.content.unwrap_or_default(),
            )),
        }
    }

    async fn stream_reply(
        &self,
        messages: Vec<ChatCompletionRequestMessage>,
    ) -> Result<LLMStream, OpenAIError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .temperature(TEMPERATURE)
            .max_completion_tokens(MAX_TOKENS)
            .stream(true)
            .build()?;

        debug!(model = %self.model, "Requesting streamed completion");
        let stream = self.client.chat().create_stream(request).await?;

        Ok(Box::pin(stream.filter_map(|result| async {
            match result {
                Ok(response) => response
                    .choices
                    .first()
                    .and_then(|choice| choice.delta.content.clone())
                    .filter(|content| !content.is_empty())
                    .map(Ok),
                Err(e) => Some(Err(e)),
            }
        })))
    }
}

/// A [`Responder`] for any OpenAI-compatible chat completions API.
///
/// Without tools the reply is streamed as it is generated. With tools, each
/// round is a complete model turn: requested tools run and their results go
/// back to the model until it answers in text or [`MAX_TOOL_ROUNDS`] run out.
pub struct OpenAICompatibleResponder {
    client: Arc<dyn LLMClient>,
    system_prompt: String,
    tools: Option<Arc<dyn ToolExecutor>>,
}

impl OpenAICompatibleResponder {
    /// Creates a responder for an OpenAI-compatible service.
    ///
    /// # Arguments
    ///
    /// * `config` - API key and base URL of the service.
    /// * `model` - The model identifier to use for chat completions (e.g., "gpt-4o-mini").
    /// * `system_prompt` - Instructions sent ahead of every conversation.
    pub fn new(config: OpenAIConfig, model: String, system_prompt: String) -> Self {
        Self::with_client(
            Arc::new(OpenAICompatibleClient::new(config, model)),
            system_prompt,
        )
    }

    pub fn with_client(client: Arc<dyn LLMClient>, system_prompt: String) -> Self {
        Self {
            client,
            system_prompt,
            tools: None,
        }
    }

    /// Offers `tools` to the model on every reply.
    pub fn with_tools(mut self, tools: Arc<dyn ToolExecutor>) -> Self {
        self.tools = Some(tools);
        self
    }

    fn messages(
        &self,
        history: &[Turn],
        user_text: &str,
    ) -> Result<Vec<ChatCompletionRequestMessage>, OpenAIError> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(
            ChatCompletionRequestSystemMessageArgs::default()
                .content(self.system_prompt.as_str())
                .build()?
                .into(),
        );
        for turn in history {
            let message = match turn.speaker {
                Speaker::User => ChatCompletionRequestUserMessageArgs::default()
                    .content(turn.content.as_str())
                    .build()?
                    .into(),
                Speaker::Agent => ChatCompletionRequestAssistantMessageArgs::default()
                    .content(turn.content.as_str())
                    .build()?
                    .into(),
            };
            messages.push(message);
        }
        messages.push(
            ChatCompletionRequestUserMessageArgs::default()
                .content(user_text)
                .build()?
                .into(),
        );
        Ok(messages)
    }

    /// Runs the tool loop and returns the final text.
    async fn reply_with_tools(
        &self,
        mut messages: Vec<ChatCompletionRequestMessage>,
        tools: &dyn ToolExecutor,
    ) -> Result<String, OpenAIError> {
        let mut definitions = tools.definitions();
        for round in 1..=MAX_TOOL_ROUNDS {
            let action = match self
                .client
                .decide_action(messages.clone(), definitions.clone())
                .await
            {
                Ok(action) => action,
                Err(e) if !definitions.is_empty() && is_tool_use_failure(&e) => {
                    warn!(round, "Model produced a malformed tool call, retrying without tools");
                    definitions.clear();
                    continue;
                }
                Err(e) => return Err(e),
            };
            let tool_calls = match action {
                LLMAction::TextResponse(text) => return Ok(text),
                LLMAction::ToolCall(tool_calls) => tool_calls,
            };

            info!(round, calls = tool_calls.len(), "Executing tool calls");
            messages.push(
                ChatCompletionRequestAssistantMessageArgs::default()
                    .tool_calls(tool_calls.clone())
                    .build()?
                    .into(),
            );
            for call in &tool_calls {
                let result = tools
                    .call(&call.function.name, &call.function.arguments)
                    .await;
                debug!(tool = %call.function.name, %result, "Tool finished");
                messages.push(
                    ChatCompletionRequestToolMessageArgs::default()
                        .tool_call_id(call.id.clone())
                        .content(result)
                        .build()?
                        .into(),
                );
            }
        }
        warn!(rounds = MAX_TOOL_ROUNDS, "Model kept calling tools, giving up");
        Ok(TOOLS_EXHAUSTED_REPLY.to_string())
    }
}

#[async_trait]
impl Responder for OpenAICompatibleResponder {
    async fn respond(
        &self,
        history: &[Turn],
        user_text: &str,
    ) -> Result<StageStream<String>, StageError> {
        let messages = self
            .messages(history, user_text)
            .map_err(responder_error)?;

        if let Some(tools) = &self.tools {
            let text = self
                .reply_with_tools(messages, tools.as_ref())
                .await
                .map_err(responder_error)?;
            let text = Some(text).filter(|text| !text.is_empty());
            return Ok(Box::pin(stream::iter(text.map(Ok))));
        }

        let stream = self
            .client
            .stream_reply(messages)
            .await
            .map_err(responder_error)?;
        Ok(Box::pin(stream.map(|item| item.map_err(responder_error))))
    }
}

/// Groq rejects generations whose tool call it cannot parse with this code.
fn is_tool_use_failure(error: &OpenAIError) -> bool {
    match error {
        OpenAIError::ApiError(api) => {
            api.code.as_deref() == Some("tool_use_failed") || api.message.contains("tool_use_failed")
        }
        other => other.to_string().contains("tool_use_failed"),
    }
}

fn responder_error(error: OpenAIError) -> StageError {
    classify(StageKind::Responder, error)
}

/// Maps client errors onto the stage error taxonomy.
pub fn classify(stage: StageKind, error: OpenAIError) -> StageError {
    let message = error.to_string();
    let lowered = message.to_lowercase();
    match error {
        _ if lowered.contains("rate limit") || lowered.contains("429") => StageError::RateLimited { stage, message },
        OpenAIError::Reqwest(_) | OpenAIError::StreamError(_) | OpenAIError::JSONDeserialize(_) => {
            StageError::transient(stage, message)
        }
        OpenAIError::ApiError(_)
            if lowered.contains("overloaded") || lowered.contains("server") =>
        {
            StageError::transient(stage, message)
        }
        _ => StageError::fatal(stage, message),
    }
}
