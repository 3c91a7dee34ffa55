//! Agent Tools
//!
//! Functions the responder's model may call mid-reply. They are served as MCP
//! tools by [`VaaniTools`] and reached through an in-process MCP client held
//! by a [`ToolBox`], which also turns the tool list into chat-completion
//! function definitions.

pub mod calculator;
pub mod clock;

use async_openai::types::{ChatCompletionTool, ChatCompletionToolArgs, FunctionObjectArgs};
use async_trait::async_trait;
use rmcp::{
    ServerHandler, ServiceExt,
    handler::server::{router::tool::ToolRouter, tool::Parameters},
    model::{CallToolRequestParam, RawContent, ServerCapabilities, ServerInfo},
    service::{RoleClient, RunningService},
    tool, tool_handler, tool_router,
};
use schemars::JsonSchema;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Tool service failed to start: {0}")]
    Start(String),
    #[error("Could not list tools: {0}")]
    List(String),
    #[error("Invalid tool definition: {0}")]
    Definition(String),
}

/// Runs the tools a model asks for.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Function definitions to offer the model.
    fn definitions(&self) -> Vec<ChatCompletionTool>;

    /// Runs `name` with the model's JSON `arguments`. Failures are reported
    /// as text, since the model reads them like any other result.
    async fn call(&self, name: &str, arguments: &str) -> String;
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CalculateArgs {
    #[schemars(
        description = "Mathematical expression to evaluate. Examples: '15 * 0.18', 'sqrt(144)', '2^10', '(100 + 50) / 3'"
    )]
    pub expression: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CurrentTimeArgs {
    #[schemars(
        description = "Timezone name. Accepts IANA format (e.g., 'Asia/Kolkata', 'America/New_York') or common names (e.g., 'India', 'Tokyo', 'London', 'New York', 'UTC'). Defaults to 'UTC'."
    )]
    #[serde(default)]
    pub timezone: Option<String>,
}

/// The MCP server side: every tool the agent can use.
pub struct VaaniTools {
    tool_router: ToolRouter<Self>,
}

#[tool_handler]
impl ServerHandler for VaaniTools {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

impl Default for VaaniTools {
    fn default() -> Self {
        Self::new()
    }
}

#[tool_router]
impl VaaniTools {
    pub fn new() -> Self {
        Self {
            tool_router: Self::tool_router(),
        }
    }

    #[tool(
        description = "Perform accurate mathematical calculations. Supports basic arithmetic (+, -, *, /), powers (^), percentages, and math functions (sqrt, round, abs, log, sin, cos, ceil, floor). Use this for any math computation to ensure accuracy."
    )]
    pub async fn calculate(&self, args: Parameters<CalculateArgs>) -> Result<String, String> {
        info!(expression = %args.0.expression, "Executing tool 'calculate'");
        calculator::calculate(&args.0.expression).map_err(|e| e.to_string())
    }

    #[tool(
        description = "Get the current date and time in any timezone. Use this whenever the user asks about the current time, date, or what time it is in a specific city or country."
    )]
    pub async fn get_current_time(
        &self,
        args: Parameters<CurrentTimeArgs>,
    ) -> Result<String, String> {
        let timezone = args.0.timezone.as_deref().unwrap_or("UTC");
        info!(%timezone, "Executing tool 'get_current_time'");
        clock::describe_time(chrono::Utc::now(), timezone)
    }
}

/// An MCP client connected to an in-process [`VaaniTools`] server.
pub struct ToolBox {
    client: RunningService<RoleClient, ()>,
    definitions: Vec<ChatCompletionTool>,
    server: JoinHandle<()>,
}

impl ToolBox {
    /// Starts the tool server and lists its tools once.
    pub async fn start() -> Result<Self, ToolError> {
        let (server_transport, client_transport) = tokio::io::duplex(4096);
        let server = tokio::spawn(async move {
            match VaaniTools::new().serve(server_transport).await {
                Ok(service) => {
                    let _ = service.waiting().await;
                }
                Err(e) => warn!(error = %e, "Tool server stopped during handshake"),
            }
        });
        let client = ()
            .serve(client_transport)
            .await
            .map_err(|e| ToolError::Start(e.to_string()))?;

        let definitions = client
            .list_all_tools()
            .await
            .map_err(|e| ToolError::List(e.to_string()))?
            .into_iter()
            .map(|t| {
                let parameters = serde_json::to_value(&*t.input_schema)
                    .map_err(|e| ToolError::Definition(e.to_string()))?;
                ChatCompletionToolArgs::default()
                    .function(
                        FunctionObjectArgs::default()
                            .name(t.name)
                            .description(t.description.unwrap_or_default())
                            .parameters(parameters)
                            .build()
                            .map_err(|e| ToolError::Definition(e.to_string()))?,
                    )
                    .build()
                    .map_err(|e| ToolError::Definition(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        info!(tools = definitions.len(), "Agent tools ready");
        Ok(Self {
            client,
            definitions,
            server,
        })
    }
}

impl Drop for ToolBox {
    fn drop(&mut self) {
        self.server.abort();
    }
}

#[async_trait]
impl ToolExecutor for ToolBox {
    fn definitions(&self) -> Vec<ChatCompletionTool> {
        self.definitions.clone()
    }

    async fn call(&self, name: &str, arguments: &str) -> String {
        if !self.definitions.iter().any(|d| d.function.name == name) {
            warn!(tool = %name, "Model asked for an unknown tool");
            return format!("Error: Tool '{name}' not found.");
        }
        let arguments = match arguments.trim() {
            "" => serde_json::Map::new(),
            raw => match serde_json::from_str(raw) {
                Ok(arguments) => arguments,
                Err(e) => return format!("Error: invalid arguments for '{name}': {e}"),
            },
        };
        let result = self
            .client
            .peer()
            .call_tool(CallToolRequestParam {
                name: name.to_string().into(),
                arguments: Some(arguments),
            })
            .await;
        match result {
            Ok(result) => {
                let text: Vec<String> = result
                    .content
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|content| match content.raw {
                        RawContent::Text(text) => Some(text.text),
                        _ => None,
                    })
                    .collect();
                if text.is_empty() {
                    format!("Error: Tool '{name}' returned no text.")
                } else {
                    text.join("\n")
                }
            }
            Err(e) => {
                warn!(tool = %name, error = %e, "Tool call failed");
                format!("Error: {e}")
            }
        }
    }
}
