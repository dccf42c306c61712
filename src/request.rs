//! Caller-facing request types.
//!
//! [`CompletionParams`] is the uniform input the pipeline accepts
//! regardless of which provider ends up serving it. The recursion engine
//! builds follow-up requests by cloning the params and appending the
//! assistant's partial message plus tool results to `messages`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::chunk::ToolCall;

/// The role of a chat message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions.
    System,
    /// User input.
    User,
    /// Assistant (model) response.
    Assistant,
    /// A tool result fed back into the conversation.
    Tool,
}

/// A single message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// The role of the message author.
    pub role: Role,
    /// The message content.
    pub content: String,
    /// For `Role::Tool` messages: the id of the call this answers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// For assistant messages: the tool calls the model made in this turn.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl ChatMessage {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    /// A system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// A user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// An assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// A tool result answering `call_id`.
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_call_id: Some(call_id.into()),
            tool_calls: Vec::new(),
        }
    }

    /// Attach the tool calls the assistant made in this turn.
    pub fn with_tool_calls(mut self, calls: Vec<ToolCall>) -> Self {
        self.tool_calls = calls;
        self
    }
}

/// Specification of a tool offered to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Tool name as the model will reference it.
    pub name: String,
    /// Description shown to the model.
    pub description: String,
    /// JSON schema of the tool's arguments.
    pub parameters: Value,
}

/// Uniform input for one completion request.
///
/// # Example
///
/// ```
/// use completion_pipeline::{ChatMessage, CompletionParams};
///
/// let params = CompletionParams::builder("llama3.2")
///     .message(ChatMessage::user("Why is the sky blue?"))
///     .reasoning(true)
///     .max_tokens(1024)
///     .build();
/// assert!(params.reasoning);
/// ```
#[derive(Debug, Clone)]
pub struct CompletionParams {
    /// Conversation history, oldest first.
    pub messages: Vec<ChatMessage>,
    /// Model selector (provider-specific identifier).
    pub model: String,
    /// Tools offered to the model. Empty disables tool use.
    pub tools: Vec<ToolSpec>,
    /// Whether to request streamed output.
    pub stream: bool,
    /// Whether reasoning ("thinking") output is enabled.
    pub reasoning: bool,
    /// Maximum tokens to generate.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f64,
    /// Extra provider-specific sampling options, merged into the payload.
    pub options: Option<Value>,
}

impl CompletionParams {
    /// Create a builder for the given model.
    pub fn builder(model: impl Into<String>) -> CompletionParamsBuilder {
        CompletionParamsBuilder {
            params: CompletionParams {
                messages: Vec::new(),
                model: model.into(),
                tools: Vec::new(),
                stream: true,
                reasoning: false,
                max_tokens: 2048,
                temperature: 0.7,
                options: None,
            },
        }
    }
}

/// Builder for [`CompletionParams`].
pub struct CompletionParamsBuilder {
    params: CompletionParams,
}

impl CompletionParamsBuilder {
    /// Append a message to the conversation.
    pub fn message(mut self, message: ChatMessage) -> Self {
        self.params.messages.push(message);
        self
    }

    /// Set the full conversation at once.
    pub fn messages(mut self, messages: Vec<ChatMessage>) -> Self {
        self.params.messages = messages;
        self
    }

    /// Offer a tool to the model.
    pub fn tool(mut self, tool: ToolSpec) -> Self {
        self.params.tools.push(tool);
        self
    }

    /// Enable or disable streamed output. Default: on.
    pub fn stream(mut self, stream: bool) -> Self {
        self.params.stream = stream;
        self
    }

    /// Enable or disable reasoning output. Default: off.
    pub fn reasoning(mut self, reasoning: bool) -> Self {
        self.params.reasoning = reasoning;
        self
    }

    /// Set the generation token limit. Default: 2048.
    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.params.max_tokens = max_tokens;
        self
    }

    /// Set the sampling temperature. Default: 0.7.
    pub fn temperature(mut self, temperature: f64) -> Self {
        self.params.temperature = temperature;
        self
    }

    /// Merge extra provider-specific options into the payload.
    pub fn options(mut self, options: Value) -> Self {
        self.params.options = Some(options);
        self
    }

    /// Finish the builder.
    pub fn build(self) -> CompletionParams {
        self.params
    }
}
