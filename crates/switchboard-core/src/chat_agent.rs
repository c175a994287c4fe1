//! OpenAI-backed conversational agent
//!
//! One configurable agent covers the classification/reasoning/retrieval
//! specializations: the display name and description shape both the
//! classifier's routing decision and the agent's own system prompt. Every
//! response comes back through a forced `processPrompt` function call, so
//! the model itself authors the condensed `short_output` that later hops
//! build on.

use std::collections::HashMap;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::agent::Agent;
use crate::openai::{ChatMessage, FunctionSpec, OpenAiClient};
use crate::streaming::TokenSink;
use crate::types::Message;

/// Upper bound on the fallback summary used when the model leaves
/// `short_output` empty.
const SHORT_OUTPUT_LIMIT: usize = 400;

/// Construction options for a [`ChatAgent`].
pub struct ChatAgentOptions {
    pub name: String,
    pub description: String,
    pub api_key: String,
    pub model: Option<String>,
    pub max_tokens: u32,
    pub persist_history: bool,
    pub streaming: bool,
    /// Where streamed tokens go; required for `streaming`.
    pub sink: Option<TokenSink>,
}

impl ChatAgentOptions {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            api_key: api_key.into(),
            model: None,
            max_tokens: 1000,
            persist_history: true,
            streaming: false,
            sink: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_persist_history(mut self, persist: bool) -> Self {
        self.persist_history = persist;
        self
    }

    /// Enable token streaming through the given sink.
    pub fn with_streaming(mut self, sink: TokenSink) -> Self {
        self.streaming = true;
        self.sink = Some(sink);
        self
    }
}

/// A specialized agent backed by an OpenAI chat model.
pub struct ChatAgent {
    name: String,
    description: String,
    persist_history: bool,
    streaming: bool,
    client: OpenAiClient,
    sink: Option<TokenSink>,
}

impl ChatAgent {
    pub fn new(options: ChatAgentOptions) -> Self {
        let client =
            OpenAiClient::new(options.api_key, options.model).with_max_tokens(options.max_tokens);
        Self {
            name: options.name,
            description: options.description,
            persist_history: options.persist_history,
            streaming: options.streaming,
            client,
            sink: options.sink,
        }
    }

    fn system_prompt(&self) -> String {
        format!(
            "You are a {}.\n{}\n\
             Provide helpful and accurate information based on your expertise. \
             The human may follow up on your previous response or switch to an \
             unrelated topic at any point; understand the intent behind each \
             prompt, answer it directly, and ask for clarification when the \
             request is ambiguous.",
            self.name, self.description
        )
    }

    fn function_spec() -> FunctionSpec {
        FunctionSpec {
            name: "processPrompt".to_string(),
            description: "Analyze and process current sub-task input and provide structured output"
                .to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "input": {
                        "type": "string",
                        "description": "The current sub-task input",
                    },
                    "output": {
                        "type": "string",
                        "description": "The detailed output of the current sub-task input",
                    },
                    "short_output": {
                        "type": "string",
                        "description": "The specific output the sub-task demands without details and other contexts",
                    },
                },
                "required": ["input", "output", "short_output"],
            }),
        }
    }
}

/// `processPrompt` arguments as the model returns them.
#[derive(Debug, Deserialize)]
struct PromptReply {
    #[serde(default)]
    output: String,
    #[serde(default)]
    short_output: String,
}

/// Turn parsed `processPrompt` arguments into an assistant turn. The
/// model-authored `short_output` is preferred; an empty one falls back to
/// a bounded prefix of the detailed output. Token count is approximated by
/// word count.
fn build_response(original_input: &str, arguments: Value) -> Result<Message> {
    let reply: PromptReply =
        serde_json::from_value(arguments).context("Malformed processPrompt arguments")?;
    if reply.output.is_empty() {
        bail!("No output returned in processPrompt arguments");
    }
    let short_output = if reply.short_output.is_empty() {
        condense(&reply.output, SHORT_OUTPUT_LIMIT)
    } else {
        reply.short_output
    };
    let tokens = reply.output.split_whitespace().count() as u32;
    Ok(Message::assistant(
        original_input,
        short_output,
        tokens,
        reply.output,
    ))
}

/// Keep at most `limit` characters, cutting on a char boundary.
fn condense(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        text.to_string()
    } else {
        text.chars().take(limit).collect()
    }
}

#[async_trait]
impl Agent for ChatAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn persist_history(&self) -> bool {
        self.persist_history
    }

    fn is_streaming_enabled(&self) -> bool {
        self.streaming
    }

    async fn handle_request(
        &self,
        original_input: &str,
        subtask_input: &str,
        _user_id: &str,
        _session_id: &str,
        history: &[Message],
        _extra_params: &HashMap<String, String>,
    ) -> Result<Message> {
        let mut messages: Vec<ChatMessage> = history
            .iter()
            .map(|m| ChatMessage {
                role: m.role.to_string(),
                content: m.text().to_string(),
            })
            .collect();
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: subtask_input.to_string(),
        });

        let system = self.system_prompt();
        let function = Self::function_spec();
        let arguments = if self.streaming {
            self.client
                .call_function_stream(&system, &messages, &function)
                .await?
        } else {
            self.client.call_function(&system, &messages, &function).await?
        };

        let response = build_response(original_input, arguments)?;
        // Forced function calls stream argument fragments, not readable
        // text; the assembled output is pushed once it is parsed.
        if self.streaming {
            if let Some(sink) = &self.sink {
                sink.push(response.text());
            }
        }
        Ok(response)
    }
}
