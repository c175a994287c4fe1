//! OpenAI chat completions client with forced function calls, in single
//! and streaming form

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// OpenAI API client shared by the chat agents and the classifier.
#[derive(Clone)]
pub struct OpenAiClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
}

impl std::fmt::Debug for OpenAiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Mask the API key in debug output
        let masked_key = if self.api_key.len() > 7 {
            format!(
                "{}...{}",
                &self.api_key[..3],
                &self.api_key[self.api_key.len() - 4..]
            )
        } else {
            "***".to_string()
        };

        f.debug_struct("OpenAiClient")
            .field("client", &"<reqwest::Client>")
            .field("api_key", &masked_key)
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

impl OpenAiClient {
    /// Create a new client with the default model.
    pub fn new(api_key: String, model: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            api_key,
            base_url: "https://api.openai.com".to_string(),
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            max_tokens: 1000,
        }
    }

    /// Set max tokens for completions
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Set a custom base URL (e.g. for proxies or compatible endpoints)
    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn send(&self, body: Value) -> Result<reqwest::Response> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("Failed to send request to OpenAI API")?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(anyhow!(
                "API request failed with status {}: {}",
                status,
                error_text
            ));
        }
        Ok(response)
    }

    fn request_body(&self, system: &str, messages: &[ChatMessage]) -> Value {
        let mut all = vec![ChatMessage {
            role: "system".to_string(),
            content: system.to_string(),
        }];
        all.extend_from_slice(messages);
        serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": all,
        })
    }

    fn tool_call_body(&self, system: &str, messages: &[ChatMessage], function: &FunctionSpec) -> Value {
        let mut body = self.request_body(system, messages);
        body["tools"] = serde_json::json!([{
            "type": "function",
            "function": {
                "name": function.name,
                "description": function.description,
                "parameters": function.parameters,
            },
        }]);
        body["tool_choice"] = serde_json::json!({
            "type": "function",
            "function": { "name": function.name },
        });
        body
    }

    /// Force a call to `function` and return its parsed arguments.
    pub async fn call_function(
        &self,
        system: &str,
        messages: &[ChatMessage],
        function: &FunctionSpec,
    ) -> Result<Value> {
        debug!(
            "Requesting forced {} call with {} messages",
            function.name,
            messages.len()
        );

        let response = self.send(self.tool_call_body(system, messages, function)).await?;
        let completion: ChatCompletion = response
            .json()
            .await
            .context("Failed to parse API response")?;

        let call = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .and_then(|m| m.tool_calls)
            .and_then(|mut calls| (!calls.is_empty()).then(|| calls.remove(0)))
            .ok_or_else(|| anyhow!("Call to tool function {} is missing", function.name))?;

        if call.function.name != function.name {
            return Err(anyhow!(
                "Unexpected tool function in response: {}",
                call.function.name
            ));
        }

        serde_json::from_str(&call.function.arguments)
            .context("Failed to parse tool function arguments")
    }

    /// Streaming variant of [`call_function`](Self::call_function): the
    /// model still emits the arguments of the forced call, just spread
    /// across stream events. Fragments are accumulated and parsed once the
    /// stream ends.
    pub async fn call_function_stream(
        &self,
        system: &str,
        messages: &[ChatMessage],
        function: &FunctionSpec,
    ) -> Result<Value> {
        let mut body = self.tool_call_body(system, messages, function);
        body["stream"] = Value::Bool(true);

        debug!(
            "Requesting streamed {} call with {} messages",
            function.name,
            messages.len()
        );

        let mut response = self.send(body).await?;
        let mut buffer = String::new();
        let mut arguments = String::new();

        while let Some(chunk) = response
            .chunk()
            .await
            .context("Failed to read stream chunk")?
        {
            buffer.push_str(&String::from_utf8_lossy(&chunk));
            for payload in drain_sse_payloads(&mut buffer) {
                if payload == "[DONE]" {
                    continue;
                }
                let event: ChatCompletion = serde_json::from_str(&payload)
                    .context("Failed to parse stream event")?;
                if let Some(fragment) = event
                    .choices
                    .first()
                    .and_then(|c| c.delta.as_ref())
                    .and_then(|d| d.tool_calls.as_ref())
                    .and_then(|calls| calls.first())
                {
                    arguments.push_str(&fragment.function.arguments);
                }
            }
        }

        debug!("Stream finished ({} argument chars)", arguments.len());
        serde_json::from_str(&arguments)
            .context("Failed to parse streamed tool function arguments")
    }
}

/// Drain complete `data:` lines from an SSE buffer, leaving any trailing
/// partial line in place for the next chunk.
fn drain_sse_payloads(buffer: &mut String) -> Vec<String> {
    let mut payloads = Vec::new();
    while let Some(pos) = buffer.find('\n') {
        let line: String = buffer.drain(..=pos).collect();
        let line = line.trim();
        if let Some(data) = line.strip_prefix("data:") {
            let data = data.trim();
            if !data.is_empty() {
                payloads.push(data.to_string());
            }
        }
    }
    payloads
}

/// One chat message on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// A function the model is forced to call, with its JSON schema.
#[derive(Debug, Clone)]
pub struct FunctionSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Chat completions response; also covers stream events, which carry
/// `delta` instead of `message`.
#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
    delta: Option<Delta>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Deserialize)]
struct Delta {
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCall {
    function: FunctionCall,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    name: String,
    arguments: String,
}

/// Tool-call fragment within one stream event. The function name only
/// appears in the first fragment; arguments arrive piecewise.
#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    function: FunctionCallDelta,
}

#[derive(Debug, Deserialize)]
struct FunctionCallDelta {
    #[serde(default)]
    arguments: String,
}
