//! Classification oracle — picks the agent for the current sub-task
//!
//! The classifier is a black box to the routing loop. Everything it needs
//! (original request, current sub-task input, registry snapshot, merged
//! history) is threaded through each call, so one classifier instance can
//! safely serve concurrent requests.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::agent::AgentInfo;
use crate::openai::{ChatMessage, FunctionSpec, OpenAiClient};
use crate::types::Message;

/// Sentinel the classifier uses for "no input for a next action". When a
/// continue-hop carries this, the loop falls back to the previous hop's
/// full output text.
pub const UNKNOWN_SENTINEL: &str = "unknown";

/// Everything one classification call sees.
#[derive(Debug, Clone, Copy)]
pub struct ClassifyRequest<'a> {
    /// The untouched top-level user request.
    pub original_user_input: &'a str,
    /// The text currently being routed; rewritten between hops.
    pub subtask_input: &'a str,
    /// Snapshot of the orchestrator's registry.
    pub agents: &'a [AgentInfo],
    /// Merged session history across all agents, chronological.
    pub history: &'a [Message],
}

/// What to do after the current hop completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextAction {
    /// Terminal: the accumulated trace is the answer.
    RespondToUser,
    /// Terminal: no further sub-tasks were identified.
    Unknown,
    /// Another sub-task remains; the payload names the suggested agent.
    Delegate(String),
}

impl NextAction {
    pub fn from_raw(raw: &str) -> Self {
        match raw.trim() {
            "respond_to_user" => Self::RespondToUser,
            "" | UNKNOWN_SENTINEL => Self::Unknown,
            other => Self::Delegate(other.to_string()),
        }
    }
}

/// Result of one classification call. Produced fresh every hop, never
/// persisted.
#[derive(Debug, Clone)]
pub struct Classification {
    /// Normalized id of the selected agent, if any could be matched.
    pub agent_selected: Option<String>,
    /// Confidence in the selection, clamped to [0, 1].
    pub confidence: f32,
    /// Free-form description of the action being taken this hop.
    pub action: String,
    pub next_action: NextAction,
    /// Input for the next hop; [`UNKNOWN_SENTINEL`] when there is none.
    pub next_action_input: String,
}

/// Selects an agent for the current sub-task and decides whether more
/// sub-tasks remain. Any internal error propagates to the caller as a
/// fatal classification error; retries are the caller's policy.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, request: ClassifyRequest<'_>) -> Result<Classification>;
}

const CLASSIFIER_PROMPT: &str = "\
You are AgentMatcher, an assistant that analyzes a user query, splits it \
into sub-tasks when needed, and matches each sub-task with the most \
suitable agent. Chain sub-tasks across agents until the original request \
is fully answered.

Categorize the current input into one of the following agents:
<agents>
{{AGENT_DESCRIPTIONS}}
</agents>
If you are unable to select an agent, put \"unknown\" in agent_selected.

The original user request was:
<original_request>
{{ORIGINAL_USER_INPUT}}
</original_request>

Conversation history so far (assistant turns are tagged with the agent \
that produced them). Short follow-ups such as \"yes\", \"ok\", or a bare \
number continue the previous conversation, so keep the previously selected \
agent for them:
<history>
{{HISTORY}}
</history>

Guidelines:
- The original request may contain several tasks. Use the history to see \
which were already executed and decide the next step.
- If work remains, put the next agent id in next_action and the input for \
it in next_action_input.
- If nothing remains, set next_action to \"respond_to_user\" and put \
\"unknown\" in next_action_input.
- Set next_action to \"unknown\" only when no agent fits and there is no \
next step.
- confidence is a number between 0 and 1.

Skip any preamble and respond only through the route_subtask function.";

/// OpenAI-backed classifier. Builds the AgentMatcher system prompt from
/// the registry snapshot and history, then forces a `route_subtask`
/// function call and parses its arguments.
pub struct OpenAiClassifier {
    client: OpenAiClient,
}

impl OpenAiClassifier {
    pub fn new(client: OpenAiClient) -> Self {
        Self { client }
    }

    fn function_spec() -> FunctionSpec {
        FunctionSpec {
            name: "route_subtask".to_string(),
            description: "Analyze the user input and provide structured routing output"
                .to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "input": {
                        "type": "string",
                        "description": "The input being classified",
                    },
                    "agent_selected": {
                        "type": "string",
                        "description": "The id of the selected agent, or unknown",
                    },
                    "confidence": {
                        "type": "number",
                        "description": "Confidence score between 0 and 1",
                    },
                    "action": {
                        "type": "string",
                        "description": "The action taken for this input",
                    },
                    "next_action": {
                        "type": "string",
                        "description": "The next action to take: an agent id, respond_to_user, or unknown",
                    },
                    "next_action_input": {
                        "type": "string",
                        "description": "The input for the next action's agent",
                    },
                },
                "required": [
                    "input", "agent_selected", "confidence",
                    "action", "next_action", "next_action_input",
                ],
            }),
        }
    }
}

#[async_trait]
impl Classifier for OpenAiClassifier {
    async fn classify(&self, request: ClassifyRequest<'_>) -> Result<Classification> {
        let system = fill_placeholders(
            CLASSIFIER_PROMPT,
            &[
                ("AGENT_DESCRIPTIONS", &describe_agents(request.agents)),
                ("ORIGINAL_USER_INPUT", request.original_user_input),
                ("HISTORY", &format_history(request.history)),
            ],
        );
        let messages = vec![ChatMessage {
            role: "user".to_string(),
            content: request.subtask_input.to_string(),
        }];

        let arguments = self
            .client
            .call_function(&system, &messages, &Self::function_spec())
            .await
            .context("Classifier request failed")?;
        let raw: RawClassification = serde_json::from_value(arguments)
            .context("Classifier returned malformed route_subtask arguments")?;

        debug!(
            "Classifier picked '{}' (next_action: {})",
            raw.agent_selected, raw.next_action
        );
        Ok(into_classification(raw, request.agents))
    }
}

/// Raw `route_subtask` arguments as the model returns them.
#[derive(Debug, Deserialize)]
struct RawClassification {
    #[serde(default)]
    #[allow(dead_code)]
    input: String,
    #[serde(default)]
    agent_selected: String,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    action: String,
    #[serde(default)]
    next_action: String,
    #[serde(default)]
    next_action_input: String,
}

fn into_classification(raw: RawClassification, agents: &[AgentInfo]) -> Classification {
    let next_action_input = if raw.next_action_input.is_empty() {
        UNKNOWN_SENTINEL.to_string()
    } else {
        raw.next_action_input
    };
    Classification {
        agent_selected: resolve_agent_id(&raw.agent_selected, agents),
        confidence: raw.confidence.clamp(0.0, 1.0),
        action: raw.action,
        next_action: NextAction::from_raw(&raw.next_action),
        next_action_input,
    }
}

/// Models sometimes return "agent-id Some Extra Words"; take the first
/// token and accept it only if it names a registered agent.
fn resolve_agent_id(raw: &str, agents: &[AgentInfo]) -> Option<String> {
    let id = raw.split_whitespace().next()?.to_lowercase();
    agents.iter().any(|a| a.id == id).then_some(id)
}

fn describe_agents(agents: &[AgentInfo]) -> String {
    agents
        .iter()
        .map(|a| format!("{}: {}", a.id, a.description))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn format_history(history: &[Message]) -> String {
    history
        .iter()
        .map(|m| format!("{}: {}", m.role, m.text()))
        .collect::<Vec<_>>()
        .join("\n")
}

fn fill_placeholders(template: &str, variables: &[(&str, &str)]) -> String {
    let mut filled = template.to_string();
    for (key, value) in variables {
        filled = filled.replace(&format!("{{{{{key}}}}}"), value);
    }
    filled
}
