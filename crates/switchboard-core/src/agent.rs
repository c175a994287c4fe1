//! Agent contract — the polymorphic unit one hop is dispatched to

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;

use crate::types::Message;

/// A specialized processing unit that handles one category of sub-task.
///
/// The orchestrator resolves agents by their normalized id, hands them
/// their own scoped conversation history, and persists the turn afterwards
/// when `persist_history` allows it. Streaming agents additionally push
/// incremental tokens through a [`crate::streaming::TokenSink`] they hold;
/// they still return the fully assembled message.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Display name, also the source of the registry id.
    fn name(&self) -> &str;

    /// Used verbatim by the classifier to decide routing.
    fn description(&self) -> &str;

    /// Registry identity, derived from the display name. Must be unique
    /// within one orchestrator.
    fn id(&self) -> String {
        generate_key_from_name(self.name())
    }

    /// Whether the orchestrator should persist this agent's turns.
    fn persist_history(&self) -> bool {
        true
    }

    /// Whether this agent emits incremental tokens while responding.
    fn is_streaming_enabled(&self) -> bool {
        false
    }

    /// Handle one sub-task. `original_input` is the untouched top-level
    /// request; `subtask_input` is the text currently being routed, which
    /// may have been rewritten by earlier hops.
    async fn handle_request(
        &self,
        original_input: &str,
        subtask_input: &str,
        user_id: &str,
        session_id: &str,
        history: &[Message],
        extra_params: &HashMap<String, String>,
    ) -> Result<Message>;
}

/// Normalize a display name into a registry key: strip everything that is
/// not alphanumeric, whitespace, or a hyphen, then join the remaining words
/// with hyphens, lowercased.
pub fn generate_key_from_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || c.is_whitespace() || *c == '-')
        .collect();
    cleaned
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
        .to_lowercase()
}

/// Snapshot of one registered agent, handed to classifiers so they can
/// match sub-tasks against descriptions without touching the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentInfo {
    pub id: String,
    pub name: String,
    pub description: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_from_plain_name() {
        assert_eq!(
            generate_key_from_name("Text Classification Agent"),
            "text-classification-agent"
        );
    }

    #[test]
    fn test_key_strips_special_characters() {
        assert_eq!(generate_key_from_name("Q&A Agent (v2)!"), "qa-agent-v2");
    }

    #[test]
    fn test_key_collapses_whitespace() {
        assert_eq!(generate_key_from_name("  Data   Retrieval  "), "data-retrieval");
    }

    #[test]
    fn test_key_preserves_existing_hyphens() {
        assert_eq!(generate_key_from_name("classifier-agent"), "classifier-agent");
    }

    #[test]
    fn test_distinct_names_can_collide() {
        // Identity is the normalized form, so these two must not coexist
        // in one registry.
        assert_eq!(
            generate_key_from_name("Echo Agent"),
            generate_key_from_name("echo agent!")
        );
    }
}
