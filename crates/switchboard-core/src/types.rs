//! Shared types for switchboard-core

use serde::{Deserialize, Serialize};

/// Who produced a conversation message
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

/// One part of a message body. Only text today, but the tagged
/// representation leaves room for other part kinds on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
}

/// A single conversation turn. Immutable once created: the store appends
/// these and never rewrites them.
///
/// `short_output` carries a condensed version of an assistant turn forward
/// as context for the next hop's classification; `content` holds the full
/// rendered text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub original_user_input: String,
    pub short_output: String,
    pub token_count: u32,
    pub content: Vec<ContentPart>,
}

impl Message {
    /// Build a user turn. Token count is approximated by whitespace split,
    /// the same estimate the routing loop uses for its own turns.
    pub fn user(original_user_input: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        let token_count = text.split_whitespace().count() as u32;
        Self {
            role: Role::User,
            original_user_input: original_user_input.into(),
            short_output: String::new(),
            token_count,
            content: vec![ContentPart::Text { text }],
        }
    }

    /// Build an assistant turn with an explicit token count reported by the
    /// producing agent.
    pub fn assistant(
        original_user_input: impl Into<String>,
        short_output: impl Into<String>,
        token_count: u32,
        text: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Assistant,
            original_user_input: original_user_input.into(),
            short_output: short_output.into(),
            token_count,
            content: vec![ContentPart::Text { text: text.into() }],
        }
    }

    /// The first text part, or an empty string for a message without one.
    pub fn text(&self) -> &str {
        self.content
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => text.as_str(),
            })
            .next()
            .unwrap_or("")
    }
}

/// One entry in the audit trail of a routed request: which agent handled
/// the hop and what it produced. The ordered list of these is the full
/// trace of a multi-hop request, not just the final answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HopRecord {
    pub agent_name: String,
    pub output_text: String,
    pub output_tokens: u32,
    pub request_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_serde() {
        assert_eq!(serde_json::to_string(&Role::User).unwrap(), "\"user\"");
        let role: Role = serde_json::from_str("\"assistant\"").unwrap();
        assert_eq!(role, Role::Assistant);
    }

    #[test]
    fn test_content_part_tagged() {
        let part = ContentPart::Text {
            text: "hello".to_string(),
        };
        let json = serde_json::to_string(&part).unwrap();
        assert!(json.contains("\"type\":\"text\""));
    }

    #[test]
    fn test_user_message_token_count() {
        let msg = Message::user("original", "three word input");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.token_count, 3);
        assert_eq!(msg.text(), "three word input");
        assert!(msg.short_output.is_empty());
    }

    #[test]
    fn test_assistant_message() {
        let msg = Message::assistant("original", "condensed", 42, "full answer text");
        assert_eq!(msg.role, Role::Assistant);
        assert_eq!(msg.short_output, "condensed");
        assert_eq!(msg.token_count, 42);
        assert_eq!(msg.text(), "full answer text");
    }

    #[test]
    fn test_empty_message_text() {
        let msg = Message {
            role: Role::Assistant,
            original_user_input: String::new(),
            short_output: String::new(),
            token_count: 0,
            content: Vec::new(),
        };
        assert_eq!(msg.text(), "");
    }
}
