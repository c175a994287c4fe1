//! Error kinds for the routing core

use thiserror::Error;

/// Failures the routing loop distinguishes. Collaborator errors (agents,
/// classifiers, stores) arrive as `anyhow::Error` and are wrapped here so
/// the caller can tell which phase of the loop gave up.
#[derive(Debug, Error)]
pub enum RouteError {
    /// The classifier failed or returned a malformed result. Fatal for the
    /// request; no retry happens inside the core.
    #[error("classification failed: {0}")]
    Classification(anyhow::Error),

    /// The selected agent failed while handling its sub-task. Fatal; no
    /// partial trace is retained.
    #[error("agent '{agent}' failed to handle the request: {reason}")]
    AgentDispatch { agent: String, reason: anyhow::Error },

    /// A conversation store read or write failed.
    #[error("conversation storage failed: {0}")]
    Storage(anyhow::Error),

    /// Two registered agents normalize to the same id.
    #[error("an agent with id '{0}' is already registered")]
    DuplicateAgent(String),

    /// The classify/dispatch loop ran past the configured ceiling without
    /// reaching a terminal action.
    #[error("routing exceeded the maximum of {max} hops")]
    MaxHopsExceeded { max: usize },
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_display_includes_agent_name() {
        let err = RouteError::AgentDispatch {
            agent: "Reasoning Agent".to_string(),
            reason: anyhow!("connection refused"),
        };
        let text = err.to_string();
        assert!(text.contains("Reasoning Agent"));
        assert!(text.contains("connection refused"));
    }

    #[test]
    fn test_display_max_hops() {
        let err = RouteError::MaxHopsExceeded { max: 10 };
        assert!(err.to_string().contains("10"));
    }

    #[test]
    fn test_display_duplicate_agent() {
        let err = RouteError::DuplicateAgent("echo-agent".to_string());
        assert!(err.to_string().contains("echo-agent"));
    }
}
