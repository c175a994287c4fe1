//! Conversation store contract and the in-memory reference implementation
//!
//! History is scoped per (user, session, agent): an agent never sees
//! another agent's thread for the same session. The classifier, by
//! contrast, reads the merged chronological view via `fetch_all_chats`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use crate::types::{Message, Role};

/// Storage contract consumed by the orchestrator. Any implementation
/// satisfying these semantics is acceptable; each save succeeds or fails
/// as a unit, and no cross-message atomicity is required.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Save one message under the agent's thread, trimming to
    /// `max_history` entries afterwards.
    async fn save_message(
        &self,
        user_id: &str,
        session_id: &str,
        agent_id: &str,
        message: Message,
        max_history: Option<usize>,
    ) -> Result<bool>;

    /// Save several messages in order under the agent's thread.
    async fn save_messages(
        &self,
        user_id: &str,
        session_id: &str,
        agent_id: &str,
        messages: Vec<Message>,
        max_history: Option<usize>,
    ) -> Result<bool>;

    /// Fetch one agent's thread, most recent `max_history` entries.
    async fn fetch_chat(
        &self,
        user_id: &str,
        session_id: &str,
        agent_id: &str,
        max_history: Option<usize>,
    ) -> Result<Vec<Message>>;

    /// Fetch every agent's messages for the session, merged in
    /// chronological order. Used to build classification context.
    async fn fetch_all_chats(&self, user_id: &str, session_id: &str) -> Result<Vec<Message>>;
}

/// Truncate to the most recent entries. The limit is rounded down to the
/// nearest even number first, so a user/assistant pair is never split at
/// the trim boundary.
pub fn trim_history<T>(messages: &mut Vec<T>, max_history: Option<usize>) {
    let Some(max) = max_history else {
        return;
    };
    let max = max - (max % 2);
    if messages.len() > max {
        let excess = messages.len() - max;
        messages.drain(..excess);
    }
}

/// Message plus arrival order, kept internally so merged session views
/// stay chronological even when wall-clock timestamps collide.
struct TimestampedMessage {
    message: Message,
    timestamp: DateTime<Utc>,
    seq: u64,
}

/// In-memory store keyed by (user, session, agent). The minimal valid
/// implementation of the contract; suitable for tests and single-process
/// deployments.
#[derive(Default)]
pub struct MemoryStore {
    chats: RwLock<HashMap<(String, String, String), Vec<TimestampedMessage>>>,
    seq: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(user_id: &str, session_id: &str, agent_id: &str) -> (String, String, String) {
        (
            user_id.to_string(),
            session_id.to_string(),
            agent_id.to_string(),
        )
    }

    fn store_one(
        &self,
        entries: &mut Vec<TimestampedMessage>,
        message: Message,
        max_history: Option<usize>,
    ) {
        // Consecutive same-role saves would break pair trimming; skip them.
        if entries
            .last()
            .is_some_and(|last| last.message.role == message.role)
        {
            debug!("Skipping consecutive {} message", message.role);
            return;
        }
        entries.push(TimestampedMessage {
            message,
            timestamp: Utc::now(),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        });
        trim_history(entries, max_history);
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn save_message(
        &self,
        user_id: &str,
        session_id: &str,
        agent_id: &str,
        message: Message,
        max_history: Option<usize>,
    ) -> Result<bool> {
        let mut chats = self.chats.write().await;
        let entries = chats
            .entry(Self::key(user_id, session_id, agent_id))
            .or_default();
        self.store_one(entries, message, max_history);
        Ok(true)
    }

    async fn save_messages(
        &self,
        user_id: &str,
        session_id: &str,
        agent_id: &str,
        messages: Vec<Message>,
        max_history: Option<usize>,
    ) -> Result<bool> {
        let mut chats = self.chats.write().await;
        let entries = chats
            .entry(Self::key(user_id, session_id, agent_id))
            .or_default();
        for message in messages {
            self.store_one(entries, message, max_history);
        }
        Ok(true)
    }

    async fn fetch_chat(
        &self,
        user_id: &str,
        session_id: &str,
        agent_id: &str,
        max_history: Option<usize>,
    ) -> Result<Vec<Message>> {
        let chats = self.chats.read().await;
        let mut messages: Vec<Message> = chats
            .get(&Self::key(user_id, session_id, agent_id))
            .map(|entries| entries.iter().map(|e| e.message.clone()).collect())
            .unwrap_or_default();
        trim_history(&mut messages, max_history);
        Ok(messages)
    }

    async fn fetch_all_chats(&self, user_id: &str, session_id: &str) -> Result<Vec<Message>> {
        let chats = self.chats.read().await;
        let mut merged: Vec<(DateTime<Utc>, u64, &str, &Message)> = Vec::new();
        for ((user, session, agent_id), entries) in chats.iter() {
            if user != user_id || session != session_id {
                continue;
            }
            for entry in entries {
                merged.push((entry.timestamp, entry.seq, agent_id.as_str(), &entry.message));
            }
        }
        merged.sort_by_key(|(timestamp, seq, _, _)| (*timestamp, *seq));

        // Assistant turns are annotated with the producing agent's id so
        // the classifier can see who handled what.
        Ok(merged
            .into_iter()
            .map(|(_, _, agent_id, message)| match message.role {
                Role::Assistant => Message::assistant(
                    message.original_user_input.clone(),
                    message.short_output.clone(),
                    message.token_count,
                    format!("[{}] {}", agent_id, message.text()),
                ),
                Role::User => message.clone(),
            })
            .collect())
    }
}
