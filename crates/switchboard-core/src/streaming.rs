//! Streaming bridge between the routing loop and a token consumer
//!
//! One task per request drives the routing loop to completion while the
//! caller awaits tokens from the other end of an unbounded channel. The
//! worker always closes the stream with a sentinel, so the consumer
//! terminates on success and failure alike. There is no back-pressure: a
//! stalled consumer lets the queue grow.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};
use uuid::Uuid;

use crate::orchestrator::{Orchestrator, RouteOutcome};

/// What flows through the bridge: tokens, then exactly one terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Token(String),
    /// Distinguished sentinel; never surfaced to the consumer as a token.
    Done,
}

/// Create a connected producer/consumer pair for one request.
pub fn token_channel() -> (TokenSink, TokenStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (TokenSink { tx }, TokenStream { rx, finished: false })
}

/// Producer half. Cloneable so several streaming agents within one request
/// can share it. Pushes never block; a departed consumer is ignored.
#[derive(Clone)]
pub struct TokenSink {
    tx: mpsc::UnboundedSender<StreamEvent>,
}

impl TokenSink {
    pub fn push(&self, token: impl Into<String>) {
        let _ = self.tx.send(StreamEvent::Token(token.into()));
    }

    /// Signal end of stream.
    pub fn finish(&self) {
        let _ = self.tx.send(StreamEvent::Done);
    }
}

/// Consumer half. `next_token` waits for the next token and returns `None`
/// once the sentinel arrives or every sink is gone; it stays `None` from
/// then on.
pub struct TokenStream {
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    finished: bool,
}

impl TokenStream {
    pub async fn next_token(&mut self) -> Option<String> {
        if self.finished {
            return None;
        }
        match self.rx.recv().await {
            Some(StreamEvent::Token(token)) => Some(token),
            Some(StreamEvent::Done) | None => {
                self.finished = true;
                None
            }
        }
    }
}

/// Parameters for one streamed request.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub user_input: String,
    pub user_id: String,
    pub session_id: String,
    pub request_id: String,
    pub extra_params: HashMap<String, String>,
}

impl RouteRequest {
    /// Build a request with a generated request id.
    pub fn new(
        user_input: impl Into<String>,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        let user_id = user_id.into();
        let session_id = session_id.into();
        Self {
            user_input: user_input.into(),
            request_id: format!("{}-{}-{}", user_id, session_id, Uuid::new_v4()),
            user_id,
            session_id,
            extra_params: HashMap::new(),
        }
    }
}

/// Run one routing loop to completion on the runtime, bridging its output
/// into `sink`. Streaming agents push their own tokens along the way; a
/// fallback or error outcome is pushed as a single final token. The sink
/// is always finished, whatever the outcome.
pub fn spawn_route(
    orchestrator: Arc<Orchestrator>,
    sink: TokenSink,
    request: RouteRequest,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let outcome = orchestrator
            .route_request(
                &request.user_input,
                &request.user_id,
                &request.session_id,
                &request.request_id,
                &request.extra_params,
            )
            .await;
        match outcome {
            Ok(RouteOutcome::Completed(hops)) => {
                debug!(
                    "Streaming request {} completed with {} hop(s)",
                    request.request_id,
                    hops.len()
                );
            }
            Ok(RouteOutcome::Fallback(text)) => sink.push(text),
            Err(e) => {
                error!("Streaming request {} failed: {}", request.request_id, e);
                sink.push(orchestrator.config().routing_error_message.clone());
            }
        }
        sink.finish();
    })
}
