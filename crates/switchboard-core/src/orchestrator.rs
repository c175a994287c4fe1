//! Request routing core — the classify/dispatch/decide loop
//!
//! One orchestrator owns an agent registry, a classifier, and a
//! conversation store. `route_request` iterates: ask the classifier which
//! agent should handle the current sub-task, dispatch to it with that
//! agent's own history, persist the turn, record a hop, and decide whether
//! more sub-tasks remain. Nothing here is mutated during routing, so an
//! orchestrator can be shared behind `Arc` across a session's requests.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::agent::{Agent, AgentInfo};
use crate::classifier::{Classification, Classifier, ClassifyRequest, NextAction, UNKNOWN_SENTINEL};
use crate::error::RouteError;
use crate::storage::ConversationStore;
use crate::types::{HopRecord, Message};

/// Routing behavior knobs. Immutable after construction.
#[derive(Debug, Clone)]
pub struct RoutingConfig {
    /// Returned when no agent matches the request.
    pub not_selected_message: String,
    /// Returned when classification, dispatch, or storage fails.
    pub routing_error_message: String,
    /// History limit per agent thread, counted in messages and rounded
    /// down to whole user/assistant pairs by the store.
    pub max_history_pairs_per_agent: usize,
    /// Ceiling on classify/dispatch iterations for one request.
    pub max_hops: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            not_selected_message: "I am sorry, I couldn't determine how to handle your \
                                   request. Could you please rephrase it?"
                .to_string(),
            routing_error_message: "I am sorry, I couldn't determine the agent to handle \
                                    your request"
                .to_string(),
            max_history_pairs_per_agent: 100,
            max_hops: 10,
        }
    }
}

/// Result of a fully routed request.
#[derive(Debug, Clone)]
pub enum RouteOutcome {
    /// The ordered trace of every hop taken — the full audit trail, not
    /// just the final answer.
    Completed(Vec<HopRecord>),
    /// A single fallback response; no trace was produced.
    Fallback(String),
}

/// The routing core.
pub struct Orchestrator {
    agents: HashMap<String, Arc<dyn Agent>>,
    classifier: Arc<dyn Classifier>,
    store: Arc<dyn ConversationStore>,
    config: RoutingConfig,
}

impl Orchestrator {
    pub fn new(classifier: Arc<dyn Classifier>, store: Arc<dyn ConversationStore>) -> Self {
        Self {
            agents: HashMap::new(),
            classifier,
            store,
            config: RoutingConfig::default(),
        }
    }

    pub fn with_config(mut self, config: RoutingConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    /// Register an agent. Fails when another agent already normalized to
    /// the same id.
    pub fn add_agent(&mut self, agent: Arc<dyn Agent>) -> Result<(), RouteError> {
        let id = agent.id();
        if self.agents.contains_key(&id) {
            return Err(RouteError::DuplicateAgent(id));
        }
        info!("Registered agent '{}' ({})", id, agent.name());
        self.agents.insert(id, agent);
        Ok(())
    }

    /// Snapshot of the registry, ordered by id for stable classifier
    /// prompts.
    pub fn agent_overview(&self) -> Vec<AgentInfo> {
        let mut infos: Vec<AgentInfo> = self
            .agents
            .values()
            .map(|agent| AgentInfo {
                id: agent.id(),
                name: agent.name().to_string(),
                description: agent.description().to_string(),
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Route one request through zero or more agents until a terminal
    /// decision, returning the ordered hop trace.
    ///
    /// Classification, dispatch, and storage failures abort the request
    /// and surface as a [`RouteOutcome::Fallback`] with the configured
    /// error message; no partial trace is returned. Exceeding the hop
    /// ceiling is the one failure reported as an error. Note that a crash
    /// between dispatch and persistence is not replay-safe: retrying the
    /// request at the caller level duplicates the dispatched work.
    pub async fn route_request(
        &self,
        user_input: &str,
        user_id: &str,
        session_id: &str,
        request_id: &str,
        extra_params: &HashMap<String, String>,
    ) -> Result<RouteOutcome, RouteError> {
        info!("Routing request {} for {}/{}", request_id, user_id, session_id);

        let original_user_input = user_input.to_string();
        let mut subtask_input = user_input.to_string();
        let mut last_short_output = String::new();
        let mut hops: Vec<HopRecord> = Vec::new();

        loop {
            if hops.len() >= self.config.max_hops {
                warn!(
                    "Request {} exceeded {} hops without terminating",
                    request_id, self.config.max_hops
                );
                return Err(RouteError::MaxHopsExceeded {
                    max: self.config.max_hops,
                });
            }

            // CLASSIFY
            let classification = match self
                .classify_subtask(&original_user_input, &subtask_input, user_id, session_id)
                .await
            {
                Ok(classification) => classification,
                Err(e) => {
                    error!("Request {} aborted: {}", request_id, e);
                    return Ok(RouteOutcome::Fallback(
                        self.config.routing_error_message.clone(),
                    ));
                }
            };

            let Some(agent) = classification
                .agent_selected
                .as_deref()
                .and_then(|id| self.agents.get(id))
                .map(Arc::clone)
            else {
                info!("No agent matched for request {}", request_id);
                return Ok(RouteOutcome::Fallback(
                    self.config.not_selected_message.clone(),
                ));
            };

            info!(
                "Agent selected: {} (confidence {:.2})",
                agent.name(),
                classification.confidence
            );

            // DISPATCH — the previous hop's condensed output rides along
            // as context for the next sub-task.
            let dispatch_input = if last_short_output.is_empty() {
                subtask_input.clone()
            } else {
                format!("{}\n{}", subtask_input, last_short_output)
            };
            debug!("Dispatching input: {}", dispatch_input);

            let response = match self
                .dispatch(
                    agent.as_ref(),
                    &original_user_input,
                    &dispatch_input,
                    user_id,
                    session_id,
                    extra_params,
                )
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    error!("Request {} aborted: {}", request_id, e);
                    return Ok(RouteOutcome::Fallback(
                        self.config.routing_error_message.clone(),
                    ));
                }
            };

            if let Err(e) = self
                .persist_turn(
                    agent.as_ref(),
                    &original_user_input,
                    &dispatch_input,
                    &response,
                    user_id,
                    session_id,
                )
                .await
            {
                error!("Request {} aborted: {}", request_id, e);
                return Ok(RouteOutcome::Fallback(
                    self.config.routing_error_message.clone(),
                ));
            }

            // DECIDE
            hops.push(HopRecord {
                agent_name: agent.name().to_string(),
                output_text: response.text().to_string(),
                output_tokens: response.token_count,
                request_id: request_id.to_string(),
            });

            match &classification.next_action {
                NextAction::RespondToUser => {
                    info!("Responding to user after {} hop(s)", hops.len());
                    break;
                }
                NextAction::Unknown => {
                    info!("No further sub-tasks detected after {} hop(s)", hops.len());
                    break;
                }
                NextAction::Delegate(next) => {
                    last_short_output = response.short_output.clone();
                    subtask_input = if classification.next_action_input == UNKNOWN_SENTINEL {
                        response.text().to_string()
                    } else {
                        classification.next_action_input.clone()
                    };
                    debug!("Continuing toward '{}' with input: {}", next, subtask_input);
                }
            }
        }

        Ok(RouteOutcome::Completed(hops))
    }

    async fn classify_subtask(
        &self,
        original_user_input: &str,
        subtask_input: &str,
        user_id: &str,
        session_id: &str,
    ) -> Result<Classification, RouteError> {
        let history = self
            .store
            .fetch_all_chats(user_id, session_id)
            .await
            .map_err(RouteError::Storage)?;
        let agents = self.agent_overview();
        self.classifier
            .classify(ClassifyRequest {
                original_user_input,
                subtask_input,
                agents: &agents,
                history: &history,
            })
            .await
            .map_err(RouteError::Classification)
    }

    async fn dispatch(
        &self,
        agent: &dyn Agent,
        original_user_input: &str,
        dispatch_input: &str,
        user_id: &str,
        session_id: &str,
        extra_params: &HashMap<String, String>,
    ) -> Result<Message, RouteError> {
        let history = self
            .store
            .fetch_chat(
                user_id,
                session_id,
                &agent.id(),
                Some(self.config.max_history_pairs_per_agent),
            )
            .await
            .map_err(RouteError::Storage)?;
        agent
            .handle_request(
                original_user_input,
                dispatch_input,
                user_id,
                session_id,
                &history,
                extra_params,
            )
            .await
            .map_err(|e| RouteError::AgentDispatch {
                agent: agent.name().to_string(),
                reason: e,
            })
    }

    /// Persist the user's sub-task turn, then the agent's response, under
    /// the agent's own thread. Skipped entirely for agents that opt out.
    async fn persist_turn(
        &self,
        agent: &dyn Agent,
        original_user_input: &str,
        dispatch_input: &str,
        response: &Message,
        user_id: &str,
        session_id: &str,
    ) -> Result<(), RouteError> {
        if !agent.persist_history() {
            return Ok(());
        }
        let agent_id = agent.id();
        let limit = Some(self.config.max_history_pairs_per_agent);
        self.store
            .save_message(
                user_id,
                session_id,
                &agent_id,
                Message::user(original_user_input, dispatch_input),
                limit,
            )
            .await
            .map_err(RouteError::Storage)?;
        self.store
            .save_message(user_id, session_id, &agent_id, response.clone(), limit)
            .await
            .map_err(RouteError::Storage)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::types::Role;
    use anyhow::{Result, anyhow};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Plays back a fixed sequence of classifications, recording the
    /// sub-task input it was asked about each time.
    struct ScriptedClassifier {
        steps: Mutex<VecDeque<Result<Classification, String>>>,
        seen_inputs: Mutex<Vec<String>>,
    }

    impl ScriptedClassifier {
        fn new(steps: Vec<Result<Classification, String>>) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps.into()),
                seen_inputs: Mutex::new(Vec::new()),
            })
        }

        fn seen_inputs(&self) -> Vec<String> {
            self.seen_inputs.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Classifier for ScriptedClassifier {
        async fn classify(&self, request: ClassifyRequest<'_>) -> Result<Classification> {
            self.seen_inputs
                .lock()
                .unwrap()
                .push(request.subtask_input.to_string());
            match self.steps.lock().unwrap().pop_front() {
                Some(Ok(classification)) => Ok(classification),
                Some(Err(message)) => Err(anyhow!(message)),
                None => Err(anyhow!("classifier script exhausted")),
            }
        }
    }

    /// Repeats one classification forever (for hop-ceiling tests).
    struct LoopingClassifier {
        classification: Classification,
    }

    #[async_trait]
    impl Classifier for LoopingClassifier {
        async fn classify(&self, _request: ClassifyRequest<'_>) -> Result<Classification> {
            Ok(self.classification.clone())
        }
    }

    struct EchoAgent {
        name: String,
        reply: String,
        persist: bool,
        fail: bool,
    }

    impl EchoAgent {
        fn new(name: &str, reply: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                reply: reply.to_string(),
                persist: true,
                fail: false,
            })
        }
    }

    #[async_trait]
    impl Agent for EchoAgent {
        fn name(&self) -> &str {
            &self.name
        }

        fn description(&self) -> &str {
            "replies with a canned answer"
        }

        fn persist_history(&self) -> bool {
            self.persist
        }

        async fn handle_request(
            &self,
            original_input: &str,
            _subtask_input: &str,
            _user_id: &str,
            _session_id: &str,
            _history: &[Message],
            _extra_params: &HashMap<String, String>,
        ) -> Result<Message> {
            if self.fail {
                return Err(anyhow!("agent exploded"));
            }
            Ok(Message::assistant(
                original_input,
                format!("short: {}", self.reply),
                3,
                self.reply.clone(),
            ))
        }
    }

    fn select(agent_id: &str, next_action: NextAction, next_input: &str) -> Classification {
        Classification {
            agent_selected: Some(agent_id.to_string()),
            confidence: 0.9,
            action: "handle sub-task".to_string(),
            next_action,
            next_action_input: next_input.to_string(),
        }
    }

    fn no_agent() -> Classification {
        Classification {
            agent_selected: None,
            confidence: 0.0,
            action: String::new(),
            next_action: NextAction::Unknown,
            next_action_input: UNKNOWN_SENTINEL.to_string(),
        }
    }

    fn hops(outcome: RouteOutcome) -> Vec<HopRecord> {
        match outcome {
            RouteOutcome::Completed(hops) => hops,
            RouteOutcome::Fallback(text) => panic!("unexpected fallback: {text}"),
        }
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let classifier = ScriptedClassifier::new(vec![]);
        let store = Arc::new(MemoryStore::new());
        let mut orchestrator = Orchestrator::new(classifier, store);

        orchestrator
            .add_agent(EchoAgent::new("Echo Agent", "hi"))
            .unwrap();
        let err = orchestrator
            .add_agent(EchoAgent::new("echo agent!", "hi again"))
            .unwrap_err();
        assert!(matches!(err, RouteError::DuplicateAgent(id) if id == "echo-agent"));
    }

    #[test]
    fn test_agent_overview_sorted() {
        let classifier = ScriptedClassifier::new(vec![]);
        let store = Arc::new(MemoryStore::new());
        let mut orchestrator = Orchestrator::new(classifier, store);
        orchestrator
            .add_agent(EchoAgent::new("Zeta Agent", "z"))
            .unwrap();
        orchestrator
            .add_agent(EchoAgent::new("Alpha Agent", "a"))
            .unwrap();

        let overview = orchestrator.agent_overview();
        assert_eq!(overview[0].id, "alpha-agent");
        assert_eq!(overview[1].id, "zeta-agent");
        assert_eq!(overview[1].name, "Zeta Agent");
    }

    #[tokio::test]
    async fn test_single_hop_terminates() {
        let classifier = ScriptedClassifier::new(vec![Ok(select(
            "echo-agent",
            NextAction::RespondToUser,
            UNKNOWN_SENTINEL,
        ))]);
        let store = Arc::new(MemoryStore::new());
        let mut orchestrator = Orchestrator::new(classifier, store);
        orchestrator
            .add_agent(EchoAgent::new("Echo Agent", "the answer"))
            .unwrap();

        let outcome = orchestrator
            .route_request("question", "u1", "s1", "req-1", &HashMap::new())
            .await
            .unwrap();
        let trace = hops(outcome);
        assert_eq!(trace.len(), 1);
        assert_eq!(trace[0].agent_name, "Echo Agent");
        assert_eq!(trace[0].output_text, "the answer");
        assert_eq!(trace[0].request_id, "req-1");
    }

    #[tokio::test]
    async fn test_classify_scenario() {
        let classifier = ScriptedClassifier::new(vec![Ok(select(
            "classifier-agent",
            NextAction::RespondToUser,
            UNKNOWN_SENTINEL,
        ))]);
        let store = Arc::new(MemoryStore::new());
        let mut orchestrator = Orchestrator::new(classifier, store);
        orchestrator
            .add_agent(EchoAgent::new("classifier-agent", "Positive"))
            .unwrap();

        let outcome = orchestrator
            .route_request("Classify: I am happy", "u1", "s1", "req-1", &HashMap::new())
            .await
            .unwrap();
        let trace = hops(outcome);
        assert_eq!(trace.len(), 1);
        assert_eq!(trace[0].agent_name, "classifier-agent");
    }

    #[tokio::test]
    async fn test_multi_hop_trace_order_and_persistence() {
        let classifier = ScriptedClassifier::new(vec![
            Ok(select(
                "agent-a",
                NextAction::Delegate("agent-b".to_string()),
                "refined input for b",
            )),
            Ok(select("agent-b", NextAction::RespondToUser, UNKNOWN_SENTINEL)),
        ]);
        let store = Arc::new(MemoryStore::new());
        let mut orchestrator = Orchestrator::new(classifier.clone(), store.clone());
        orchestrator
            .add_agent(EchoAgent::new("Agent A", "output of a"))
            .unwrap();
        orchestrator
            .add_agent(EchoAgent::new("Agent B", "output of b"))
            .unwrap();

        let outcome = orchestrator
            .route_request("do two things", "u1", "s1", "req-1", &HashMap::new())
            .await
            .unwrap();
        let trace = hops(outcome);
        assert_eq!(trace.len(), 2);
        assert_eq!(trace[0].agent_name, "Agent A");
        assert_eq!(trace[1].agent_name, "Agent B");

        // The rewritten sub-task input reached the second classification
        assert_eq!(
            classifier.seen_inputs(),
            vec!["do two things".to_string(), "refined input for b".to_string()]
        );

        // Each hop persisted its user turn before the assistant turn,
        // scoped to its own agent
        let chat_a = store.fetch_chat("u1", "s1", "agent-a", None).await.unwrap();
        assert_eq!(chat_a.len(), 2);
        assert_eq!(chat_a[0].role, Role::User);
        assert_eq!(chat_a[1].role, Role::Assistant);
        assert_eq!(chat_a[1].text(), "output of a");

        let chat_b = store.fetch_chat("u1", "s1", "agent-b", None).await.unwrap();
        assert_eq!(chat_b.len(), 2);
        assert_eq!(chat_b[0].role, Role::User);
        assert_eq!(chat_b[1].text(), "output of b");
        // The carried short output rides along with the rewritten input
        assert!(chat_b[0].text().contains("refined input for b"));
        assert!(chat_b[0].text().contains("short: output of a"));
    }

    #[tokio::test]
    async fn test_unknown_next_input_falls_back_to_hop_output() {
        let classifier = ScriptedClassifier::new(vec![
            Ok(select(
                "agent-a",
                NextAction::Delegate("agent-b".to_string()),
                UNKNOWN_SENTINEL,
            )),
            Ok(select("agent-b", NextAction::Unknown, UNKNOWN_SENTINEL)),
        ]);
        let store = Arc::new(MemoryStore::new());
        let mut orchestrator = Orchestrator::new(classifier.clone(), store);
        orchestrator
            .add_agent(EchoAgent::new("Agent A", "output of a"))
            .unwrap();
        orchestrator
            .add_agent(EchoAgent::new("Agent B", "output of b"))
            .unwrap();

        let outcome = orchestrator
            .route_request("start", "u1", "s1", "req-1", &HashMap::new())
            .await
            .unwrap();
        assert_eq!(hops(outcome).len(), 2);
        // With the sentinel in next_action_input the previous hop's full
        // output becomes the next sub-task input
        assert_eq!(
            classifier.seen_inputs(),
            vec!["start".to_string(), "output of a".to_string()]
        );
    }

    #[tokio::test]
    async fn test_no_agent_fallback() {
        let classifier = ScriptedClassifier::new(vec![Ok(no_agent())]);
        let store = Arc::new(MemoryStore::new());
        let mut orchestrator = Orchestrator::new(classifier, store.clone());
        orchestrator
            .add_agent(EchoAgent::new("Echo Agent", "hi"))
            .unwrap();

        let outcome = orchestrator
            .route_request("gibberish", "u1", "s1", "req-1", &HashMap::new())
            .await
            .unwrap();
        match outcome {
            RouteOutcome::Fallback(text) => {
                assert_eq!(text, RoutingConfig::default().not_selected_message);
            }
            RouteOutcome::Completed(_) => panic!("expected fallback"),
        }
        // Zero hops, zero persisted messages
        assert!(store.fetch_all_chats("u1", "s1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unregistered_selection_falls_back() {
        let classifier = ScriptedClassifier::new(vec![Ok(select(
            "missing-agent",
            NextAction::RespondToUser,
            UNKNOWN_SENTINEL,
        ))]);
        let store = Arc::new(MemoryStore::new());
        let orchestrator = Orchestrator::new(classifier, store);

        let outcome = orchestrator
            .route_request("hi", "u1", "s1", "req-1", &HashMap::new())
            .await
            .unwrap();
        assert!(matches!(outcome, RouteOutcome::Fallback(_)));
    }

    #[tokio::test]
    async fn test_classifier_failure_yields_error_message() {
        let classifier = ScriptedClassifier::new(vec![Err("model unavailable".to_string())]);
        let store = Arc::new(MemoryStore::new());
        let orchestrator = Orchestrator::new(classifier, store);

        let outcome = orchestrator
            .route_request("hi", "u1", "s1", "req-1", &HashMap::new())
            .await
            .unwrap();
        match outcome {
            RouteOutcome::Fallback(text) => {
                assert_eq!(text, RoutingConfig::default().routing_error_message);
            }
            RouteOutcome::Completed(_) => panic!("expected fallback"),
        }
    }

    #[tokio::test]
    async fn test_agent_failure_yields_error_message_without_persistence() {
        let classifier = ScriptedClassifier::new(vec![Ok(select(
            "broken-agent",
            NextAction::RespondToUser,
            UNKNOWN_SENTINEL,
        ))]);
        let store = Arc::new(MemoryStore::new());
        let mut orchestrator = Orchestrator::new(classifier, store.clone());
        orchestrator
            .add_agent(Arc::new(EchoAgent {
                name: "Broken Agent".to_string(),
                reply: String::new(),
                persist: true,
                fail: true,
            }))
            .unwrap();

        let outcome = orchestrator
            .route_request("hi", "u1", "s1", "req-1", &HashMap::new())
            .await
            .unwrap();
        match outcome {
            RouteOutcome::Fallback(text) => {
                assert_eq!(text, RoutingConfig::default().routing_error_message);
            }
            RouteOutcome::Completed(_) => panic!("expected fallback"),
        }
        assert!(store.fetch_all_chats("u1", "s1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_non_persisting_agent_saves_nothing() {
        let classifier = ScriptedClassifier::new(vec![Ok(select(
            "quiet-agent",
            NextAction::RespondToUser,
            UNKNOWN_SENTINEL,
        ))]);
        let store = Arc::new(MemoryStore::new());
        let mut orchestrator = Orchestrator::new(classifier, store.clone());
        orchestrator
            .add_agent(Arc::new(EchoAgent {
                name: "Quiet Agent".to_string(),
                reply: "done".to_string(),
                persist: false,
                fail: false,
            }))
            .unwrap();

        let outcome = orchestrator
            .route_request("hi", "u1", "s1", "req-1", &HashMap::new())
            .await
            .unwrap();
        assert_eq!(hops(outcome).len(), 1);
        assert!(store.fetch_all_chats("u1", "s1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_hop_ceiling_enforced() {
        let classifier = Arc::new(LoopingClassifier {
            classification: select(
                "echo-agent",
                NextAction::Delegate("echo-agent".to_string()),
                "again",
            ),
        });
        let store = Arc::new(MemoryStore::new());
        let mut orchestrator = Orchestrator::new(classifier, store).with_config(RoutingConfig {
            max_hops: 3,
            ..RoutingConfig::default()
        });
        orchestrator
            .add_agent(EchoAgent::new("Echo Agent", "looping"))
            .unwrap();

        let err = orchestrator
            .route_request("hi", "u1", "s1", "req-1", &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RouteError::MaxHopsExceeded { max: 3 }));
    }
}
