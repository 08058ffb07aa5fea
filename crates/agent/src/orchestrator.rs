//! The turn orchestrator.
//!
//! Drives one user turn through repeated rounds of
//! **retrieve → prompt → stream → dispatch → compact**:
//!
//! 1. Retrieve context for the user message (plus recent assistant text)
//! 2. Submit instructions, context and windowed history to the model
//! 3. Forward text deltas to the client (and to speech, if enabled)
//! 4. No operation calls → the turn ends implicitly
//! 5. Otherwise cap the calls, dispatch them one by one, emit each result
//! 6. An `end_turn` call ends the turn explicitly
//! 7. Iteration and operation limits end the turn with a truncation notice
//! 8. Compacted results go back into the history and the next round starts
//!
//! Every turn ends with exactly one `done` event while the client is still
//! listening.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use parley_config::AppConfig;
use parley_core::error::ModelError;
use parley_core::event::{DomainEvent, EventBus};
use parley_core::message::{Message, MessageOperationCall, Role};
use parley_core::model::{ModelRequest, ModelService};
use parley_core::operation::{OperationContext, OperationKind, OperationRequest, OperationResult};
use parley_core::speech::SpeechSynthesizer;
use parley_core::stream::{DoneSummary, SideEffectSignal, StreamEvent};
use parley_core::turn::{ConversationTurn, TerminationReason, TurnInput};
use parley_operations::OperationDispatcher;
use parley_retrieval::{RetrievalOptions, RetrievalPipeline};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::compaction::{CompactionLimits, compact_round};
use crate::emitter::StreamEmitter;
use crate::prompt::{build_system_prompt, retrieval_query, window_history};
use crate::speech::SpeechScheduler;

/// Events buffered between the orchestrator and the client.
pub const EVENT_BUFFER: usize = 256;

/// Resource caps for one user turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnLimits {
    pub max_iterations: u32,
    pub max_ops_per_turn: usize,
    pub max_total_ops: u32,
}

impl Default for TurnLimits {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_ops_per_turn: 20,
            max_total_ops: 50,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub model: String,
    pub instructions: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub limits: TurnLimits,
    pub retrieval: RetrievalOptions,
    pub history_window: usize,
    pub compaction: CompactionLimits,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from_app_config(&AppConfig::default())
    }
}

impl OrchestratorConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            model: config.model.name.clone(),
            instructions: config.instructions.clone(),
            temperature: config.model.temperature,
            max_tokens: Some(config.model.max_tokens),
            limits: TurnLimits {
                max_iterations: config.limits.max_iterations,
                max_ops_per_turn: config.limits.max_ops_per_turn,
                max_total_ops: config.limits.max_total_ops,
            },
            retrieval: RetrievalOptions {
                top_k: config.retrieval.top_k,
                use_hybrid: config.retrieval.use_hybrid,
                use_rerank: config.retrieval.use_rerank,
                max_tokens: config.retrieval.max_tokens,
            },
            history_window: config.context.history_window,
            compaction: CompactionLimits {
                result_chars: config.context.result_summary_chars,
                round_chars: config.context.round_summary_chars,
            },
        }
    }

    pub fn with_limits(mut self, limits: TurnLimits) -> Self {
        self.limits = limits;
        self
    }
}

/// What one model round produced.
struct RoundOutput {
    text: String,
    calls: Vec<MessageOperationCall>,
}

enum RoundError {
    Model(ModelError),
    Disconnected,
}

/// Mutable state of a running turn.
struct TurnState {
    turn: ConversationTurn,
    emitter: StreamEmitter,
    speech: Option<SpeechScheduler>,
    history: Vec<Message>,
    issued_ids: HashSet<String>,
}

pub struct TurnOrchestrator {
    model: Arc<dyn ModelService>,
    dispatcher: Arc<OperationDispatcher>,
    retrieval: Arc<RetrievalPipeline>,
    speech: Option<Arc<dyn SpeechSynthesizer>>,
    event_bus: Option<Arc<EventBus>>,
    config: OrchestratorConfig,
}

impl TurnOrchestrator {
    pub fn new(
        model: Arc<dyn ModelService>,
        dispatcher: Arc<OperationDispatcher>,
        retrieval: Arc<RetrievalPipeline>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            model,
            dispatcher,
            retrieval,
            speech: None,
            event_bus: None,
            config,
        }
    }

    /// Synthesize speech for the model's text as it streams.
    pub fn with_speech(mut self, synthesizer: Arc<dyn SpeechSynthesizer>) -> Self {
        self.speech = Some(synthesizer);
        self
    }

    /// Publish domain events on `bus`.
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Spawn a turn. Returns the event stream and a handle that yields the
    /// terminated turn.
    pub fn run(
        self: &Arc<Self>,
        input: TurnInput,
    ) -> (mpsc::Receiver<StreamEvent>, JoinHandle<ConversationTurn>) {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let orchestrator = Arc::clone(self);
        let handle = tokio::spawn(async move { orchestrator.execute(input, tx).await });
        (rx, handle)
    }

    /// Drive a turn to completion on the current task.
    pub async fn execute(
        &self,
        input: TurnInput,
        sender: mpsc::Sender<StreamEvent>,
    ) -> ConversationTurn {
        let turn = ConversationTurn::start(input.conversation_id.clone(), input.identity.clone());
        info!(
            turn_id = %turn.id,
            conversation_id = %turn.conversation_id,
            identity = %turn.identity,
            "Turn started"
        );
        self.publish(DomainEvent::TurnStarted {
            turn_id: turn.id.clone(),
            conversation_id: turn.conversation_id.to_string(),
            identity: turn.identity.to_string(),
            timestamp: Utc::now(),
        });

        let mut history = input.history;
        let user_message = Message::user(&input.user_message);
        history.push(user_message.clone());

        let mut state = TurnState {
            turn,
            emitter: StreamEmitter::new(sender),
            speech: self.speech.clone().map(SpeechScheduler::new),
            history,
            issued_ids: HashSet::new(),
        };
        state.turn.produced_messages.push(user_message);

        let reason = self.drive(&input.user_message, &mut state).await;
        self.finish(state, reason).await
    }

    async fn drive(&self, user_message: &str, state: &mut TurnState) -> TerminationReason {
        let limits = self.config.limits;
        let specs = self.dispatcher.operation_specs();
        let context = OperationContext {
            turn_id: state.turn.id.clone(),
            identity: state.turn.identity.clone(),
        };
        let mut last_assistant_text: Option<String> = None;

        loop {
            if !state.emitter.is_writable() {
                return TerminationReason::ClientDisconnected;
            }
            let iteration = state.turn.iteration_count;
            debug!(turn_id = %state.turn.id, iteration, "Starting round");

            // Context
            let query = retrieval_query(user_message, last_assistant_text.as_deref());
            let bundle = self
                .retrieval
                .retrieve(&query, &state.turn.identity, &self.config.retrieval)
                .await;
            debug!(
                turn_id = %state.turn.id,
                iteration,
                chunks = bundle.selected_chunks.len(),
                tokens = bundle.tokens_used,
                method = ?bundle.method_used,
                "Context retrieved"
            );
            self.publish(DomainEvent::ContextRetrieved {
                turn_id: state.turn.id.clone(),
                method: bundle.method_used,
                chunks: bundle.selected_chunks.len(),
                tokens: bundle.tokens_used,
                timestamp: Utc::now(),
            });

            // Model round-trip
            let request = ModelRequest {
                model: self.config.model.clone(),
                system_prompt: build_system_prompt(&self.config.instructions, &bundle),
                history: window_history(&state.history, self.config.history_window),
                operations: specs.clone(),
                temperature: self.config.temperature,
                max_tokens: self.config.max_tokens,
            };
            let round = match self.stream_round(request, state).await {
                Ok(round) => round,
                Err(RoundError::Model(e)) => {
                    if !state.emitter.is_writable() {
                        debug!(
                            turn_id = %state.turn.id,
                            iteration,
                            "Model failed after client left: {e}"
                        );
                        return TerminationReason::ClientDisconnected;
                    }
                    error!(turn_id = %state.turn.id, iteration, "Model round-trip failed: {e}");
                    if state.emitter.error(e.to_string()).await.is_err() {
                        return TerminationReason::ClientDisconnected;
                    }
                    return TerminationReason::ModelError;
                }
                Err(RoundError::Disconnected) => return TerminationReason::ClientDisconnected,
            };

            if round.calls.is_empty() {
                let reply = Message::assistant(&round.text);
                state.history.push(reply.clone());
                state.turn.produced_messages.push(reply);
                return TerminationReason::ImplicitEndNoOps;
            }

            // Cap the round
            let mut calls = assign_ids(round.calls, iteration, &mut state.issued_ids);
            let remaining = limits
                .max_total_ops
                .saturating_sub(state.turn.total_operations_executed) as usize;
            let cap = limits.max_ops_per_turn.min(remaining);
            if calls.len() > cap {
                let dropped = calls.len() - cap;
                warn!(
                    turn_id = %state.turn.id,
                    iteration,
                    requested = calls.len(),
                    dropped,
                    cap,
                    "Dropping operation requests over the cap"
                );
                calls.truncate(cap);
                let signal = SideEffectSignal::OperationsDropped {
                    iteration,
                    dropped,
                    limit: cap,
                };
                if state.emitter.signal(signal).await.is_err() {
                    return TerminationReason::ClientDisconnected;
                }
            }

            let mut reply = Message::assistant(&round.text);
            reply.operation_calls = calls.clone();
            state.history.push(reply.clone());
            state.turn.produced_messages.push(reply);

            // Dispatch, strictly in order
            let mut results = Vec::with_capacity(calls.len());
            let mut end_requested = false;
            let mut disconnected = false;
            for call in &calls {
                if !state.emitter.is_writable() {
                    disconnected = true;
                    break;
                }
                let result = self.dispatch(&context, call, iteration).await;
                state.turn.total_operations_executed += 1;
                let kind = result.operation_kind();
                end_requested |= kind == Some(OperationKind::EndTurn);

                if state.emitter.operation_result(result.clone()).await.is_err() {
                    disconnected = true;
                    results.push(result);
                    break;
                }
                if let Some(kind) = kind.filter(|k| result.success && k.is_side_effecting()) {
                    let signal = SideEffectSignal::ExternalStateChanged {
                        request_id: result.request_id.clone(),
                        kind,
                    };
                    if state.emitter.signal(signal).await.is_err() {
                        disconnected = true;
                        results.push(result);
                        break;
                    }
                }
                results.push(result);
            }

            for compacted in compact_round(&results, self.config.compaction) {
                let message = Message::operation_result(compacted.request_id, compacted.content);
                state.history.push(message.clone());
                state.turn.produced_messages.push(message);
            }

            if disconnected {
                return TerminationReason::ClientDisconnected;
            }
            if end_requested {
                return TerminationReason::ExplicitEnd;
            }

            state.turn.iteration_count += 1;
            let iterations = state.turn.iteration_count;
            let executed = state.turn.total_operations_executed;
            if iterations >= limits.max_iterations || executed >= limits.max_total_ops {
                warn!(
                    turn_id = %state.turn.id,
                    iterations,
                    operations_executed = executed,
                    "Turn limit reached"
                );
                let notice = SideEffectSignal::TruncationNotice {
                    message: format!(
                        "Stopped after {iterations} rounds and {executed} operations; \
                         the request may be incomplete."
                    ),
                    iterations,
                    operations_executed: executed,
                };
                let _ = state.emitter.signal(notice).await;
                return TerminationReason::LimitReached;
            }

            last_assistant_text = Some(round.text);
        }
    }

    /// Submit one round and stream its text to the client.
    async fn stream_round(
        &self,
        request: ModelRequest,
        state: &mut TurnState,
    ) -> Result<RoundOutput, RoundError> {
        let mut stream = self.model.submit(request).await.map_err(RoundError::Model)?;

        let mut text = String::new();
        let mut calls: Vec<MessageOperationCall> = Vec::new();
        let mut completed = false;

        while let Some(item) = stream.recv().await {
            let chunk = item.map_err(RoundError::Model)?;

            if let Some(delta) = chunk.text_delta.filter(|d| !d.is_empty()) {
                text.push_str(&delta);
                state
                    .emitter
                    .text_delta(delta.clone())
                    .await
                    .map_err(|_| RoundError::Disconnected)?;
                if let Some(speech) = state.speech.as_mut() {
                    speech
                        .push_text(&delta, &mut state.emitter)
                        .await
                        .map_err(|_| RoundError::Disconnected)?;
                }
            }
            merge_calls(&mut calls, chunk.operation_calls);
            if let Some(usage) = chunk.usage {
                state.turn.usage.accumulate(&usage);
            }
            if chunk.done {
                completed = true;
                break;
            }
        }

        if !completed {
            return Err(RoundError::Model(ModelError::StreamInterrupted(
                "stream ended before completion".into(),
            )));
        }
        if let Some(speech) = state.speech.as_mut() {
            speech
                .flush(&mut state.emitter)
                .await
                .map_err(|_| RoundError::Disconnected)?;
        }
        Ok(RoundOutput { text, calls })
    }

    /// Validate and execute one call. Never fails.
    async fn dispatch(
        &self,
        context: &OperationContext,
        call: &MessageOperationCall,
        iteration: u32,
    ) -> OperationResult {
        let result = match OperationRequest::from_call(call, &call.id, iteration) {
            Ok(request) => self.dispatcher.execute(context, &request).await,
            Err(e) => {
                warn!(
                    turn_id = %context.turn_id,
                    request_id = %call.id,
                    kind = %call.name,
                    "Rejected operation call: {e}"
                );
                OperationResult::failed(&call.id, &call.name, &e, 0)
            }
        };
        self.publish(DomainEvent::OperationExecuted {
            turn_id: context.turn_id.clone(),
            kind: result.kind.clone(),
            success: result.success,
            duration_ms: result.duration_ms,
            timestamp: Utc::now(),
        });
        result
    }

    async fn finish(&self, mut state: TurnState, reason: TerminationReason) -> ConversationTurn {
        state.turn.terminate(reason);

        let message_id = state
            .turn
            .produced_messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(|m| m.id.clone())
            .unwrap_or_default();
        let summary = DoneSummary {
            turn_id: state.turn.id.clone(),
            conversation_id: state.turn.conversation_id.to_string(),
            termination_reason: reason,
            iterations: state.turn.iteration_count,
            operations_executed: state.turn.total_operations_executed,
            usage: state.turn.usage,
            message_id,
        };
        if let Err(e) = state.emitter.done(summary).await {
            debug!(turn_id = %state.turn.id, "Done not delivered: {e}");
        }

        self.publish(DomainEvent::TurnTerminated {
            turn_id: state.turn.id.clone(),
            reason,
            iterations: state.turn.iteration_count,
            operations_executed: state.turn.total_operations_executed,
            timestamp: Utc::now(),
        });
        info!(
            turn_id = %state.turn.id,
            reason = %reason,
            iterations = state.turn.iteration_count,
            operations = state.turn.total_operations_executed,
            total_tokens = state.turn.usage.total_tokens,
            "Turn terminated"
        );
        state.turn
    }

    fn publish(&self, event: DomainEvent) {
        if let Some(bus) = &self.event_bus {
            bus.publish(event);
        }
    }
}

/// Merge streamed call deltas that share an id.
fn merge_calls(calls: &mut Vec<MessageOperationCall>, incoming: Vec<MessageOperationCall>) {
    for call in incoming {
        let existing = if call.id.is_empty() {
            None
        } else {
            calls.iter_mut().find(|c| c.id == call.id)
        };
        match existing {
            Some(existing) => {
                if existing.name.is_empty() {
                    existing.name = call.name;
                }
                existing.arguments.push_str(&call.arguments);
            }
            None => calls.push(call),
        }
    }
}

/// Give every call a turn-unique id. Missing or repeated ids become
/// `op_<iteration>_<index>`.
fn assign_ids(
    calls: Vec<MessageOperationCall>,
    iteration: u32,
    issued: &mut HashSet<String>,
) -> Vec<MessageOperationCall> {
    calls
        .into_iter()
        .enumerate()
        .map(|(index, mut call)| {
            if call.id.is_empty() || issued.contains(&call.id) {
                let mut id = format!("op_{iteration}_{index}");
                while issued.contains(&id) {
                    id.push('_');
                }
                call.id = id;
            }
            issued.insert(call.id.clone());
            call
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::*;
    use parley_core::identity::IdentityPartition;
    use parley_core::stream::{StreamEventKind, StreamPayload};
    use parley_operations::EndTurnHandler;
    use parley_retrieval::Ingestor;
    use serde_json::json;

    struct Harness {
        model: Arc<ScriptedModelService>,
        email: Arc<RecordingHandler>,
        search: Arc<RecordingHandler>,
        orchestrator: Arc<TurnOrchestrator>,
        bus: Arc<EventBus>,
    }

    fn harness_with(model: ScriptedModelService, config: OrchestratorConfig) -> Harness {
        let model = Arc::new(model);
        let email = Arc::new(RecordingHandler::new(OperationKind::SendEmail));
        let search = Arc::new(RecordingHandler::with_payload(
            OperationKind::WebSearch,
            json!({"results": ["a", "b"]}),
        ));
        let mut dispatcher = OperationDispatcher::new();
        dispatcher.register(email.clone());
        dispatcher.register(search.clone());
        dispatcher.register(Arc::new(EndTurnHandler));
        dispatcher.register(Arc::new(FailingHandler(OperationKind::CreateCalendarEvent)));

        let (pipeline, _, _) = empty_pipeline();
        let bus = Arc::new(EventBus::new(256));
        let orchestrator = Arc::new(
            TurnOrchestrator::new(model.clone(), Arc::new(dispatcher), pipeline, config)
                .with_event_bus(bus.clone()),
        );
        Harness {
            model,
            email,
            search,
            orchestrator,
            bus,
        }
    }

    fn harness(model: ScriptedModelService) -> Harness {
        harness_with(model, OrchestratorConfig::default())
    }

    fn input() -> TurnInput {
        TurnInput::new(IdentityPartition::user("alice"), "Email Bob the report")
    }

    async fn run_turn(h: &Harness) -> (Vec<StreamEvent>, ConversationTurn) {
        let (rx, handle) = h.orchestrator.run(input());
        let events = collect_events(rx).await;
        (events, handle.await.unwrap())
    }

    fn kinds(events: &[StreamEvent]) -> Vec<StreamEventKind> {
        events.iter().map(StreamEvent::kind).collect()
    }

    fn done_count(events: &[StreamEvent]) -> usize {
        events
            .iter()
            .filter(|e| e.kind() == StreamEventKind::Done)
            .count()
    }

    fn results(events: &[StreamEvent]) -> Vec<OperationResult> {
        events
            .iter()
            .filter_map(|e| match &e.payload {
                StreamPayload::OperationResult { result } => Some(result.clone()),
                _ => None,
            })
            .collect()
    }

    fn signals(events: &[StreamEvent]) -> Vec<SideEffectSignal> {
        events
            .iter()
            .filter_map(|e| match &e.payload {
                StreamPayload::SideEffectSignal { signal } => Some(signal.clone()),
                _ => None,
            })
            .collect()
    }

    fn summary(events: &[StreamEvent]) -> DoneSummary {
        match &events.last().unwrap().payload {
            StreamPayload::Done { summary } => summary.clone(),
            other => panic!("last event is not done: {other:?}"),
        }
    }

    #[tokio::test]
    async fn no_operations_ends_implicitly() {
        let h = harness(ScriptedModelService::single_text("Sure, here it is."));
        let (events, turn) = run_turn(&h).await;

        assert_eq!(turn.termination_reason, Some(TerminationReason::ImplicitEndNoOps));
        assert!(!turn.is_active());
        assert!(turn.ended_at.is_some());
        assert_eq!(done_count(&events), 1);

        let text: String = events
            .iter()
            .filter_map(|e| match &e.payload {
                StreamPayload::TextDelta { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "Sure, here it is.");

        let done = summary(&events);
        assert_eq!(done.usage, ROUND_USAGE);
        assert_eq!(done.iterations, 0);
        let reply = turn.produced_messages.last().unwrap();
        assert_eq!(reply.role, Role::Assistant);
        assert_eq!(done.message_id, reply.id);
    }

    #[tokio::test]
    async fn sequence_numbers_are_contiguous() {
        let h = harness(ScriptedModelService::new(vec![
            operation_round("Sending. ", vec![call("c1", "send_email", json!({"to": "bob"}))]),
            text_round("Done! Anything else?"),
        ]));
        let (events, _) = run_turn(&h).await;

        let seqs: Vec<u64> = events.iter().map(|e| e.sequence_number).collect();
        let expected: Vec<u64> = (0..events.len() as u64).collect();
        assert_eq!(seqs, expected);
        assert_eq!(kinds(&events).last(), Some(&StreamEventKind::Done));
    }

    #[tokio::test]
    async fn iteration_limit_stops_endless_model() {
        let endless = ScriptedModelService::repeating(operation_round(
            "Searching again.",
            vec![call("c1", "web_search", json!({"query": "rust"}))],
        ));
        let h = harness(endless);
        let (events, turn) = run_turn(&h).await;

        assert_eq!(turn.termination_reason, Some(TerminationReason::LimitReached));
        assert_eq!(turn.iteration_count, 10);
        assert_eq!(h.model.call_count(), 10);
        assert_eq!(h.search.seen().len(), 10);

        let notices = signals(&events)
            .into_iter()
            .filter(|s| matches!(s, SideEffectSignal::TruncationNotice { .. }))
            .count();
        assert_eq!(notices, 1);
        assert_eq!(done_count(&events), 1);
        assert_eq!(summary(&events).iterations, 10);
    }

    #[tokio::test]
    async fn total_operation_budget_is_enforced() {
        let calls: Vec<_> = (0..4)
            .map(|i| call(&format!("c{i}"), "web_search", json!({"query": "q"})))
            .collect();
        let config = OrchestratorConfig::default().with_limits(TurnLimits {
            max_iterations: 10,
            max_ops_per_turn: 20,
            max_total_ops: 6,
        });
        let h = harness_with(
            ScriptedModelService::repeating(operation_round("", calls)),
            config,
        );
        let (events, turn) = run_turn(&h).await;

        // 4 in the first round, then only 2 of 4 fit the budget
        assert_eq!(turn.total_operations_executed, 6);
        assert_eq!(turn.termination_reason, Some(TerminationReason::LimitReached));
        assert!(signals(&events).contains(&SideEffectSignal::OperationsDropped {
            iteration: 1,
            dropped: 2,
            limit: 2,
        }));
    }

    #[tokio::test]
    async fn per_round_cap_keeps_first_requests() {
        let calls: Vec<_> = (0..25)
            .map(|i| call(&format!("c{i}"), "web_search", json!({"query": format!("q{i}")})))
            .collect();
        let h = harness(ScriptedModelService::new(vec![
            operation_round("", calls),
            text_round("Finished."),
        ]));
        let (events, turn) = run_turn(&h).await;

        let executed = results(&events);
        assert_eq!(executed.len(), 20);
        assert_eq!(executed[0].request_id, "c0");
        assert_eq!(executed[19].request_id, "c19");
        assert_eq!(turn.total_operations_executed, 20);
        assert!(signals(&events).contains(&SideEffectSignal::OperationsDropped {
            iteration: 0,
            dropped: 5,
            limit: 20,
        }));
    }

    #[tokio::test]
    async fn end_turn_ends_explicitly() {
        let h = harness(ScriptedModelService::new(vec![operation_round(
            "All done.",
            vec![
                call("c1", "send_email", json!({"to": "bob"})),
                call("c2", "end_turn", json!({"summary": "sent"})),
            ],
        )]));
        let (events, turn) = run_turn(&h).await;

        assert_eq!(turn.termination_reason, Some(TerminationReason::ExplicitEnd));
        assert_eq!(h.model.call_count(), 1);
        assert_eq!(results(&events).len(), 2);
        assert_eq!(h.email.seen().len(), 1);
        assert_eq!(done_count(&events), 1);
    }

    #[tokio::test]
    async fn result_ids_match_issued_ids_per_iteration() {
        let h = harness(ScriptedModelService::new(vec![
            operation_round(
                "",
                vec![
                    call("dup", "web_search", json!({"query": "a"})),
                    call("", "send_email", json!({"to": "bob"})),
                ],
            ),
            operation_round(
                "",
                vec![
                    call("dup", "web_search", json!({"query": "b"})),
                    call("fresh", "not_a_real_operation", json!({})),
                ],
            ),
            text_round("ok"),
        ]));
        let (events, turn) = run_turn(&h).await;

        let issued: Vec<Vec<String>> = turn
            .produced_messages
            .iter()
            .filter(|m| !m.operation_calls.is_empty())
            .map(|m| m.operation_calls.iter().map(|c| c.id.clone()).collect())
            .collect();
        assert_eq!(issued.len(), 2);

        let returned: Vec<String> = results(&events).into_iter().map(|r| r.request_id).collect();
        let flat: Vec<String> = issued.concat();
        assert_eq!(returned, flat);

        let unique: HashSet<&String> = flat.iter().collect();
        assert_eq!(unique.len(), flat.len());
        assert_eq!(flat[1], "op_0_1");
        assert_eq!(flat[2], "op_1_0");
    }

    #[tokio::test]
    async fn failures_are_fed_back_and_turn_continues() {
        let h = harness(ScriptedModelService::new(vec![
            operation_round(
                "",
                vec![
                    call("c1", "create_calendar_event", json!({"title": "standup"})),
                    call("c2", "no_such_thing", json!({})),
                    call("c3", "place_call", json!({"to": "+1555"})),
                ],
            ),
            text_round("Some of that failed."),
        ]));
        let (events, turn) = run_turn(&h).await;

        let executed = results(&events);
        assert_eq!(executed.len(), 3);
        assert!(executed.iter().all(|r| !r.success));
        assert_eq!(executed[1].error.as_ref().unwrap().code, "unsupported_operation");
        assert_eq!(executed[2].error.as_ref().unwrap().code, "unsupported_operation");
        assert_eq!(turn.termination_reason, Some(TerminationReason::ImplicitEndNoOps));

        // The second round saw ERROR results for every call
        let second = &h.model.requests()[1];
        let tool_messages: Vec<_> = second
            .history
            .iter()
            .filter(|m| m.role == Role::Tool)
            .collect();
        assert_eq!(tool_messages.len(), 3);
        assert!(tool_messages.iter().all(|m| m.content.starts_with("ERROR: ")));
    }

    #[tokio::test]
    async fn side_effects_are_signalled() {
        let h = harness(ScriptedModelService::new(vec![
            operation_round(
                "",
                vec![
                    call("c1", "web_search", json!({"query": "x"})),
                    call("c2", "send_email", json!({"to": "bob"})),
                ],
            ),
            text_round("Sent."),
        ]));
        let (events, _) = run_turn(&h).await;

        let changed: Vec<_> = signals(&events)
            .into_iter()
            .filter_map(|s| match s {
                SideEffectSignal::ExternalStateChanged { request_id, kind } => {
                    Some((request_id, kind))
                }
                _ => None,
            })
            .collect();
        assert_eq!(changed, vec![("c2".to_string(), OperationKind::SendEmail)]);
    }

    #[tokio::test]
    async fn submit_failure_is_one_error_then_done() {
        let h = harness(ScriptedModelService::new(vec![ScriptedRound::SubmitError(
            ModelError::RateLimited {
                retry_after_secs: 3,
            },
        )]));
        let (events, turn) = run_turn(&h).await;

        assert_eq!(kinds(&events), vec![StreamEventKind::Error, StreamEventKind::Done]);
        assert_eq!(turn.termination_reason, Some(TerminationReason::ModelError));
    }

    #[tokio::test]
    async fn mid_stream_failure_is_fatal() {
        let h = harness(ScriptedModelService::new(vec![ScriptedRound::FailMidStream(
            text_chunks("Let me "),
            ModelError::StreamInterrupted("connection reset".into()),
        )]));
        let (events, turn) = run_turn(&h).await;

        assert_eq!(
            kinds(&events),
            vec![
                StreamEventKind::TextDelta,
                StreamEventKind::TextDelta,
                StreamEventKind::Error,
                StreamEventKind::Done
            ]
        );
        assert_eq!(turn.termination_reason, Some(TerminationReason::ModelError));
    }

    #[tokio::test]
    async fn closed_client_stops_the_turn() {
        let h = harness(ScriptedModelService::repeating(operation_round(
            "Working on it.",
            vec![call("c1", "web_search", json!({"query": "x"}))],
        )));
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        drop(rx);

        let turn = h.orchestrator.execute(input(), tx).await;
        assert_eq!(turn.termination_reason, Some(TerminationReason::ClientDisconnected));
        assert_eq!(h.model.call_count(), 0);
        assert!(h.search.seen().is_empty());
    }

    /// Web search handler that hangs up on the client while it runs.
    struct HangUpHandler {
        receiver: std::sync::Mutex<Option<mpsc::Receiver<StreamEvent>>>,
        finished: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl parley_core::operation::OperationHandler for HangUpHandler {
        fn kind(&self) -> OperationKind {
            OperationKind::WebSearch
        }

        async fn handle(
            &self,
            _context: &OperationContext,
            _request: &OperationRequest,
        ) -> Result<parley_core::operation::OperationOutput, parley_core::error::OperationError>
        {
            drop(self.receiver.lock().unwrap().take());
            tokio::task::yield_now().await;
            self.finished
                .store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(parley_core::operation::OperationOutput::json(json!({"results": []})))
        }
    }

    #[tokio::test]
    async fn client_leaving_mid_round_stops_dispatch() {
        let model = Arc::new(ScriptedModelService::repeating(operation_round(
            "On it.",
            vec![
                call("c1", "web_search", json!({"query": "x"})),
                call("c2", "send_email", json!({"to": "bob"})),
            ],
        )));
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let hang_up = Arc::new(HangUpHandler {
            receiver: std::sync::Mutex::new(Some(rx)),
            finished: std::sync::atomic::AtomicBool::new(false),
        });
        let email = Arc::new(RecordingHandler::new(OperationKind::SendEmail));
        let mut dispatcher = OperationDispatcher::new();
        dispatcher.register(hang_up.clone());
        dispatcher.register(email.clone());
        let orchestrator = TurnOrchestrator::new(
            model.clone(),
            Arc::new(dispatcher),
            empty_pipeline().0,
            OrchestratorConfig::default(),
        );

        let turn = orchestrator.execute(input(), tx).await;

        assert!(hang_up.finished.load(std::sync::atomic::Ordering::SeqCst));
        assert!(email.seen().is_empty());
        assert_eq!(model.call_count(), 1);
        assert_eq!(turn.total_operations_executed, 1);
        assert_eq!(turn.termination_reason, Some(TerminationReason::ClientDisconnected));
    }

    /// Model service that hangs up on the client, then fails the request.
    struct HangUpModel {
        receiver: std::sync::Mutex<Option<mpsc::Receiver<StreamEvent>>>,
    }

    #[async_trait::async_trait]
    impl ModelService for HangUpModel {
        fn name(&self) -> &str {
            "hang-up"
        }

        async fn submit(
            &self,
            _request: ModelRequest,
        ) -> Result<parley_core::model::ModelStream, ModelError> {
            drop(self.receiver.lock().unwrap().take());
            Err(ModelError::StreamInterrupted("connection reset".into()))
        }
    }

    #[tokio::test]
    async fn model_failure_after_client_left_is_a_disconnect() {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let model = Arc::new(HangUpModel {
            receiver: std::sync::Mutex::new(Some(rx)),
        });
        let orchestrator = TurnOrchestrator::new(
            model,
            Arc::new(OperationDispatcher::new()),
            empty_pipeline().0,
            OrchestratorConfig::default(),
        );

        let turn = orchestrator.execute(input(), tx).await;
        assert_eq!(turn.termination_reason, Some(TerminationReason::ClientDisconnected));
    }

    #[tokio::test]
    async fn full_round_of_results_reaches_the_next_request() {
        let calls: Vec<_> = (0..20)
            .map(|i| call(&format!("c{i}"), "web_search", json!({"query": format!("q{i}")})))
            .collect();
        let h = harness(ScriptedModelService::new(vec![
            operation_round("Searching.", calls),
            text_round("Here is what I found."),
        ]));
        let (_, turn) = run_turn(&h).await;
        assert_eq!(turn.termination_reason, Some(TerminationReason::ImplicitEndNoOps));

        let second = &h.model.requests()[1];
        assert_eq!(second.history[0].role, Role::User);
        assert_eq!(second.history[0].content, "Email Bob the report");
        assert_eq!(second.history[1].operation_calls.len(), 20);
        let tool_messages = second
            .history
            .iter()
            .filter(|m| m.role == Role::Tool)
            .count();
        assert_eq!(tool_messages, 20);
    }

    #[tokio::test]
    async fn speech_chunks_follow_text() {
        let model = ScriptedModelService::single_text("Hi there. The total is $3.14. Bye");
        let h = harness(model);
        let orchestrator = Arc::new(
            TurnOrchestrator::new(
                h.model.clone(),
                Arc::new(OperationDispatcher::new()),
                empty_pipeline().0,
                OrchestratorConfig::default(),
            )
            .with_speech(Arc::new(TestSynthesizer)),
        );
        let (rx, handle) = orchestrator.run(input());
        let events = collect_events(rx).await;
        handle.await.unwrap();

        let spoken: Vec<String> = events
            .iter()
            .filter_map(|e| match &e.payload {
                StreamPayload::SpeechChunk { text, .. } => Some(text.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(spoken, vec!["Hi there.", "The total is $3.14.", "Bye"]);
        assert_eq!(done_count(&events), 1);
    }

    #[tokio::test]
    async fn retrieved_context_reaches_the_prompt() {
        let model = Arc::new(ScriptedModelService::single_text("25 days."));
        let (pipeline, index, embedder) = empty_pipeline();
        Ingestor::new(embedder, index)
            .ingest(
                &IdentityPartition::user("alice"),
                "handbook",
                "Employees receive 25 vacation days per year.",
            )
            .await
            .unwrap();
        let orchestrator = Arc::new(TurnOrchestrator::new(
            model.clone(),
            Arc::new(OperationDispatcher::new()),
            pipeline,
            OrchestratorConfig::default(),
        ));

        let input = TurnInput::new(
            IdentityPartition::user("alice"),
            "How many vacation days do employees receive per year?",
        );
        let (rx, handle) = orchestrator.run(input);
        collect_events(rx).await;
        handle.await.unwrap();

        let prompt = &model.requests()[0].system_prompt;
        assert!(prompt.contains("[Source: handbook]"));
        assert!(prompt.contains("25 vacation days"));
    }

    #[tokio::test]
    async fn other_identity_gets_no_context() {
        let model = Arc::new(ScriptedModelService::single_text("I don't know."));
        let (pipeline, index, embedder) = empty_pipeline();
        Ingestor::new(embedder, index)
            .ingest(
                &IdentityPartition::user("alice"),
                "handbook",
                "Employees receive 25 vacation days per year.",
            )
            .await
            .unwrap();
        let orchestrator = Arc::new(TurnOrchestrator::new(
            model.clone(),
            Arc::new(OperationDispatcher::new()),
            pipeline,
            OrchestratorConfig::default(),
        ));

        let input = TurnInput::new(
            IdentityPartition::user("bob"),
            "How many vacation days do employees receive per year?",
        );
        let (rx, handle) = orchestrator.run(input);
        collect_events(rx).await;
        handle.await.unwrap();

        assert!(!model.requests()[0].system_prompt.contains("vacation"));
    }

    #[tokio::test]
    async fn domain_events_are_published() {
        let h = harness(ScriptedModelService::new(vec![
            operation_round("", vec![call("c1", "send_email", json!({"to": "bob"}))]),
            text_round("Sent."),
        ]));
        let mut sub = h.bus.subscribe();
        let (_, turn) = run_turn(&h).await;

        let mut names = Vec::new();
        while let Ok(event) = sub.try_recv() {
            names.push(match event.as_ref() {
                DomainEvent::TurnStarted { .. } => "started",
                DomainEvent::ContextRetrieved { method, .. } => {
                    assert!(!method.is_degraded());
                    "context"
                }
                DomainEvent::OperationExecuted { success, .. } => {
                    assert!(success);
                    "executed"
                }
                DomainEvent::TurnTerminated { turn_id, .. } => {
                    assert_eq!(turn_id, &turn.id);
                    "terminated"
                }
            });
        }
        assert_eq!(
            names,
            vec!["started", "context", "executed", "context", "terminated"]
        );
    }

    #[test]
    fn merge_calls_joins_deltas_by_id() {
        let mut calls = Vec::new();
        merge_calls(&mut calls, vec![call("a", "send_email", json!(null))]);
        calls[0].arguments = "{\"to\"".into();
        merge_calls(
            &mut calls,
            vec![MessageOperationCall {
                id: "a".into(),
                name: String::new(),
                arguments: ":\"bob\"}".into(),
                priority: 0,
            }],
        );
        merge_calls(&mut calls, vec![call("b", "end_turn", json!({}))]);

        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "send_email");
        assert_eq!(calls[0].arguments, r#"{"to":"bob"}"#);
    }

    #[test]
    fn config_follows_app_config() {
        let mut app = AppConfig::default();
        app.limits.max_iterations = 3;
        app.retrieval.use_hybrid = false;
        app.context.history_window = 4;
        let config = OrchestratorConfig::from_app_config(&app);
        assert_eq!(config.limits.max_iterations, 3);
        assert!(!config.retrieval.use_hybrid);
        assert_eq!(config.history_window, 4);
        assert_eq!(config.model, app.model.name);
    }
}
