//! The operation dispatcher.
//!
//! Routes a checked [`OperationRequest`] to the handler registered for its
//! kind, bounds the call with a timeout, and normalizes every outcome
//! (success, handler error, timeout, panic, missing handler) into an
//! [`OperationResult`]. It never returns an error and never panics.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parley_core::error::OperationError;
use parley_core::model::OperationSpec;
use parley_core::operation::{
    OperationContext, OperationHandler, OperationKind, OperationRequest, OperationResult,
};
use tracing::{debug, warn};

/// Default per-call timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// A closed lookup table of handlers keyed by [`OperationKind`].
pub struct OperationDispatcher {
    handlers: HashMap<OperationKind, Arc<dyn OperationHandler>>,
    default_timeout: Duration,
    timeouts: HashMap<OperationKind, Duration>,
}

impl OperationDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            default_timeout: DEFAULT_TIMEOUT,
            timeouts: HashMap::new(),
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Override the timeout for one kind.
    pub fn with_timeout(mut self, kind: OperationKind, timeout: Duration) -> Self {
        self.timeouts.insert(kind, timeout);
        self
    }

    /// Register a handler. Replaces any existing handler for the same kind.
    pub fn register(&mut self, handler: Arc<dyn OperationHandler>) {
        self.handlers.insert(handler.kind(), handler);
    }

    pub fn has_handler(&self, kind: OperationKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Registered kinds, in declaration order.
    pub fn kinds(&self) -> Vec<OperationKind> {
        let mut kinds: Vec<_> = self.handlers.keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// Specs of every registered kind, for the model request.
    pub fn operation_specs(&self) -> Vec<OperationSpec> {
        self.kinds()
            .into_iter()
            .filter_map(|k| self.handlers.get(&k).map(|h| h.to_spec()))
            .collect()
    }

    pub fn timeout_for(&self, kind: OperationKind) -> Duration {
        self.timeouts
            .get(&kind)
            .copied()
            .unwrap_or(self.default_timeout)
    }

    /// Execute one request.
    pub async fn execute(
        &self,
        context: &OperationContext,
        request: &OperationRequest,
    ) -> OperationResult {
        let started = Instant::now();
        let kind = request.kind;

        let Some(handler) = self.handlers.get(&kind).cloned() else {
            let err = OperationError::Unsupported {
                kind: kind.to_string(),
            };
            warn!(request_id = %request.id, kind = %kind, "No handler registered");
            return OperationResult::failed(&request.id, kind.as_str(), &err, 0);
        };

        let timeout = self.timeout_for(kind);
        debug!(
            request_id = %request.id,
            kind = %kind,
            timeout_ms = timeout.as_millis() as u64,
            "Dispatching operation"
        );

        let task_context = context.clone();
        let task_request = request.clone();
        let mut task =
            tokio::spawn(async move { handler.handle(&task_context, &task_request).await });

        let outcome = match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => {
                let reason = if join_error.is_panic() {
                    "handler panicked".to_string()
                } else {
                    format!("handler task failed: {join_error}")
                };
                Err(OperationError::ExecutionFailed {
                    kind: kind.to_string(),
                    reason,
                })
            }
            Err(_) => {
                task.abort();
                Err(OperationError::Timeout {
                    kind: kind.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(output) => {
                debug!(request_id = %request.id, kind = %kind, duration_ms, "Operation succeeded");
                OperationResult::succeeded(&request.id, kind.as_str(), output, duration_ms)
            }
            Err(e) => {
                warn!(request_id = %request.id, kind = %kind, duration_ms, "Operation failed: {e}");
                OperationResult::failed(&request.id, kind.as_str(), &e, duration_ms)
            }
        }
    }
}

impl Default for OperationDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
