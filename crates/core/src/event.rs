//! Domain event system: decoupled observation of turns.
//!
//! Events are published as turns progress. Other components (metrics
//! exporters, audit logs, persistence) can subscribe without the
//! orchestrator knowing about them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::retrieval::RetrievalMethod;
use crate::turn::TerminationReason;

/// All domain events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    /// A turn began
    TurnStarted {
        turn_id: String,
        conversation_id: String,
        identity: String,
        timestamp: DateTime<Utc>,
    },

    /// Context was retrieved for a round
    ContextRetrieved {
        turn_id: String,
        method: RetrievalMethod,
        chunks: usize,
        tokens: usize,
        timestamp: DateTime<Utc>,
    },

    /// An operation was executed
    OperationExecuted {
        turn_id: String,
        kind: String,
        success: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A turn reached its terminal state
    TurnTerminated {
        turn_id: String,
        reason: TerminationReason,
        iterations: u32,
        operations_executed: u32,
        timestamp: DateTime<Utc>,
    },
}

/// A broadcast-based event bus for domain events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: DomainEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
