//! Conversation turns: one user message through to termination.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::IdentityPartition;
use crate::message::{ConversationId, Message};
use crate::model::Usage;

/// Lifecycle status. Transitions only Active → Terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Active,
    Terminated,
}

/// Why a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// The model requested `end_turn`
    ExplicitEnd,
    /// A round returned no operation requests
    ImplicitEndNoOps,
    /// An iteration or operation limit was hit
    LimitReached,
    /// The model round-trip failed
    ModelError,
    /// The outbound channel closed
    ClientDisconnected,
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ExplicitEnd => "explicit_end",
            Self::ImplicitEndNoOps => "implicit_end_no_ops",
            Self::LimitReached => "limit_reached",
            Self::ModelError => "model_error",
            Self::ClientDisconnected => "client_disconnected",
        };
        f.write_str(s)
    }
}

/// What a caller hands the orchestrator to start a turn.
#[derive(Debug, Clone)]
pub struct TurnInput {
    pub conversation_id: ConversationId,
    pub identity: IdentityPartition,
    pub user_message: String,
    /// Prior conversation history, oldest first
    pub history: Vec<Message>,
}

impl TurnInput {
    pub fn new(identity: IdentityPartition, user_message: impl Into<String>) -> Self {
        Self {
            conversation_id: ConversationId::new(),
            identity,
            user_message: user_message.into(),
            history: Vec::new(),
        }
    }

    pub fn with_conversation(mut self, id: ConversationId) -> Self {
        self.conversation_id = id;
        self
    }

    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }
}

/// State of one turn. Owned and mutated only by its orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub id: String,
    pub conversation_id: ConversationId,
    pub identity: IdentityPartition,
    pub status: TurnStatus,
    pub termination_reason: Option<TerminationReason>,
    /// Completed rounds
    pub iteration_count: u32,
    pub total_operations_executed: u32,
    pub usage: Usage,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Messages produced during the turn, for the persistence hand-off
    #[serde(default)]
    pub produced_messages: Vec<Message>,
}

impl ConversationTurn {
    pub fn start(conversation_id: ConversationId, identity: IdentityPartition) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            conversation_id,
            identity,
            status: TurnStatus::Active,
            termination_reason: None,
            iteration_count: 0,
            total_operations_executed: 0,
            usage: Usage::default(),
            started_at: Utc::now(),
            ended_at: None,
            produced_messages: Vec::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == TurnStatus::Active
    }

    /// Move to `Terminated`. Returns `false` (and changes nothing) if the
    /// turn was already terminated.
    pub fn terminate(&mut self, reason: TerminationReason) -> bool {
        if !self.is_active() {
            return false;
        }
        self.status = TurnStatus::Terminated;
        self.termination_reason = Some(reason);
        self.ended_at = Some(Utc::now());
        true
    }
}
