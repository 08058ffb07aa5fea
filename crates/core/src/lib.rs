//! # Parley Core
//!
//! Domain types, traits, and error definitions for the Parley conversational
//! agent runtime. This crate has **zero framework dependencies**: it defines
//! the domain model that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every external collaborator is defined as a trait here: the model service,
//! operation handlers, the embedding and index services, and speech synthesis.
//! Implementations live in their respective crates, so the orchestrator can be
//! driven by real HTTP services or by scripted test doubles alike.

pub mod error;
pub mod event;
pub mod identity;
pub mod message;
pub mod model;
pub mod operation;
pub mod retrieval;
pub mod speech;
pub mod stream;
pub mod turn;

// Re-export key types at crate root for ergonomics
pub use error::{ChannelError, Error, ModelError, OperationError, Result, RetrievalError};
pub use event::{DomainEvent, EventBus};
pub use identity::IdentityPartition;
pub use message::{ConversationId, Message, MessageOperationCall, Role};
pub use model::{ModelChunk, ModelRequest, ModelService, ModelStream, OperationSpec, Usage};
pub use operation::{
    OperationContext, OperationFailure, OperationHandler, OperationKind, OperationOutput,
    OperationRequest, OperationResult,
};
pub use retrieval::{
    ChunkIndex, ChunkRecord, EmbeddingService, RetrievalBundle, RetrievalCandidate,
    RetrievalMethod, ScoredChunk,
};
pub use speech::{SpeechSynthesizer, SynthesizedSpeech};
pub use stream::{DoneSummary, SideEffectSignal, StreamEvent, StreamEventKind, StreamPayload};
pub use turn::{ConversationTurn, TerminationReason, TurnInput, TurnStatus};
