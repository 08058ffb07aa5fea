//! The turn runtime: the heart of Parley.
//!
//! A turn follows a **Retrieve → Prompt → Act → Observe** cycle:
//!
//! 1. **Retrieve** context for the user's message from their own documents
//! 2. **Prompt** the model with instructions, context and recent history
//! 3. **Act**: execute the operations the model requests, one at a time
//! 4. **Observe**: feed compacted results back and start the next round
//!
//! The cycle ends when the model stops requesting operations, calls
//! `end_turn`, or hits a resource limit. Text, operation results, speech
//! and signals stream to the caller as they are produced.

pub mod compaction;
pub mod emitter;
pub mod orchestrator;
pub mod prompt;
pub mod segmenter;
pub mod speech;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use compaction::CompactionLimits;
pub use emitter::StreamEmitter;
pub use orchestrator::{OrchestratorConfig, TurnLimits, TurnOrchestrator};
pub use segmenter::SentenceSegmenter;
pub use speech::SpeechScheduler;
