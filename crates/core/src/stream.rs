//! Outbound stream events.
//!
//! Every event of a turn carries a per-turn `sequence_number`. Consumers
//! read events until the `done` event closes the stream:
//! - `text_delta`: partial text from the model
//! - `operation_result`: one operation finished
//! - `speech_chunk`: synthesized audio for one sentence
//! - `side_effect_signal`: truncation notices and external state changes
//! - `error`: a turn-fatal error
//! - `done`: final metadata

use serde::{Deserialize, Serialize};

use crate::model::Usage;
use crate::operation::{OperationKind, OperationResult};
use crate::turn::TerminationReason;

/// The discriminant of a [`StreamPayload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventKind {
    TextDelta,
    OperationResult,
    SpeechChunk,
    SideEffectSignal,
    Error,
    Done,
}

impl StreamEventKind {
    /// SSE-style event name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TextDelta => "text_delta",
            Self::OperationResult => "operation_result",
            Self::SpeechChunk => "speech_chunk",
            Self::SideEffectSignal => "side_effect_signal",
            Self::Error => "error",
            Self::Done => "done",
        }
    }
}

/// One event on the outbound stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    /// Monotonic per turn, starting at 0
    pub sequence_number: u64,

    #[serde(flatten)]
    pub payload: StreamPayload,
}

impl StreamEvent {
    pub fn kind(&self) -> StreamEventKind {
        self.payload.kind()
    }
}

/// Event payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamPayload {
    TextDelta {
        text: String,
    },

    OperationResult {
        result: OperationResult,
    },

    SpeechChunk {
        /// 0-based index of the sentence within the turn
        sentence_index: u32,
        text: String,
        audio_base64: String,
        mime_type: String,
    },

    SideEffectSignal {
        signal: SideEffectSignal,
    },

    Error {
        message: String,
    },

    Done {
        summary: DoneSummary,
    },
}

impl StreamPayload {
    pub fn kind(&self) -> StreamEventKind {
        match self {
            Self::TextDelta { .. } => StreamEventKind::TextDelta,
            Self::OperationResult { .. } => StreamEventKind::OperationResult,
            Self::SpeechChunk { .. } => StreamEventKind::SpeechChunk,
            Self::SideEffectSignal { .. } => StreamEventKind::SideEffectSignal,
            Self::Error { .. } => StreamEventKind::Error,
            Self::Done { .. } => StreamEventKind::Done,
        }
    }
}

/// Signals about the turn that are not model text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum SideEffectSignal {
    /// The turn was cut short by a resource limit.
    TruncationNotice {
        message: String,
        iterations: u32,
        operations_executed: u32,
    },

    /// Requests beyond the per-round or per-turn cap were not executed.
    OperationsDropped {
        iteration: u32,
        dropped: usize,
        limit: usize,
    },

    /// A side-effecting operation succeeded; client views may be stale.
    ExternalStateChanged {
        request_id: String,
        kind: OperationKind,
    },
}

/// Aggregate metadata carried by the terminal `done` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoneSummary {
    pub turn_id: String,
    pub conversation_id: String,
    pub termination_reason: TerminationReason,
    pub iterations: u32,
    pub operations_executed: u32,
    pub usage: Usage,
    /// Reference of the assistant message handed off for persistence
    pub message_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serialization_text_delta() {
        let event = StreamEvent {
            sequence_number: 3,
            payload: StreamPayload::TextDelta {
                text: "Hello".into(),
            },
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""sequence_number":3"#));
        assert!(json.contains(r#""type":"text_delta""#));
        assert!(json.contains(r#""text":"Hello""#));
    }

    #[test]
    fn event_deserialization() {
        let json = r#"{"sequence_number":0,"type":"error","message":"boom"}"#;
        let event: StreamEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.kind(), StreamEventKind::Error);
        match event.payload {
            StreamPayload::Error { message } => assert_eq!(message, "boom"),
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn signal_serialization() {
        let payload = StreamPayload::SideEffectSignal {
            signal: SideEffectSignal::ExternalStateChanged {
                request_id: "op_1".into(),
                kind: OperationKind::SendEmail,
            },
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains(r#""type":"side_effect_signal""#));
        assert!(json.contains(r#""signal":"external_state_changed""#));
        assert!(json.contains(r#""kind":"send_email""#));
    }

    #[test]
    fn event_kind_names() {
        assert_eq!(StreamEventKind::Done.as_str(), "done");
        assert_eq!(StreamEventKind::SpeechChunk.as_str(), "speech_chunk");
        assert_eq!(
            StreamPayload::TextDelta { text: "x".into() }.kind(),
            StreamEventKind::TextDelta
        );
    }
}
