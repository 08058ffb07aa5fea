//! The streaming emitter.
//!
//! Owns the write side of a turn's outbound channel. Every event gets the
//! next sequence number (starting at 0) and is written in call order.
//! At most one `error` event is written, and nothing is written after
//! `done`.

use parley_core::error::ChannelError;
use parley_core::operation::OperationResult;
use parley_core::stream::{DoneSummary, SideEffectSignal, StreamEvent, StreamPayload};
use tokio::sync::mpsc;
use tracing::{debug, trace};

pub struct StreamEmitter {
    sender: mpsc::Sender<StreamEvent>,
    next_sequence: u64,
    error_emitted: bool,
    done: bool,
    closed: bool,
}

impl StreamEmitter {
    pub fn new(sender: mpsc::Sender<StreamEvent>) -> Self {
        Self {
            sender,
            next_sequence: 0,
            error_emitted: false,
            done: false,
            closed: false,
        }
    }

    /// Whether another event could still be delivered.
    pub fn is_writable(&self) -> bool {
        !self.closed && !self.done && !self.sender.is_closed()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Number of events written so far.
    pub fn events_emitted(&self) -> u64 {
        self.next_sequence
    }

    /// Resolves once the receiving side has gone away.
    pub async fn closed(&self) {
        self.sender.closed().await
    }

    /// Write one event.
    ///
    /// A repeated `error` is swallowed. A failed write marks the emitter
    /// closed; every later call then fails with [`ChannelError::Closed`].
    pub async fn emit(&mut self, payload: StreamPayload) -> Result<(), ChannelError> {
        if self.done {
            return Err(ChannelError::Terminated);
        }
        if self.closed {
            return Err(ChannelError::Closed);
        }

        let is_error = matches!(payload, StreamPayload::Error { .. });
        if is_error && self.error_emitted {
            debug!("Suppressing repeated error event");
            return Ok(());
        }
        let is_done = matches!(payload, StreamPayload::Done { .. });

        let event = StreamEvent {
            sequence_number: self.next_sequence,
            payload,
        };
        trace!(sequence = event.sequence_number, kind = event.kind().as_str(), "Emitting");

        if self.sender.send(event).await.is_err() {
            self.closed = true;
            debug!("Outbound channel closed");
            return Err(ChannelError::Closed);
        }

        self.next_sequence += 1;
        self.error_emitted |= is_error;
        self.done |= is_done;
        Ok(())
    }

    pub async fn text_delta(&mut self, text: impl Into<String>) -> Result<(), ChannelError> {
        self.emit(StreamPayload::TextDelta { text: text.into() })
            .await
    }

    pub async fn operation_result(&mut self, result: OperationResult) -> Result<(), ChannelError> {
        self.emit(StreamPayload::OperationResult { result }).await
    }

    pub async fn signal(&mut self, signal: SideEffectSignal) -> Result<(), ChannelError> {
        self.emit(StreamPayload::SideEffectSignal { signal }).await
    }

    pub async fn error(&mut self, message: impl Into<String>) -> Result<(), ChannelError> {
        self.emit(StreamPayload::Error {
            message: message.into(),
        })
        .await
    }

    /// Write the terminal event.
    pub async fn done(&mut self, summary: DoneSummary) -> Result<(), ChannelError> {
        self.emit(StreamPayload::Done { summary }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::model::Usage;
    use parley_core::stream::StreamEventKind;
    use parley_core::turn::TerminationReason;

    fn summary() -> DoneSummary {
        DoneSummary {
            turn_id: "t".into(),
            conversation_id: "c".into(),
            termination_reason: TerminationReason::ImplicitEndNoOps,
            iterations: 0,
            operations_executed: 0,
            usage: Usage::default(),
            message_id: "m".into(),
        }
    }

    fn drain(rx: &mut mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn sequence_numbers_start_at_zero_and_increase() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut emitter = StreamEmitter::new(tx);
        emitter.text_delta("Hel").await.unwrap();
        emitter.text_delta("lo").await.unwrap();
        emitter.done(summary()).await.unwrap();

        let events = drain(&mut rx);
        let seqs: Vec<u64> = events.iter().map(|e| e.sequence_number).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert_eq!(events[2].kind(), StreamEventKind::Done);
        assert_eq!(emitter.events_emitted(), 3);
    }

    #[tokio::test]
    async fn only_one_error_is_emitted() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut emitter = StreamEmitter::new(tx);
        emitter.error("first").await.unwrap();
        emitter.error("second").await.unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0].payload,
            StreamPayload::Error { message } if message == "first"
        ));
    }

    #[tokio::test]
    async fn nothing_after_done() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut emitter = StreamEmitter::new(tx);
        emitter.done(summary()).await.unwrap();

        assert_eq!(emitter.text_delta("late").await, Err(ChannelError::Terminated));
        assert_eq!(emitter.done(summary()).await, Err(ChannelError::Terminated));
        assert!(!emitter.is_writable());
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn dropped_receiver_closes_emitter() {
        let (tx, rx) = mpsc::channel(16);
        let mut emitter = StreamEmitter::new(tx);
        drop(rx);

        assert!(!emitter.is_writable());
        assert_eq!(emitter.text_delta("x").await, Err(ChannelError::Closed));
        assert_eq!(emitter.done(summary()).await, Err(ChannelError::Closed));
        assert_eq!(emitter.events_emitted(), 0);
    }
}
