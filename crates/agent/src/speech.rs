//! Speech scheduling.
//!
//! Text deltas go through a [`SentenceSegmenter`]; each completed sentence
//! is synthesized one at a time, in order, and emitted as a `speech_chunk`.
//! A failed synthesis is logged and skipped. Synthesis has no side effects,
//! so an in-flight call is dropped as soon as the client goes away.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use parley_core::error::ChannelError;
use parley_core::speech::SpeechSynthesizer;
use parley_core::stream::StreamPayload;
use tracing::{debug, warn};

use crate::emitter::StreamEmitter;
use crate::segmenter::SentenceSegmenter;

pub struct SpeechScheduler {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    segmenter: SentenceSegmenter,
    next_index: u32,
}

impl SpeechScheduler {
    pub fn new(synthesizer: Arc<dyn SpeechSynthesizer>) -> Self {
        Self {
            synthesizer,
            segmenter: SentenceSegmenter::new(),
            next_index: 0,
        }
    }

    /// Sentences handed to the synthesizer so far.
    pub fn sentences_scheduled(&self) -> u32 {
        self.next_index
    }

    /// Feed a text delta; speaks every sentence it completes.
    pub async fn push_text(
        &mut self,
        delta: &str,
        emitter: &mut StreamEmitter,
    ) -> Result<(), ChannelError> {
        for sentence in self.segmenter.push(delta) {
            self.speak(sentence, emitter).await?;
        }
        Ok(())
    }

    /// Speak whatever is left at the end of a model stream.
    pub async fn flush(&mut self, emitter: &mut StreamEmitter) -> Result<(), ChannelError> {
        match self.segmenter.finish() {
            Some(sentence) => self.speak(sentence, emitter).await,
            None => Ok(()),
        }
    }

    async fn speak(
        &mut self,
        sentence: String,
        emitter: &mut StreamEmitter,
    ) -> Result<(), ChannelError> {
        if !emitter.is_writable() {
            return Err(ChannelError::Closed);
        }
        let sentence_index = self.next_index;
        self.next_index += 1;

        let outcome = tokio::select! {
            result = self.synthesizer.synthesize(&sentence) => Some(result),
            _ = emitter.closed() => None,
        };

        match outcome {
            None => {
                debug!(sentence_index, "Client gone, abandoning synthesis");
                Err(ChannelError::Closed)
            }
            Some(Err(e)) => {
                warn!(sentence_index, synthesizer = self.synthesizer.name(), "Speech synthesis failed: {e}");
                Ok(())
            }
            Some(Ok(speech)) => {
                emitter
                    .emit(StreamPayload::SpeechChunk {
                        sentence_index,
                        text: sentence,
                        audio_base64: STANDARD.encode(&speech.audio),
                        mime_type: speech.mime_type,
                    })
                    .await
            }
        }
    }
}
