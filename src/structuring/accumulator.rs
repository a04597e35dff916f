//! Streaming buffer with an explicit lifecycle.
//!
//! ```text
//! Empty ──push──▶ Accumulating ──finish (complete JSON)──▶ Complete
//!   │                  │
//!   └──abort / finish (no data or incomplete JSON)──▶ Aborted
//! ```
//!
//! The client falls back to a non-streaming request exactly when the
//! accumulator ends in `Aborted`. Keeping that decision here means it can be
//! tested with plain strings, no network involved.

use crate::error::StructuringError;
use crate::structuring::json::is_structurally_complete;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamState {
    Empty,
    Accumulating(String),
    Complete(String),
    Aborted { partial: String, reason: String },
}

#[derive(Debug)]
pub struct StreamAccumulator {
    state: StreamState,
}

impl Default for StreamAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self {
            state: StreamState::Empty,
        }
    }

    pub fn state(&self) -> &StreamState {
        &self.state
    }

    /// Bytes received so far.
    pub fn len(&self) -> usize {
        match &self.state {
            StreamState::Empty => 0,
            StreamState::Accumulating(buf) | StreamState::Complete(buf) => buf.len(),
            StreamState::Aborted { partial, .. } => partial.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a chunk. Ignored once the stream is complete or aborted.
    pub fn push(&mut self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        match &mut self.state {
            StreamState::Empty => self.state = StreamState::Accumulating(chunk.to_string()),
            StreamState::Accumulating(buf) => buf.push_str(chunk),
            StreamState::Complete(_) | StreamState::Aborted { .. } => {}
        }
    }

    /// Mark the stream as terminated abnormally.
    pub fn abort(&mut self, reason: impl Into<String>) {
        let partial = match std::mem::replace(&mut self.state, StreamState::Empty) {
            StreamState::Empty => String::new(),
            StreamState::Accumulating(buf) => buf,
            done @ StreamState::Complete(_) => {
                self.state = done;
                return;
            }
            aborted @ StreamState::Aborted { .. } => {
                self.state = aborted;
                return;
            }
        };
        self.state = StreamState::Aborted {
            partial,
            reason: reason.into(),
        };
    }

    /// Close the stream: `Complete` when the buffer holds a whole JSON
    /// document, `Aborted` otherwise.
    pub fn close(&mut self) {
        match std::mem::replace(&mut self.state, StreamState::Empty) {
            StreamState::Empty => self.abort("stream ended without data"),
            StreamState::Accumulating(buf) if is_structurally_complete(&buf) => {
                self.state = StreamState::Complete(buf);
            }
            StreamState::Accumulating(buf) => {
                self.state = StreamState::Accumulating(buf);
                self.abort("stream ended inside incomplete JSON");
            }
            settled => self.state = settled,
        }
    }

    /// Close the stream and take the text, or a transient error describing
    /// why the stream cannot be used.
    pub fn finish(mut self) -> Result<String, StructuringError> {
        self.close();
        match self.state {
            StreamState::Complete(text) => Ok(text),
            StreamState::Aborted { partial, reason } => Err(StructuringError::transient(format!(
                "stream aborted after {} bytes: {}",
                partial.len(),
                reason
            ))),
            StreamState::Empty | StreamState::Accumulating(_) => Err(StructuringError::transient(
                "stream closed in an unexpected state",
            )),
        }
    }
}
