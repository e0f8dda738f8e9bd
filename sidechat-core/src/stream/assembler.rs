//! State machine for one streamed assistant response.
//!
//! ```text
//! Idle -> AwaitingFirstChunk -> Accumulating -> Finalized
//!              |                    |
//!              +--> Errored <-------+
//!   (any non-Idle) --> Cancelled
//! ```

use thiserror::Error;

use crate::render::RenderState;

/// Lifecycle of a streamed response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblerState {
    Idle,
    AwaitingFirstChunk,
    Accumulating,
    Finalized,
    Cancelled,
    Errored,
}

impl AssemblerState {
    /// Whether no further transition is possible except cancellation.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finalized | Self::Cancelled | Self::Errored)
    }

    /// Whether chunks are still expected.
    pub fn is_streaming(self) -> bool {
        matches!(self, Self::AwaitingFirstChunk | Self::Accumulating)
    }
}

/// A transition that the current state does not allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot {action} a response in state {from:?}")]
pub struct InvalidTransition {
    pub from: AssemblerState,
    pub action: &'static str,
}

/// Accumulates deltas and keeps the rendered HTML of the whole accumulator.
#[derive(Debug)]
pub struct StreamAssembler {
    state: AssemblerState,
    accumulator: String,
    render: RenderState,
}

impl Default for StreamAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self {
            state: AssemblerState::Idle,
            accumulator: String::new(),
            render: RenderState::default(),
        }
    }

    pub fn state(&self) -> AssemblerState {
        self.state
    }

    /// Text accumulated so far.
    pub fn content(&self) -> &str {
        &self.accumulator
    }

    /// The request has been sent.
    pub fn submit(&mut self) -> Result<(), InvalidTransition> {
        self.expect(self.state == AssemblerState::Idle, "submit")?;
        self.state = AssemblerState::AwaitingFirstChunk;
        Ok(())
    }

    /// Append a delta and re-render the whole accumulator.
    ///
    /// Empty deltas leave the state untouched and return `None`.
    pub fn push_delta(&mut self, delta: &str) -> Result<Option<&str>, InvalidTransition> {
        self.expect(self.state.is_streaming(), "append to")?;
        if delta.is_empty() {
            return Ok(None);
        }
        self.state = AssemblerState::Accumulating;
        self.accumulator.push_str(delta);
        Ok(Some(self.render.update(&self.accumulator)))
    }

    /// The stream ended. Returns the final content.
    ///
    /// A stream that ends before any delta finalizes with empty content.
    pub fn finish(&mut self) -> Result<String, InvalidTransition> {
        self.expect(self.state.is_streaming(), "finish")?;
        self.state = AssemblerState::Finalized;
        Ok(self.accumulator.clone())
    }

    /// Abandon the response. Partial content is discarded.
    pub fn cancel(&mut self) -> Result<(), InvalidTransition> {
        self.expect(self.state != AssemblerState::Idle, "cancel")?;
        self.state = AssemblerState::Cancelled;
        self.accumulator.clear();
        self.render.clear();
        Ok(())
    }

    /// Transport failure or non-success status.
    pub fn fail(&mut self) -> Result<(), InvalidTransition> {
        self.expect(self.state.is_streaming(), "fail")?;
        self.state = AssemblerState::Errored;
        Ok(())
    }

    fn expect(&self, allowed: bool, action: &'static str) -> Result<(), InvalidTransition> {
        if allowed {
            Ok(())
        } else {
            Err(InvalidTransition {
                from: self.state,
                action,
            })
        }
    }
}
