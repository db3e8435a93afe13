//! State transferred from a retiring processor generation to its successor.

use crate::event_store::EventStore;
use crate::stream::ResourceId;
use std::fmt;
use thiserror::Error;

/// Errors from encoding or decoding handoff state.
#[derive(Error, Debug)]
pub enum HandoffError {
    /// Failed to serialize the event store.
    #[error("Failed to encode handoff state: {0}")]
    Encode(String),

    /// Failed to deserialize the event store.
    #[error("Failed to decode handoff state: {0}")]
    Decode(String),
}

/// Why a generation stopped pumping its input.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum RetireReason {
    /// Every sender of the input channel was dropped.
    InputClosed,
    /// The host asked the generation to retire.
    Retired,
    /// The generation reached its configured lifetime.
    GenerationTimer,
    /// The generation admitted its configured number of events.
    EventBudget,
}

impl RetireReason {
    /// Stable label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InputClosed => "input_closed",
            Self::Retired => "retired",
            Self::GenerationTimer => "generation_timer",
            Self::EventBudget => "event_budget",
        }
    }
}

impl fmt::Display for RetireReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal state of one processor generation.
///
/// The host either drops it (nothing pending) or seeds exactly one successor
/// generation for the same resource with [`Handoff::into_store`].
#[derive(Debug)]
pub struct Handoff<P> {
    /// Resource the generation served.
    pub resource: ResourceId,
    /// Residual event store.
    pub store: EventStore<P>,
    /// What ended the generation.
    pub reason: RetireReason,
    /// Number of apply calls made during the generation.
    pub applied: u64,
}

impl<P> Handoff<P> {
    /// Whether a successor generation must be started to carry the state.
    #[must_use]
    pub fn needs_successor(&self) -> bool {
        self.store.has_pending()
    }

    /// Take the residual store to seed the successor.
    #[must_use]
    pub fn into_store(self) -> EventStore<P> {
        self.store
    }
}
