//! Numbered events delivered to a resource's processor.
//!
//! An event is a payload stamped with its position in the resource's stream.
//! Producers may deliver the same event several times and in any order; the
//! processor applies each sequence id exactly once.
//!
//! # Example
//!
//! ```
//! use event_serializer_core::event::Event;
//! use event_serializer_core::stream::SequenceId;
//!
//! let event = Event::new(SequenceId::new(3), "deposit 10");
//! assert_eq!(event.sequence_id(), SequenceId::new(3));
//! assert_eq!(*event.payload(), "deposit 10");
//! ```

use crate::stream::SequenceId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A payload stamped with its sequence id.
///
/// Only `sequence_id` takes part in ordering and deduplication. Two deliveries
/// with the same id are the same event even if their payloads differ.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event<P> {
    sequence_id: SequenceId,
    payload: P,
}

impl<P> Event<P> {
    /// Create a new event.
    #[must_use]
    pub const fn new(sequence_id: SequenceId, payload: P) -> Self {
        Self {
            sequence_id,
            payload,
        }
    }

    /// Position of this event in its resource's stream.
    #[must_use]
    pub const fn sequence_id(&self) -> SequenceId {
        self.sequence_id
    }

    /// Borrow the opaque payload.
    #[must_use]
    pub const fn payload(&self) -> &P {
        &self.payload
    }

    /// Consume the event, returning its payload.
    #[must_use]
    pub fn into_payload(self) -> P {
        self.payload
    }
}

impl<P> fmt::Display for Event<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Event {{ sequence_id: {} }}", self.sequence_id)
    }
}
