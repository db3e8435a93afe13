//! # Event Serializer Core
//!
//! Core types for applying a resource's events exactly once, in order.
//!
//! Producers deliver numbered events at least once and in any order. A
//! processor buffers them in an [`EventStore`](event_store::EventStore), drains
//! every contiguous run starting after the last applied id, and hands the
//! remaining state to a successor generation when it retires.
//!
//! ## Core Concepts
//!
//! - **Event**: Opaque payload stamped with a per-resource `SequenceId`
//! - **`EventStore`**: Last applied id plus buffered out-of-order events
//! - **`EventApplier`**: The external effect run once per ready event
//! - **Handoff**: Residual store returned when a generation retires
//!
//! ## Example
//!
//! ```
//! use event_serializer_core::{Event, EventStore, SequenceId};
//!
//! let mut store = EventStore::new();
//! for id in [3, 1, 2, 2] {
//!     store.add_event(Event::new(SequenceId::new(id), ()));
//! }
//! let order: Vec<u64> = store
//!     .drain_contiguous()
//!     .map(|event| event.sequence_id().value())
//!     .collect();
//! assert_eq!(order, vec![1, 2, 3]);
//! ```

/// Apply operation contract
pub mod applier;

/// Numbered events
pub mod event;

/// Applied/pending bookkeeping
pub mod event_store;

/// Generation handoff state
pub mod handoff;

/// Resource and sequence identifiers
pub mod stream;

pub use applier::{ApplyError, ApplyFuture, EventApplier, FnApplier};
pub use event::Event;
pub use event_store::{Admission, DrainContiguous, EventStore};
pub use handoff::{Handoff, HandoffError, RetireReason};
pub use stream::{ResourceId, SequenceId};
