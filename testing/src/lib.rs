//! # Event Serializer Testing
//!
//! Testing utilities for ordered event processing.
//!
//! This crate provides:
//! - Appliers that record what they were asked to apply, optionally failing
//! - Event builders
//! - Property-based strategies for delivery orders
//! - Tracing setup for tests
//!
//! ## Example
//!
//! ```ignore
//! use event_serializer_testing::{RecordingApplier, events};
//!
//! #[tokio::test]
//! async fn applies_in_order() {
//!     let applier = RecordingApplier::new();
//!     let (processor, handle) = OrderedEventProcessor::new(
//!         ResourceId::new("r"),
//!         EventStore::new(),
//!         applier.clone(),
//!         ProcessorConfig::default(),
//!     );
//!     for event in events([2, 1, 3]) {
//!         handle.send(event).unwrap();
//!     }
//!     drop(handle);
//!     processor.run().await;
//!     assert_eq!(applier.applied_ids(), vec![1, 2, 3]);
//! }
//! ```

/// Recording and failing appliers
pub mod mocks;

/// Event builders and test setup
pub mod helpers {
    use event_serializer_core::event::Event;
    use event_serializer_core::stream::SequenceId;

    /// Build an event whose payload names its id (`"event-<id>"`).
    #[must_use]
    pub fn event(id: u64) -> Event<String> {
        Event::new(SequenceId::new(id), format!("event-{id}"))
    }

    /// Build events in the given delivery order.
    pub fn events(ids: impl IntoIterator<Item = u64>) -> Vec<Event<String>> {
        ids.into_iter().map(event).collect()
    }

    /// Install a test-friendly tracing subscriber.
    ///
    /// Respects `RUST_LOG`; safe to call from every test.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .with_test_writer()
            .try_init();
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use proptest::prelude::*;

    /// A shuffled delivery order of `1..=n` for some `n` in `1..max_len`.
    pub fn permutation(max_len: u64) -> impl Strategy<Value = Vec<u64>> {
        (1..max_len).prop_flat_map(|n| Just((1..=n).collect::<Vec<_>>()).prop_shuffle())
    }

    /// A shuffled delivery order of `1..=n` where every id may be redelivered.
    ///
    /// Models at-least-once delivery: every id appears at least once.
    pub fn at_least_once(max_len: u64) -> impl Strategy<Value = Vec<u64>> {
        (1..max_len)
            .prop_flat_map(|n| {
                let ids: Vec<u64> = (1..=n).collect();
                // Truncation is fine: n is small in tests
                #[allow(clippy::cast_possible_truncation)]
                let extra = proptest::collection::vec(1..=n, 0..=(n as usize));
                (Just(ids), extra)
            })
            .prop_flat_map(|(mut ids, extra)| {
                ids.extend(extra);
                Just(ids).prop_shuffle()
            })
    }
}

pub use helpers::{event, events, init_tracing};
pub use mocks::{FailingApplier, RecordingApplier};
