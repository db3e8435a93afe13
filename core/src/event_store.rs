//! Bookkeeping of applied and waiting events for one resource.
//!
//! An [`EventStore`] remembers the highest sequence id applied so far and
//! buffers every event that arrived before its predecessors. It has no I/O and
//! no async: the processor feeds it with [`EventStore::add_event`] and pulls
//! ready events out with [`EventStore::drain_contiguous`].
//!
//! # Invariants
//!
//! - Every buffered sequence id is greater than `last_applied`.
//! - `last_applied` only advances while a [`DrainContiguous`] yields.
//! - After a drain pass runs to completion, `last_applied + 1` is not buffered.
//!
//! # Example
//!
//! ```
//! use event_serializer_core::event::Event;
//! use event_serializer_core::event_store::{Admission, EventStore};
//! use event_serializer_core::stream::SequenceId;
//!
//! let mut store = EventStore::new();
//! assert_eq!(store.add_event(Event::new(SequenceId::new(2), "b")), Admission::OutOfOrder);
//! assert_eq!(store.drain_contiguous().count(), 0);
//!
//! assert_eq!(store.add_event(Event::new(SequenceId::new(1), "a")), Admission::Ready);
//! let applied: Vec<_> = store.drain_contiguous().map(|e| e.sequence_id().value()).collect();
//! assert_eq!(applied, vec![1, 2]);
//! assert!(!store.has_pending());
//! ```

use crate::event::Event;
use crate::handoff::HandoffError;
use crate::stream::SequenceId;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::collections::BTreeMap;
use std::iter::FusedIterator;

/// How [`EventStore::add_event`] classified an incoming event.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Admission {
    /// The event is the next one expected and can be drained right away.
    Ready,
    /// The event arrived ahead of a gap and was buffered.
    OutOfOrder,
    /// The event was already applied or is already buffered; it was discarded.
    Duplicate,
}

impl Admission {
    /// Whether the event was kept by the store.
    #[must_use]
    pub const fn is_buffered(self) -> bool {
        matches!(self, Self::Ready | Self::OutOfOrder)
    }
}

/// Last applied sequence id plus the events waiting for their predecessors.
///
/// The store is the only state a processor generation carries forward. It is
/// moved by value to the successor generation at handoff, never shared.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventStore<P> {
    last_applied: SequenceId,
    pending: BTreeMap<SequenceId, Event<P>>,
}

impl<P> Default for EventStore<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> EventStore<P> {
    /// Create an empty store. The next expected sequence id is 1.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            last_applied: SequenceId::INITIAL,
            pending: BTreeMap::new(),
        }
    }

    /// Seed a store from a previous generation's state.
    ///
    /// Events at or below `last_applied` are dropped so the seeded store
    /// satisfies the same invariants as one built event by event.
    #[must_use]
    pub fn with_state(
        last_applied: SequenceId,
        pending: impl IntoIterator<Item = Event<P>>,
    ) -> Self {
        let mut store = Self {
            last_applied,
            pending: BTreeMap::new(),
        };
        for event in pending {
            let sequence_id = event.sequence_id();
            if sequence_id <= last_applied {
                tracing::debug!(
                    sequence_id = %sequence_id,
                    last_applied = %last_applied,
                    "Dropping stale event while seeding store"
                );
                continue;
            }
            store.pending.entry(sequence_id).or_insert(event);
        }
        store
    }

    /// Highest sequence id that has been drained.
    #[must_use]
    pub const fn last_applied(&self) -> SequenceId {
        self.last_applied
    }

    /// Sequence id the store is waiting for.
    #[must_use]
    pub const fn next_expected(&self) -> SequenceId {
        self.last_applied.next()
    }

    /// Whether any event is still buffered.
    ///
    /// A handoff with pending events requires a successor generation.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Number of buffered events.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Buffered sequence ids in ascending order.
    pub fn pending_ids(&self) -> impl Iterator<Item = SequenceId> + '_ {
        self.pending.keys().copied()
    }

    /// Record an incoming event.
    ///
    /// Already-applied and already-buffered ids are discarded: under
    /// at-least-once delivery they are expected, not errors. The first
    /// delivery of a buffered id wins.
    ///
    /// Insertion never applies anything; call [`drain_contiguous`] afterwards.
    ///
    /// [`drain_contiguous`]: EventStore::drain_contiguous
    pub fn add_event(&mut self, event: Event<P>) -> Admission {
        let sequence_id = event.sequence_id();

        if sequence_id <= self.last_applied {
            tracing::info!(
                sequence_id = %sequence_id,
                last_applied = %self.last_applied,
                "Discarding already applied event"
            );
            return Admission::Duplicate;
        }

        if self.pending.contains_key(&sequence_id) {
            tracing::info!(
                sequence_id = %sequence_id,
                "Discarding event that is already buffered"
            );
            return Admission::Duplicate;
        }

        let admission = if sequence_id > self.next_expected() {
            tracing::info!(
                sequence_id = %sequence_id,
                expected = %self.next_expected(),
                "Buffering out of order event"
            );
            Admission::OutOfOrder
        } else {
            Admission::Ready
        };

        self.pending.insert(sequence_id, event);
        admission
    }

    /// Drain the contiguous run starting at `last_applied + 1`.
    ///
    /// The iterator is lazy: each `next()` removes one event and advances
    /// `last_applied` to its id before returning it. It stops at the first
    /// gap. Dropping it early leaves the rest of the run buffered, which is
    /// why callers must keep draining until it returns `None`.
    pub fn drain_contiguous(&mut self) -> DrainContiguous<'_, P> {
        DrainContiguous { store: self }
    }

    /// Whether the store has no drainable run left and no stale entries.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        let no_stale = self
            .pending
            .keys()
            .next()
            .is_none_or(|first| *first > self.last_applied);
        no_stale && !self.pending.contains_key(&self.next_expected())
    }

    /// Check the store invariants after a full drain pass.
    ///
    /// # Panics
    ///
    /// Panics if a buffered id is at or below `last_applied`, or if the next
    /// expected id is still buffered. Either means the processor has a bug;
    /// continuing would apply events out of order or twice.
    pub fn assert_settled(&self) {
        assert!(
            self.is_settled(),
            "event store invariant violated: last_applied={}, pending={:?}",
            self.last_applied,
            self.pending.keys().collect::<Vec<_>>()
        );
    }

    /// Split the store into its parts.
    #[must_use]
    pub fn into_parts(self) -> (SequenceId, Vec<Event<P>>) {
        (self.last_applied, self.pending.into_values().collect())
    }
}

impl<P> EventStore<P>
where
    P: Serialize + DeserializeOwned,
{
    /// Encode the store for a handoff that crosses a process boundary.
    ///
    /// # Errors
    ///
    /// Returns [`HandoffError::Encode`] if a payload cannot be serialized.
    pub fn to_bytes(&self) -> Result<Vec<u8>, HandoffError> {
        bincode::serialize(self).map_err(|e| HandoffError::Encode(e.to_string()))
    }

    /// Decode a store produced by [`EventStore::to_bytes`].
    ///
    /// The decoded state is re-seeded through [`EventStore::with_state`], so
    /// stale entries in a tampered or corrupted blob cannot break invariants.
    ///
    /// # Errors
    ///
    /// Returns [`HandoffError::Decode`] if the bytes are not a valid store.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HandoffError> {
        let decoded: Self =
            bincode::deserialize(bytes).map_err(|e| HandoffError::Decode(e.to_string()))?;
        let (last_applied, pending) = decoded.into_parts();
        Ok(Self::with_state(last_applied, pending))
    }
}

/// Lazy iterator over the contiguous run of ready events.
///
/// Created by [`EventStore::drain_contiguous`].
#[derive(Debug)]
pub struct DrainContiguous<'a, P> {
    store: &'a mut EventStore<P>,
}

impl<P> Iterator for DrainContiguous<'_, P> {
    type Item = Event<P>;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.store.last_applied.next();
        let event = self.store.pending.remove(&next)?;
        self.store.last_applied = next;
        Some(event)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.store.pending.len()))
    }
}

impl<P> FusedIterator for DrainContiguous<'_, P> {}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn event(id: u64) -> Event<String> {
        Event::new(SequenceId::new(id), format!("payload-{id}"))
    }

    fn drain_ids(store: &mut EventStore<String>) -> Vec<u64> {
        store
            .drain_contiguous()
            .map(|e| e.sequence_id().value())
            .collect()
    }

    #[test]
    fn new_store_expects_one() {
        let store: EventStore<String> = EventStore::new();
        assert_eq!(store.last_applied(), SequenceId::INITIAL);
        assert_eq!(store.next_expected(), SequenceId::new(1));
        assert!(!store.has_pending());
        assert!(store.is_settled());
    }

    #[test]
    fn in_order_events_are_ready() {
        let mut store = EventStore::new();
        assert_eq!(store.add_event(event(1)), Admission::Ready);
        assert_eq!(drain_ids(&mut store), vec![1]);
        assert_eq!(store.add_event(event(2)), Admission::Ready);
        assert_eq!(drain_ids(&mut store), vec![2]);
        assert_eq!(store.last_applied(), SequenceId::new(2));
    }

    #[test]
    fn duplicate_after_apply_is_discarded() {
        let mut store = EventStore::new();
        store.add_event(event(1));
        assert_eq!(drain_ids(&mut store), vec![1]);

        let before = store.clone();
        assert_eq!(store.add_event(event(1)), Admission::Duplicate);
        assert_eq!(store, before);
    }

    #[test]
    fn duplicate_while_buffered_keeps_first_delivery() {
        let mut store = EventStore::new();
        assert_eq!(store.add_event(event(3)), Admission::OutOfOrder);
        let second = Event::new(SequenceId::new(3), "other".to_string());
        assert_eq!(store.add_event(second), Admission::Duplicate);
        assert_eq!(store.pending_len(), 1);

        store.add_event(event(1));
        store.add_event(event(2));
        let payloads: Vec<String> = store.drain_contiguous().map(Event::into_payload).collect();
        assert_eq!(payloads, vec!["payload-1", "payload-2", "payload-3"]);
    }

    #[test]
    fn gap_holds_back_later_events() {
        let mut store = EventStore::new();
        store.add_event(event(1));
        store.add_event(event(3));
        store.add_event(event(4));

        assert_eq!(drain_ids(&mut store), vec![1]);
        assert_eq!(
            store.pending_ids().map(SequenceId::value).collect::<Vec<_>>(),
            vec![3, 4]
        );
        assert!(store.is_settled());

        assert_eq!(store.add_event(event(2)), Admission::Ready);
        assert_eq!(drain_ids(&mut store), vec![2, 3, 4]);
        assert!(!store.has_pending());
    }

    #[test]
    fn seeded_store_resumes_after_handoff() {
        let mut store = EventStore::with_state(SequenceId::new(5), vec![event(7), event(8)]);
        assert!(store.has_pending());
        assert_eq!(drain_ids(&mut store), Vec::<u64>::new());

        assert_eq!(store.add_event(event(3)), Admission::Duplicate);
        assert_eq!(store.add_event(event(6)), Admission::Ready);
        assert_eq!(drain_ids(&mut store), vec![6, 7, 8]);
    }

    #[test]
    fn seeding_drops_stale_events() {
        let store = EventStore::with_state(SequenceId::new(5), vec![event(4), event(5), event(9)]);
        assert_eq!(
            store.pending_ids().map(SequenceId::value).collect::<Vec<_>>(),
            vec![9]
        );
    }

    #[test]
    fn partially_consumed_drain_keeps_rest_buffered() {
        let mut store = EventStore::new();
        for id in 1..=3 {
            store.add_event(event(id));
        }
        let first = store.drain_contiguous().next();
        assert_eq!(first.map(|e| e.sequence_id().value()), Some(1));
        assert_eq!(store.last_applied(), SequenceId::new(1));
        assert!(!store.is_settled());
        assert_eq!(drain_ids(&mut store), vec![2, 3]);
        assert!(store.is_settled());
    }

    #[test]
    #[should_panic(expected = "invariant violated")]
    fn assert_settled_panics_on_undrained_run() {
        let mut store = EventStore::new();
        store.add_event(event(1));
        store.assert_settled();
    }

    #[test]
    #[allow(clippy::expect_used)] // Panics: Test will fail if the codec fails
    fn handoff_bytes_restore_state() {
        let store = EventStore::with_state(SequenceId::new(5), vec![event(7), event(8)]);
        let bytes = store.to_bytes().expect("encode should succeed");
        let restored: EventStore<String> =
            EventStore::from_bytes(&bytes).expect("decode should succeed");
        assert_eq!(restored, store);
    }

    #[test]
    fn corrupted_handoff_bytes_fail_to_decode() {
        let result = EventStore::<String>::from_bytes(&[0xff, 0x01]);
        assert!(matches!(result, Err(HandoffError::Decode(_))));
    }

    proptest! {
        #[test]
        fn any_permutation_drains_in_order(
            ids in (1_u64..60).prop_flat_map(|n| Just((1..=n).collect::<Vec<_>>()).prop_shuffle())
        ) {
            let n = ids.len() as u64;
            let mut store = EventStore::new();
            let mut applied = Vec::new();
            for id in ids {
                store.add_event(event(id));
                applied.extend(drain_ids(&mut store));
                prop_assert!(store.is_settled());
            }
            prop_assert_eq!(applied, (1..=n).collect::<Vec<_>>());
            prop_assert!(!store.has_pending());
        }

        #[test]
        fn redelivery_never_reapplies(
            ids in proptest::collection::vec(1_u64..20, 1..80)
        ) {
            let mut store = EventStore::new();
            let mut applied = Vec::new();
            for id in ids {
                store.add_event(event(id));
                applied.extend(drain_ids(&mut store));
            }
            let expected: Vec<u64> = (1..=store.last_applied().value()).collect();
            prop_assert_eq!(applied, expected);
        }
    }
}
