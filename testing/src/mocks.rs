//! Appliers for tests.
//!
//! Both appliers are cheap to clone; clones share their records, so a test
//! can hand one clone to a processor and inspect the other afterwards.

use event_serializer_core::applier::{ApplyError, ApplyFuture, EventApplier};
use event_serializer_core::event::Event;
use event_serializer_core::stream::{ResourceId, SequenceId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Applier that records every applied event.
///
/// # Example
///
/// ```
/// use event_serializer_testing::RecordingApplier;
///
/// let applier = RecordingApplier::new();
/// assert!(applier.applied().is_empty());
/// ```
#[derive(Clone, Default)]
pub struct RecordingApplier {
    applied: Arc<Mutex<Vec<(ResourceId, SequenceId)>>>,
    delay: Option<Duration>,
}

impl RecordingApplier {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep for `delay` inside every apply call.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every applied `(resource, sequence id)` pair, in apply order.
    #[must_use]
    pub fn applied(&self) -> Vec<(ResourceId, SequenceId)> {
        lock(&self.applied).clone()
    }

    /// Applied sequence ids across all resources, in apply order.
    #[must_use]
    pub fn applied_ids(&self) -> Vec<u64> {
        lock(&self.applied).iter().map(|(_, id)| id.value()).collect()
    }

    /// Applied sequence ids of one resource, in apply order.
    #[must_use]
    pub fn applied_for(&self, resource: &ResourceId) -> Vec<u64> {
        lock(&self.applied)
            .iter()
            .filter(|(applied_to, _)| applied_to == resource)
            .map(|(_, id)| id.value())
            .collect()
    }

    /// Number of applied events.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.applied).len()
    }

    /// Whether nothing was applied yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.applied).is_empty()
    }

    fn record(&self, resource: &ResourceId, sequence_id: SequenceId) {
        lock(&self.applied).push((resource.clone(), sequence_id));
    }
}

impl<P> EventApplier<P> for RecordingApplier
where
    P: Sync,
{
    fn apply<'a>(&'a self, resource: &'a ResourceId, event: &'a Event<P>) -> ApplyFuture<'a> {
        Box::pin(async move {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.record(resource, event.sequence_id());
            Ok(())
        })
    }
}

#[derive(Clone, Copy)]
enum Failure {
    Always,
    Times(u32),
    Reject,
}

/// Applier that fails on chosen sequence ids and records the rest.
///
/// Successful applies land in the inner [`RecordingApplier`]; every attempt,
/// failed or not, is counted per sequence id.
#[derive(Clone, Default)]
pub struct FailingApplier {
    recorder: RecordingApplier,
    failures: Arc<Mutex<HashMap<SequenceId, Failure>>>,
    attempts: Arc<Mutex<HashMap<SequenceId, u32>>>,
}

impl FailingApplier {
    /// Create an applier that succeeds until told otherwise.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Always fail `id` with a retryable error.
    #[must_use]
    pub fn fail_always(self, id: u64) -> Self {
        lock(&self.failures).insert(SequenceId::new(id), Failure::Always);
        self
    }

    /// Fail `id` with a retryable error for its first `times` attempts.
    #[must_use]
    pub fn fail_times(self, id: u64, times: u32) -> Self {
        lock(&self.failures).insert(SequenceId::new(id), Failure::Times(times));
        self
    }

    /// Reject `id` with a non-retryable error.
    #[must_use]
    pub fn reject(self, id: u64) -> Self {
        lock(&self.failures).insert(SequenceId::new(id), Failure::Reject);
        self
    }

    /// The recorder holding the successful applies.
    #[must_use]
    pub const fn recorder(&self) -> &RecordingApplier {
        &self.recorder
    }

    /// How many times `id` was attempted.
    #[must_use]
    pub fn attempts(&self, id: u64) -> u32 {
        lock(&self.attempts)
            .get(&SequenceId::new(id))
            .copied()
            .unwrap_or(0)
    }

    fn outcome(&self, sequence_id: SequenceId) -> Result<(), ApplyError> {
        let attempt = {
            let mut attempts = lock(&self.attempts);
            let count = attempts.entry(sequence_id).or_insert(0);
            *count += 1;
            *count
        };

        match lock(&self.failures).get(&sequence_id).copied() {
            Some(Failure::Always) => Err(ApplyError::Failed(format!(
                "injected failure for {sequence_id}"
            ))),
            Some(Failure::Times(times)) if attempt <= times => Err(ApplyError::Failed(format!(
                "injected failure {attempt}/{times} for {sequence_id}"
            ))),
            Some(Failure::Reject) => Err(ApplyError::Rejected {
                sequence_id,
                reason: "injected rejection".to_string(),
            }),
            Some(Failure::Times(_)) | None => Ok(()),
        }
    }
}

impl<P> EventApplier<P> for FailingApplier
where
    P: Sync,
{
    fn apply<'a>(&'a self, resource: &'a ResourceId, event: &'a Event<P>) -> ApplyFuture<'a> {
        let outcome = self.outcome(event.sequence_id());
        Box::pin(async move {
            outcome?;
            self.recorder.record(resource, event.sequence_id());
            Ok(())
        })
    }
}
