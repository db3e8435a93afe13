//! The apply operation: the external effect performed once per ready event.
//!
//! The processor calls [`EventApplier::apply`] for each event in strictly
//! increasing sequence order and awaits it before the next one. Implementations
//! should be short-lived; long-running work belongs further outward.
//!
//! # Dyn Compatibility
//!
//! The trait returns `Pin<Box<dyn Future>>` instead of using `async fn` so that
//! a host can share one `Arc<dyn EventApplier<P>>` across all resources.

use crate::event::Event;
use crate::stream::{ResourceId, SequenceId};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Boxed future returned by [`EventApplier::apply`].
pub type ApplyFuture<'a> = Pin<Box<dyn Future<Output = Result<(), ApplyError>> + Send + 'a>>;

/// Errors reported by an apply operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    /// The operation failed, possibly transiently.
    #[error("Apply failed: {0}")]
    Failed(String),

    /// The operation refused this event.
    #[error("Event {sequence_id} rejected: {reason}")]
    Rejected {
        /// Sequence id of the rejected event.
        sequence_id: SequenceId,
        /// Why the event was refused.
        reason: String,
    },
}

impl ApplyError {
    /// Whether retrying the same event could succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// External operation applied to each event exactly once, in order.
pub trait EventApplier<P>: Send + Sync {
    /// Apply one event of `resource`.
    ///
    /// # Errors
    ///
    /// Returns [`ApplyError`] when the effect could not be performed. The
    /// processor logs the failure and, depending on its failure policy,
    /// retries or moves on. It never re-applies earlier events.
    fn apply<'a>(&'a self, resource: &'a ResourceId, event: &'a Event<P>) -> ApplyFuture<'a>;
}

impl<P, A> EventApplier<P> for Arc<A>
where
    A: EventApplier<P> + ?Sized,
{
    fn apply<'a>(&'a self, resource: &'a ResourceId, event: &'a Event<P>) -> ApplyFuture<'a> {
        (**self).apply(resource, event)
    }
}

/// Adapter turning a closure into an [`EventApplier`].
///
/// # Example
///
/// ```
/// use event_serializer_core::applier::{ApplyError, EventApplier, FnApplier};
/// use event_serializer_core::event::Event;
/// use event_serializer_core::stream::{ResourceId, SequenceId};
/// use std::sync::{Arc, Mutex};
///
/// let total = Arc::new(Mutex::new(0_u32));
/// let sink = Arc::clone(&total);
/// let applier = FnApplier::new(move |_resource: &ResourceId, event: &Event<u32>| {
///     let sink = Arc::clone(&sink);
///     let (sequence_id, amount) = (event.sequence_id(), *event.payload());
///     async move {
///         if amount == 0 {
///             return Err(ApplyError::Rejected {
///                 sequence_id,
///                 reason: "empty deposit".to_string(),
///             });
///         }
///         *sink.lock().unwrap() += amount;
///         Ok::<(), ApplyError>(())
///     }
/// });
///
/// let account = ResourceId::new("account-1");
/// let deposit = Event::new(SequenceId::new(1), 25_u32);
/// let empty = Event::new(SequenceId::new(2), 0_u32);
///
/// futures::executor::block_on(applier.apply(&account, &deposit)).unwrap();
/// let refused = futures::executor::block_on(applier.apply(&account, &empty));
///
/// assert!(matches!(refused, Err(ApplyError::Rejected { .. })));
/// assert_eq!(*total.lock().unwrap(), 25);
/// ```
pub struct FnApplier<F> {
    f: F,
}

impl<F> FnApplier<F> {
    /// Wrap a closure returning a future.
    #[must_use]
    pub const fn new(f: F) -> Self {
        Self { f }
    }
}

impl<P, F, Fut> EventApplier<P> for FnApplier<F>
where
    F: Fn(&ResourceId, &Event<P>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ApplyError>> + Send + 'static,
{
    fn apply<'a>(&'a self, resource: &'a ResourceId, event: &'a Event<P>) -> ApplyFuture<'a> {
        Box::pin((self.f)(resource, event))
    }
}
