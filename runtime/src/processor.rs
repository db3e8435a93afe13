//! One generation of the per-resource ordered event processor.
//!
//! # Lifecycle
//!
//! ```text
//!            event                    input closed / retire / timer / budget
//!   ┌──────────────────┐            ┌─────────────────────────────────────┐
//!   ▼                  │            │                                     ▼
//! Running ── add_event + drain ─────┘                                 Draining
//!                                                                          │
//!                                 close input, sweep try_recv, then        │
//!                                 recv the stragglers, final drain         │
//!                                                                          ▼
//!                                                                      Terminal
//!                                                                   (Handoff<P>)
//! ```
//!
//! The processor is the only owner of its [`EventStore`]: there are no locks.
//! All inputs arrive through one `tokio::select!` over the event channel, the
//! retire signal, and the optional generation timer.
//!
//! # Example
//!
//! ```ignore
//! let (processor, handle) = OrderedEventProcessor::new(
//!     ResourceId::new("account-1"),
//!     EventStore::new(),
//!     applier,
//!     ProcessorConfig::default(),
//! );
//! let generation = tokio::spawn(processor.run());
//!
//! handle.send(Event::new(SequenceId::new(2), payload_b))?;
//! handle.send(Event::new(SequenceId::new(1), payload_a))?;
//! drop(handle);
//!
//! let handoff = generation.await?;
//! assert!(!handoff.needs_successor());
//! ```

use crate::config::{ApplyFailurePolicy, ProcessorConfig};
use crate::metrics::{GenerationMetrics, ProcessorMetrics};
use crate::retry::apply_with_retry;
use event_serializer_core::applier::EventApplier;
use event_serializer_core::event::Event;
use event_serializer_core::event_store::{Admission, EventStore};
use event_serializer_core::handoff::{Handoff, RetireReason};
use event_serializer_core::stream::ResourceId;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch};

/// Sending side of a processor generation.
///
/// Dropping the handle closes the input channel, which makes the generation
/// drain and return its [`Handoff`].
#[derive(Debug)]
pub struct ProcessorHandle<P> {
    sender: mpsc::UnboundedSender<Event<P>>,
    retire: watch::Sender<bool>,
}

impl<P> ProcessorHandle<P> {
    /// Forward one event to the generation.
    ///
    /// # Errors
    ///
    /// Returns the event back if the generation has stopped accepting input
    /// (it is draining or finished). The caller should hand it to the
    /// successor generation instead.
    pub fn send(&self, event: Event<P>) -> Result<(), Event<P>> {
        self.sender.send(event).map_err(|rejected| rejected.0)
    }

    /// Ask the generation to drain and hand off.
    pub fn retire(&self) {
        // send_replace never fails, even when the generation is gone
        self.retire.send_replace(true);
    }

    /// Whether the generation has stopped accepting input.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Applies one resource's events exactly once, in sequence order.
///
/// See the [module documentation](self) for the state machine.
pub struct OrderedEventProcessor<P, A> {
    resource: ResourceId,
    generation: u64,
    store: EventStore<P>,
    inbound: mpsc::UnboundedReceiver<Event<P>>,
    retire: watch::Receiver<bool>,
    applier: A,
    config: ProcessorConfig,
    received: u64,
    applied: u64,
}

impl<P, A> OrderedEventProcessor<P, A>
where
    P: Send + Sync + 'static,
    A: EventApplier<P>,
{
    /// Create a generation seeded with `store`, returning it with its handle.
    ///
    /// Pass `EventStore::new()` for a brand new resource, or the store from
    /// the previous generation's [`Handoff`].
    #[must_use]
    pub fn new(
        resource: ResourceId,
        store: EventStore<P>,
        applier: A,
        config: ProcessorConfig,
    ) -> (Self, ProcessorHandle<P>) {
        let (sender, inbound) = mpsc::unbounded_channel();
        let (retire_tx, retire_rx) = watch::channel(false);

        let processor = Self {
            resource,
            generation: 1,
            store,
            inbound,
            retire: retire_rx,
            applier,
            config,
            received: 0,
            applied: 0,
        };
        let handle = ProcessorHandle {
            sender,
            retire: retire_tx,
        };
        (processor, handle)
    }

    /// Label this generation's position in the resource's chain (for logs).
    #[must_use]
    pub const fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    /// The resource this generation serves.
    #[must_use]
    pub const fn resource(&self) -> &ResourceId {
        &self.resource
    }

    /// Pump the input until retirement, then drain and hand off.
    ///
    /// # Panics
    ///
    /// Panics if the event store invariants are violated after a drain pass.
    /// That indicates a bug in this crate, not bad input.
    #[tracing::instrument(
        skip(self),
        name = "processor_generation",
        fields(resource = %self.resource, generation = self.generation)
    )]
    pub async fn run(mut self) -> Handoff<P> {
        tracing::info!(
            last_applied = %self.store.last_applied(),
            pending = self.store.pending_len(),
            "Starting processor generation"
        );
        GenerationMetrics::record_started();

        // A seeded store may already hold the next expected event
        self.apply_ready().await;

        let timer_armed = self.config.generation_timeout.is_some();
        let timer = tokio::time::sleep(self.config.generation_timeout.unwrap_or(Duration::MAX));
        tokio::pin!(timer);
        let mut retire_live = true;

        let reason = loop {
            tokio::select! {
                received = self.inbound.recv() => {
                    let Some(event) = received else {
                        break RetireReason::InputClosed;
                    };
                    self.admit(event);
                    self.apply_ready().await;
                    if self.budget_exhausted() {
                        break RetireReason::EventBudget;
                    }
                }
                changed = self.retire.changed(), if retire_live => {
                    match changed {
                        Ok(()) if *self.retire.borrow_and_update() => break RetireReason::Retired,
                        Ok(()) => {}
                        // Handle dropped: the input channel closes along with it
                        Err(_) => retire_live = false,
                    }
                }
                () = &mut timer, if timer_armed => break RetireReason::GenerationTimer,
            }
        };

        self.drain(reason).await
    }

    fn budget_exhausted(&self) -> bool {
        self.config
            .max_events_per_generation
            .is_some_and(|max| self.received >= max)
    }

    fn admit(&mut self, event: Event<P>) {
        self.received += 1;
        ProcessorMetrics::record_received();
        match self.store.add_event(event) {
            Admission::Duplicate => ProcessorMetrics::record_duplicate(),
            Admission::OutOfOrder => ProcessorMetrics::record_out_of_order(),
            Admission::Ready => {}
        }
    }

    /// Apply every event of the contiguous run, one at a time.
    async fn apply_ready(&mut self) {
        let mut applied = 0;
        for event in self.store.drain_contiguous() {
            apply_event(
                &self.applier,
                &self.resource,
                &self.config.failure_policy,
                &event,
            )
            .await;
            applied += 1;
        }
        self.applied += applied;

        self.store.assert_settled();
        ProcessorMetrics::record_pending(self.store.pending_len());
    }

    async fn drain(mut self, reason: RetireReason) -> Handoff<P> {
        tracing::info!(reason = %reason, "Draining processor generation");

        // New sends now fail and return their event to the sender
        self.inbound.close();

        let mut swept = 0_u64;
        let mut idle_polls = 0;
        while idle_polls < self.config.drain_sweep_attempts {
            match self.inbound.try_recv() {
                Ok(event) => {
                    swept += 1;
                    self.admit(event);
                }
                Err(TryRecvError::Empty) => {
                    idle_polls += 1;
                    // Let a sender that raced the close finish its push
                    tokio::task::yield_now().await;
                }
                Err(TryRecvError::Disconnected) => break,
            }
        }
        // Resolves to None once every send accepted before the close is received
        while let Some(event) = self.inbound.recv().await {
            swept += 1;
            self.admit(event);
        }
        if swept > 0 {
            tracing::info!(swept, "Recovered events delivered during shutdown");
            ProcessorMetrics::record_swept(swept);
        }

        self.apply_ready().await;

        GenerationMetrics::record_handoff(reason);
        tracing::info!(
            reason = %reason,
            last_applied = %self.store.last_applied(),
            pending = self.store.pending_len(),
            applied = self.applied,
            "Processor generation retired"
        );

        Handoff {
            resource: self.resource,
            store: self.store,
            reason,
            applied: self.applied,
        }
    }
}

/// Run the apply operation for one event under the failure policy.
///
/// The event is already consumed from the store when this runs, so a failure
/// never causes it to be applied again by this processor.
async fn apply_event<P, A>(
    applier: &A,
    resource: &ResourceId,
    policy: &ApplyFailurePolicy,
    event: &Event<P>,
) where
    A: EventApplier<P>,
{
    let sequence_id = event.sequence_id();
    let started = Instant::now();

    let result = match policy {
        ApplyFailurePolicy::Skip => applier.apply(resource, event).await,
        ApplyFailurePolicy::Retry(retry) => {
            let outcome = apply_with_retry(retry, applier, resource, event).await;
            if outcome.retries() > 0 {
                ProcessorMetrics::record_retries(u64::try_from(outcome.retries()).unwrap_or(u64::MAX));
            }
            outcome.result
        }
    };

    ProcessorMetrics::record_apply(started.elapsed());

    match result {
        Ok(()) => {
            tracing::debug!(sequence_id = %sequence_id, "Applied event");
        }
        Err(error) => {
            tracing::error!(
                sequence_id = %sequence_id,
                error = %error,
                "Failed to apply event, advancing past it"
            );
            ProcessorMetrics::record_apply_failure();
        }
    }
}
