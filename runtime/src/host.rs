//! Supervisor that keeps one processor generation alive per resource.
//!
//! The host is a single task. It receives commands over one channel and
//! generation completions from a `JoinSet`, so its routing table needs no
//! locks.
//!
//! # Generations
//!
//! - The first delivery for a resource starts generation 1.
//! - When a generation retires with pending events, or events arrived while it
//!   was draining, the host immediately starts the next generation seeded with
//!   exactly the residual store, then forwards the held-back events to it.
//! - When a generation retires fully quiesced, its store is parked. A later
//!   delivery seeds the next generation from it, so ids applied long ago are
//!   still recognised as duplicates.
//!
//! Parked stores are kept until [`HostHandle::evict`] removes them or the host
//! shuts down. A host serving an unbounded set of resources should evict the
//! ones it knows are finished.
//!
//! # Example
//!
//! ```ignore
//! let host = ProcessorHost::spawn(Arc::new(applier), ProcessorConfig::default())?;
//!
//! host.deliver(ResourceId::new("account-1"), Event::new(SequenceId::new(1), payload)).await?;
//!
//! let residual = host.shutdown().await?;
//! ```

use crate::config::ProcessorConfig;
use crate::error::ProcessorError;
use crate::processor::{OrderedEventProcessor, ProcessorHandle};
use event_serializer_core::applier::EventApplier;
use event_serializer_core::event::Event;
use event_serializer_core::event_store::EventStore;
use event_serializer_core::handoff::Handoff;
use event_serializer_core::stream::ResourceId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinSet};

/// Residual state of every resource the host has served.
pub type ResidualStores<P> = HashMap<ResourceId, EventStore<P>>;

enum HostCommand<P> {
    Deliver {
        resource: ResourceId,
        event: Event<P>,
    },
    Retire {
        resource: ResourceId,
    },
    Evict {
        resource: ResourceId,
        reply: oneshot::Sender<Option<EventStore<P>>>,
    },
    Shutdown {
        reply: oneshot::Sender<ResidualStores<P>>,
    },
}

/// Cloneable client of a running [`ProcessorHost`].
pub struct HostHandle<P> {
    commands: mpsc::Sender<HostCommand<P>>,
    shutdown_timeout: Duration,
}

impl<P> Clone for HostHandle<P> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            shutdown_timeout: self.shutdown_timeout,
        }
    }
}

impl<P> HostHandle<P> {
    /// Deliver an event for `resource`.
    ///
    /// Waits only for room in the host's command channel, not for the event
    /// to be applied.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessorError::HostStopped`] once the host has shut down.
    pub async fn deliver(&self, resource: ResourceId, event: Event<P>) -> Result<(), ProcessorError> {
        self.commands
            .send(HostCommand::Deliver { resource, event })
            .await
            .map_err(|_| ProcessorError::HostStopped)
    }

    /// Ask the active generation of `resource` to drain and hand off now.
    ///
    /// A no-op when the resource has no active generation.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessorError::HostStopped`] once the host has shut down.
    pub async fn retire(&self, resource: ResourceId) -> Result<(), ProcessorError> {
        self.commands
            .send(HostCommand::Retire { resource })
            .await
            .map_err(|_| ProcessorError::HostStopped)
    }

    /// Forget the parked state of `resource` and return it.
    ///
    /// Returns `None` when the resource is unknown or still has an active
    /// generation; retire it and evict again once it has parked. After
    /// eviction the host no longer recognises the resource's old ids, so a
    /// later delivery starts from an empty store.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessorError::HostStopped`] once the host has shut down.
    pub async fn evict(&self, resource: ResourceId) -> Result<Option<EventStore<P>>, ProcessorError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(HostCommand::Evict { resource, reply })
            .await
            .map_err(|_| ProcessorError::HostStopped)?;
        response.await.map_err(|_| ProcessorError::HostStopped)
    }

    /// Retire every generation and return the residual stores.
    ///
    /// Deliveries accepted before the shutdown request are still applied.
    /// Stores with pending events are returned as-is; seed new generations
    /// with them to continue later.
    ///
    /// # Errors
    ///
    /// - [`ProcessorError::HostStopped`] if the host is already gone
    /// - [`ProcessorError::ShutdownTimeout`] if draining takes longer than
    ///   the configured shutdown timeout
    pub async fn shutdown(&self) -> Result<ResidualStores<P>, ProcessorError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(HostCommand::Shutdown { reply })
            .await
            .map_err(|_| ProcessorError::HostStopped)?;

        match tokio::time::timeout(self.shutdown_timeout, response).await {
            Ok(Ok(residual)) => Ok(residual),
            Ok(Err(_)) => Err(ProcessorError::HostStopped),
            Err(_) => Err(ProcessorError::ShutdownTimeout(self.shutdown_timeout)),
        }
    }

    /// Whether the host task has stopped.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.commands.is_closed()
    }
}

struct ActiveGeneration<P> {
    handle: ProcessorHandle<P>,
    generation: u64,
    /// Events rejected because the generation was already draining
    backlog: Vec<Event<P>>,
}

enum Slot<P> {
    Active(ActiveGeneration<P>),
    Parked { store: EventStore<P>, generation: u64 },
}

/// Supervising task owning one processor generation per resource.
pub struct ProcessorHost<P> {
    applier: Arc<dyn EventApplier<P>>,
    config: ProcessorConfig,
    commands: mpsc::Receiver<HostCommand<P>>,
    slots: HashMap<ResourceId, Slot<P>>,
    generations: JoinSet<Handoff<P>>,
    stopping: bool,
}

impl<P> ProcessorHost<P>
where
    P: Send + Sync + 'static,
{
    /// Spawn a host on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessorError::Config`] if `config` is invalid.
    pub fn spawn(
        applier: Arc<dyn EventApplier<P>>,
        config: ProcessorConfig,
    ) -> Result<HostHandle<P>, ProcessorError> {
        Self::spawn_with_state(applier, config, HashMap::new())
    }

    /// Spawn a host that resumes from a previous host's residual stores.
    ///
    /// Resources with pending events get a generation right away; the others
    /// are parked until their next delivery.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessorError::Config`] if `config` is invalid.
    pub fn spawn_with_state(
        applier: Arc<dyn EventApplier<P>>,
        config: ProcessorConfig,
        residual: ResidualStores<P>,
    ) -> Result<HostHandle<P>, ProcessorError> {
        config.validate()?;

        let (tx, rx) = mpsc::channel(config.command_buffer);
        let handle = HostHandle {
            commands: tx,
            shutdown_timeout: config.shutdown_timeout,
        };

        let mut host = Self {
            applier,
            config,
            commands: rx,
            slots: HashMap::new(),
            generations: JoinSet::new(),
            stopping: false,
        };
        for (resource, store) in residual {
            if store.has_pending() {
                let active = host.start_generation(resource.clone(), store, 1);
                host.slots.insert(resource, Slot::Active(active));
            } else {
                host.slots.insert(resource, Slot::Parked { store, generation: 0 });
            }
        }

        tokio::spawn(host.run());
        Ok(handle)
    }

    #[tracing::instrument(skip(self), name = "processor_host")]
    async fn run(mut self) {
        tracing::info!("Processor host started");
        let mut shutdown_reply = None;

        while !(self.stopping && self.generations.is_empty()) {
            tokio::select! {
                command = self.commands.recv(), if !self.stopping => match command {
                    Some(HostCommand::Shutdown { reply }) => {
                        shutdown_reply = Some(reply);
                        self.begin_shutdown();
                    }
                    Some(command) => self.handle_command(command),
                    None => self.begin_shutdown(),
                },
                Some(joined) = self.generations.join_next(), if !self.generations.is_empty() => {
                    self.on_generation_finished(joined);
                }
            }
        }

        let residual: ResidualStores<P> = self
            .slots
            .drain()
            .filter_map(|(resource, slot)| match slot {
                Slot::Parked { store, .. } => Some((resource, store)),
                Slot::Active(_) => None,
            })
            .collect();

        tracing::info!(resources = residual.len(), "Processor host stopped");
        if let Some(reply) = shutdown_reply {
            if reply.send(residual).is_err() {
                tracing::warn!("Shutdown requester went away before receiving residual state");
            }
        }
    }

    fn handle_command(&mut self, command: HostCommand<P>) {
        match command {
            HostCommand::Deliver { resource, event } => self.deliver(resource, event),
            HostCommand::Retire { resource } => {
                if let Some(Slot::Active(active)) = self.slots.get(&resource) {
                    tracing::debug!(resource = %resource, "Retiring generation on request");
                    active.handle.retire();
                }
            }
            HostCommand::Evict { resource, reply } => {
                let evicted = match self.slots.remove(&resource) {
                    Some(Slot::Parked { store, .. }) => Some(store),
                    Some(active) => {
                        self.slots.insert(resource.clone(), active);
                        None
                    }
                    None => None,
                };
                if evicted.is_some() {
                    tracing::debug!(resource = %resource, "Evicted parked resource state");
                }
                // The requester may have given up waiting
                let _ = reply.send(evicted);
            }
            HostCommand::Shutdown { reply } => {
                // Only the first shutdown request gets the residual state
                drop(reply);
            }
        }
    }

    fn begin_shutdown(&mut self) {
        tracing::info!(generations = self.generations.len(), "Shutting down processor host");
        self.commands.close();

        // Deliveries accepted before the close still go to their generations
        while let Ok(command) = self.commands.try_recv() {
            self.handle_command(command);
        }

        self.stopping = true;
        for slot in self.slots.values() {
            if let Slot::Active(active) = slot {
                active.handle.retire();
            }
        }
    }

    fn deliver(&mut self, resource: ResourceId, event: Event<P>) {
        let (store, generation) = match self.slots.remove(&resource) {
            Some(Slot::Active(mut active)) => {
                if let Err(event) = active.handle.send(event) {
                    tracing::debug!(
                        resource = %resource,
                        sequence_id = %event.sequence_id(),
                        "Generation is draining, holding event for its successor"
                    );
                    active.backlog.push(event);
                }
                self.slots.insert(resource, Slot::Active(active));
                return;
            }
            Some(Slot::Parked { store, generation }) => (store, generation),
            None => (EventStore::new(), 0),
        };

        let mut active = self.start_generation(resource.clone(), store, generation + 1);
        if let Err(event) = active.handle.send(event) {
            active.backlog.push(event);
        }
        self.slots.insert(resource, Slot::Active(active));
    }

    fn start_generation(
        &mut self,
        resource: ResourceId,
        store: EventStore<P>,
        generation: u64,
    ) -> ActiveGeneration<P> {
        let (processor, handle) = OrderedEventProcessor::new(
            resource,
            store,
            Arc::clone(&self.applier),
            self.config.clone(),
        );
        self.generations.spawn(processor.with_generation(generation).run());
        ActiveGeneration {
            handle,
            generation,
            backlog: Vec::new(),
        }
    }

    fn on_generation_finished(&mut self, joined: Result<Handoff<P>, JoinError>) {
        let handoff = match joined {
            Ok(handoff) => handoff,
            Err(error) if error.is_panic() => {
                tracing::error!(error = %error, "Processor generation panicked");
                std::panic::resume_unwind(error.into_panic());
            }
            Err(error) => {
                // Generations are never aborted by the host
                tracing::error!(error = %error, "Processor generation was cancelled");
                return;
            }
        };

        let resource = handoff.resource.clone();
        let (generation, backlog) = match self.slots.remove(&resource) {
            Some(Slot::Active(active)) => (active.generation, active.backlog),
            Some(Slot::Parked { generation, .. }) => (generation, Vec::new()),
            None => (0, Vec::new()),
        };

        let successor_needed = !backlog.is_empty() || (handoff.needs_successor() && !self.stopping);
        let store = handoff.into_store();

        if !successor_needed {
            tracing::debug!(
                resource = %resource,
                generation,
                pending = store.pending_len(),
                "Parking resource state"
            );
            self.slots.insert(resource, Slot::Parked { store, generation });
            return;
        }

        tracing::info!(
            resource = %resource,
            generation = generation + 1,
            last_applied = %store.last_applied(),
            pending = store.pending_len(),
            held_back = backlog.len(),
            "Handing off to successor generation"
        );
        let mut active = self.start_generation(resource.clone(), store, generation + 1);
        for event in backlog {
            if let Err(event) = active.handle.send(event) {
                active.backlog.push(event);
            }
        }
        if self.stopping {
            active.handle.retire();
        }
        self.slots.insert(resource, Slot::Active(active));
    }
}
