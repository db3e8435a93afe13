//! # Event Serializer Runtime
//!
//! Runtime for applying each resource's events exactly once, in order.
//!
//! ## Core Components
//!
//! - **`OrderedEventProcessor`**: One generation of a resource's single consumer.
//!   Pumps its input, re-orders and deduplicates through an `EventStore`,
//!   applies ready events sequentially, and drains into a `Handoff` on retirement.
//! - **`ProcessorHost`**: Supervisor task that routes deliveries to the active
//!   generation of each resource and starts successor generations seeded with
//!   the residual state.
//! - **`ProcessorConfig`**: Generation lifetime, delivery budget, drain sweep
//!   budget, and apply failure policy.
//!
//! ## Example
//!
//! ```ignore
//! use event_serializer_runtime::{ProcessorConfig, ProcessorHost};
//!
//! let host = ProcessorHost::spawn(
//!     Arc::new(my_applier),
//!     ProcessorConfig::default().with_generation_timeout(Duration::from_secs(300)),
//! )?;
//!
//! host.deliver(ResourceId::new("account-1"), event).await?;
//!
//! let residual = host.shutdown().await?;
//! ```

/// Processor and host configuration
pub mod config;

/// Generation supervisor
pub mod host;

/// Prometheus metrics for observability
pub mod metrics;

/// Ordered event processor
pub mod processor;

/// Retry logic with exponential backoff
pub mod retry;

/// Error types for the processor runtime
pub mod error {
    use crate::config::ConfigError;
    use std::time::Duration;
    use thiserror::Error;

    /// Errors surfaced by the host and its handles
    ///
    /// Apply failures are not here: the processor logs them and moves on.
    #[derive(Error, Debug)]
    pub enum ProcessorError {
        /// The host task is gone and accepts no more commands
        #[error("Processor host has stopped")]
        HostStopped,

        /// Host shutdown did not finish in time
        ///
        /// Generations may still be draining in the background.
        #[error("Shutdown timed out after {0:?}")]
        ShutdownTimeout(Duration),

        /// The configuration was rejected
        #[error(transparent)]
        Config(#[from] ConfigError),
    }
}

pub use config::{ApplyFailurePolicy, ConfigError, ProcessorConfig};
pub use error::ProcessorError;
pub use host::{HostHandle, ProcessorHost, ResidualStores};
pub use processor::{OrderedEventProcessor, ProcessorHandle};
pub use retry::RetryPolicy;
