//! Message-queue transport over AMQP with per-worker channel affinity
//!
//! This library provides the broker plumbing for queue-based worker services:
//! declaring a service's queue topology, publishing durable messages, and
//! running cancellable consume loops that hand each delivery to application
//! code for an explicit accept or reject verdict.
//!

// Import all sub modules once...
mod config;
mod domain;
mod transport;

mod error;
mod macros;

// Logging macros are shared crate-wide.
pub(crate) use macros::{log_debug, log_error, log_info, log_trace, log_warn};

// Re-export main types
pub use config::{OnSendHook, PublishProperties, QueueArg, TransportConfig};

pub use error::{Error, Result};

pub use transport::create_amqp_transport;
pub use transport::create_memory_transport;

// --- public re-exports
pub use domain::{
    //
    Delivery,
    DeliverySink,
    Envelope,
    QueueTopology,
    Transport,
    TransportPtr,
    WorkerHandle,
    WorkerId,
};
