//! Domain layer public interface.
//!
//! This module defines domain-level abstractions that are independent of
//! transport implementations, protocols, or infrastructure concerns.
//!
//! All domain consumers must import symbols via this module, not by
//! referencing individual files directly.

mod envelope;
mod topology;
mod transport;
mod worker;

// --- Transport domain re-exports ---

#[allow(unused)]
pub use envelope::Envelope;
#[allow(unused)]
pub use topology::QueueTopology;
#[allow(unused)]
pub use transport::{
    //
    Delivery,
    DeliverySink,
    Transport,
    TransportPtr,
};
#[allow(unused)]
pub use worker::{WorkerHandle, WorkerId};

pub(crate) use transport::Disposition;
pub(crate) use worker::WorkerIdentity;
