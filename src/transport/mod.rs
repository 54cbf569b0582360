//! Transport implementations.
//!
//! This module provides concrete implementations of the domain-level
//! `Transport` trait. Concrete types stay private; each backend is exposed
//! only through its constructor function.
//!
//! Domain code must not depend on transport-specific types.

mod amqp;
mod memory;

pub use amqp::create_transport as create_amqp_transport;
pub use memory::create_transport as create_memory_transport;
