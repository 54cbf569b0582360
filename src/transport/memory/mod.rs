// src/transport/memory/mod.rs

//! In-memory transport implementation.
//!
//! This module provides a pure in-process implementation of the domain-level
//! `Transport` trait. It is intended primarily for testing, local execution,
//! and as a reference for transport semantics.
//!
//! ## Reference Semantics
//!
//! The in-memory transport defines the **reference behavior** for the
//! transport layer. The broker-backed transport is expected to match this
//! behavior as closely as its broker allows and to document any unavoidable
//! deviations.
//!
//! In particular, the in-memory transport establishes the following
//! expectations:
//!
//! - Declaration calls are idempotent; re-running them never loses messages.
//! - A publish routes by exact key match; unroutable publishes vanish.
//! - A consume loop never holds more undisposed deliveries than its prefetch
//!   window, and whatever it still holds when it stops becomes deliverable
//!   again.
//! - Cancellation ends a loop with `Error::Cancelled` even when its queue is
//!   empty.
//!
//! ## Non-Goals
//!
//! This transport does not attempt to emulate broker failure modes,
//! persistence across processes, or wire-level properties. It exists to
//! provide a deterministic baseline against which behavior can be validated.

mod transport;

pub use transport::create_transport;
