// src/domain/worker.rs

//! Worker identity for channel affinity.
//!
//! Publishing reuses one broker channel per worker. Affinity is keyed by an
//! explicit handle rather than by thread, so a worker can migrate across an
//! async runtime's threads without leaking channels.
//!
//! The handle is deliberately not `Clone`: one handle, one worker, one
//! channel. The channel registry holds a weak reference to the handle's
//! identity token, so dropping the handle is enough for the periodic sweep to
//! reclaim the worker's channel even when `release_worker` was never called.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque token whose liveness mirrors the owning handle's.
#[derive(Debug)]
pub(crate) struct WorkerIdentity {
    id: u64,
}

/// Stable identifier of a worker, usable after the handle is gone.
///
/// This is what `release_worker` takes: cleanup code often outlives the
/// handle it is cleaning up after.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Identity of one publishing worker.
///
/// Create one per worker task and pass it to every `send` from that task.
///
/// # Example
///
/// ```
/// use wave_amqp::WorkerHandle;
///
/// let worker = WorkerHandle::new();
/// let other = WorkerHandle::new();
///
/// assert_ne!(worker.id(), other.id());
/// ```
#[derive(Debug)]
pub struct WorkerHandle {
    // ---
    identity: Arc<WorkerIdentity>,
}

impl WorkerHandle {
    // ---
    /// Mint a handle with a process-unique id.
    pub fn new() -> Self {
        let id = NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed);

        Self {
            identity: Arc::new(WorkerIdentity { id }),
        }
    }

    /// The worker's stable identifier.
    pub fn id(&self) -> WorkerId {
        WorkerId(self.identity.id)
    }

    /// Weak liveness token for registry bookkeeping.
    ///
    /// Upgrading fails once the handle has been dropped.
    pub(crate) fn liveness(&self) -> Weak<WorkerIdentity> {
        Arc::downgrade(&self.identity)
    }
}

impl Default for WorkerHandle {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_get_distinct_ids() {
        let a = WorkerHandle::new();
        let b = WorkerHandle::new();

        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn liveness_tracks_the_handle() {
        let handle = WorkerHandle::new();
        let liveness = handle.liveness();

        assert!(liveness.upgrade().is_some());

        drop(handle);

        assert!(liveness.upgrade().is_none());
    }

    #[test]
    fn worker_id_displays_with_prefix() {
        let handle = WorkerHandle::new();

        assert!(handle.id().to_string().starts_with("worker-"));
    }
}
