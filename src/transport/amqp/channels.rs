// src/transport/amqp/channels.rs

//! Per-worker send channels.
//!
//! Publishing reuses one channel per worker instead of opening one per send.
//! The registry keys channels by `WorkerId` and holds a weak reference to
//! each worker's identity token, so channels of workers that dropped their
//! handle without calling `release_worker` are found by the periodic sweep.
//!
//! The registry talks to the broker through the `ChannelSource` seam, which
//! keeps its bookkeeping testable without a running broker.

use std::collections::HashMap;
use std::sync::Weak;

use tokio::sync::RwLock;

use crate::domain::WorkerIdentity;
use crate::{log_debug, Result, WorkerHandle, WorkerId};

/// Where channels come from and go back to.
#[async_trait::async_trait]
pub(crate) trait ChannelSource: Send + Sync {
    type Channel: Clone + Send + Sync + 'static;

    /// Open a fresh channel.
    async fn open_channel(&self) -> Result<Self::Channel>;

    /// Close a channel; closing an already-closed one must succeed.
    async fn close_channel(&self, channel: &Self::Channel) -> Result<()>;
}

struct RegisteredChannel<C> {
    channel: C,
    liveness: Weak<WorkerIdentity>,
}

/// Registry of send channels, one per live worker.
pub(crate) struct ChannelRegistry<S: ChannelSource> {
    // ---
    source: S,
    entries: RwLock<HashMap<WorkerId, RegisteredChannel<S::Channel>>>,
}

impl<S: ChannelSource> ChannelRegistry<S> {
    // ---
    pub(crate) fn new(source: S) -> Self {
        Self {
            source,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// The channel owned by `worker`, opened on first use.
    pub(crate) async fn channel_for(&self, worker: &WorkerHandle) -> Result<S::Channel> {
        // ---
        if let Some(entry) = self.entries.read().await.get(&worker.id()) {
            return Ok(entry.channel.clone());
        }

        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get(&worker.id()) {
            return Ok(entry.channel.clone());
        }

        let channel = self.source.open_channel().await?;
        log_debug!("opened send channel for {}", worker.id());
        entries.insert(
            worker.id(),
            RegisteredChannel {
                channel: channel.clone(),
                liveness: worker.liveness(),
            },
        );

        Ok(channel)
    }

    /// Swap in a fresh channel for `worker` and close the previous one.
    pub(crate) async fn replace(&self, worker: &WorkerHandle) -> Result<S::Channel> {
        // ---
        let (fresh, previous) = {
            let mut entries = self.entries.write().await;
            let fresh = self.source.open_channel().await?;
            let previous = entries.insert(
                worker.id(),
                RegisteredChannel {
                    channel: fresh.clone(),
                    liveness: worker.liveness(),
                },
            );
            (fresh, previous)
        };

        log_debug!("replaced send channel for {}", worker.id());

        if let Some(previous) = previous {
            self.source.close_channel(&previous.channel).await?;
        }

        Ok(fresh)
    }

    /// Close and forget the channel held for `worker`, if any.
    pub(crate) async fn release(&self, worker: WorkerId) -> Result<()> {
        // ---
        let removed = self.entries.write().await.remove(&worker);

        match removed {
            Some(entry) => {
                log_debug!("released send channel for {worker}");
                self.source.close_channel(&entry.channel).await
            }
            None => Ok(()),
        }
    }

    /// Close channels whose workers have dropped their handles.
    ///
    /// Returns how many channels were reclaimed.
    pub(crate) async fn sweep_dead(&self) -> Result<usize> {
        // ---
        let mut dead = Vec::new();
        {
            let mut entries = self.entries.write().await;
            entries.retain(|worker, entry| {
                if entry.liveness.upgrade().is_some() {
                    true
                } else {
                    dead.push((*worker, entry.channel.clone()));
                    false
                }
            });
        }

        let swept = dead.len();
        for (worker, channel) in dead {
            log_debug!("sweeping send channel of departed {worker}");
            self.source.close_channel(&channel).await?;
        }

        Ok(swept)
    }

    /// Close every held channel.
    pub(crate) async fn dispose_all(&self) -> Result<()> {
        // ---
        let drained: Vec<_> = self.entries.write().await.drain().collect();

        for (worker, entry) in drained {
            log_debug!("closing send channel of {worker}");
            self.source.close_channel(&entry.channel).await?;
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Counts opened channels and records closed ones.
    #[derive(Default)]
    struct FakeSource {
        next: AtomicU32,
        closed: Mutex<Vec<u32>>,
        fail_open: std::sync::atomic::AtomicBool,
    }

    impl FakeSource {
        fn closed(&self) -> Vec<u32> {
            self.closed.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl ChannelSource for &FakeSource {
        type Channel = u32;

        async fn open_channel(&self) -> Result<u32> {
            if self.fail_open.load(Ordering::Relaxed) {
                return Err(Error::ConnectionLost);
            }
            Ok(self.next.fetch_add(1, Ordering::Relaxed))
        }

        async fn close_channel(&self, channel: &u32) -> Result<()> {
            self.closed.lock().unwrap().push(*channel);
            Ok(())
        }
    }

    #[tokio::test]
    async fn a_worker_keeps_its_channel() {
        let source = FakeSource::default();
        let registry = ChannelRegistry::new(&source);
        let worker = WorkerHandle::new();

        let first = registry.channel_for(&worker).await.unwrap();
        let second = registry.channel_for(&worker).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(source.next.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn workers_get_distinct_channels() {
        let source = FakeSource::default();
        let registry = ChannelRegistry::new(&source);
        let alpha = WorkerHandle::new();
        let beta = WorkerHandle::new();

        let alpha_channel = registry.channel_for(&alpha).await.unwrap();
        let beta_channel = registry.channel_for(&beta).await.unwrap();

        assert_ne!(alpha_channel, beta_channel);
    }

    #[tokio::test]
    async fn replace_closes_the_previous_channel() {
        let source = FakeSource::default();
        let registry = ChannelRegistry::new(&source);
        let worker = WorkerHandle::new();

        let original = registry.channel_for(&worker).await.unwrap();
        let replacement = registry.replace(&worker).await.unwrap();

        assert_ne!(original, replacement);
        assert_eq!(source.closed(), vec![original]);
        assert_eq!(registry.channel_for(&worker).await.unwrap(), replacement);
    }

    #[tokio::test]
    async fn release_forgets_the_channel() {
        let source = FakeSource::default();
        let registry = ChannelRegistry::new(&source);
        let worker = WorkerHandle::new();

        let original = registry.channel_for(&worker).await.unwrap();
        registry.release(worker.id()).await.unwrap();

        assert_eq!(source.closed(), vec![original]);

        let fresh = registry.channel_for(&worker).await.unwrap();
        assert_ne!(original, fresh);
    }

    #[tokio::test]
    async fn releasing_an_unknown_worker_is_a_noop() {
        let source = FakeSource::default();
        let registry = ChannelRegistry::new(&source);
        let worker = WorkerHandle::new();

        registry.release(worker.id()).await.unwrap();

        assert!(source.closed().is_empty());
    }

    #[tokio::test]
    async fn sweep_reclaims_only_dead_workers() {
        let source = FakeSource::default();
        let registry = ChannelRegistry::new(&source);
        let keeper = WorkerHandle::new();
        let goner = WorkerHandle::new();

        let kept = registry.channel_for(&keeper).await.unwrap();
        let doomed = registry.channel_for(&goner).await.unwrap();

        drop(goner);
        let swept = registry.sweep_dead().await.unwrap();

        assert_eq!(swept, 1);
        assert_eq!(source.closed(), vec![doomed]);
        assert_eq!(registry.channel_for(&keeper).await.unwrap(), kept);
    }

    #[tokio::test]
    async fn dispose_all_closes_everything() {
        let source = FakeSource::default();
        let registry = ChannelRegistry::new(&source);
        let alpha = WorkerHandle::new();
        let beta = WorkerHandle::new();

        let alpha_channel = registry.channel_for(&alpha).await.unwrap();
        let beta_channel = registry.channel_for(&beta).await.unwrap();

        registry.dispose_all().await.unwrap();

        let mut closed = source.closed();
        closed.sort_unstable();
        let mut expected = vec![alpha_channel, beta_channel];
        expected.sort_unstable();
        assert_eq!(closed, expected);

        // The registry is reusable after dispose; a new channel is opened.
        let fresh = registry.channel_for(&alpha).await.unwrap();
        assert_ne!(fresh, alpha_channel);
    }

    #[tokio::test]
    async fn open_failures_surface_to_the_caller() {
        let source = FakeSource::default();
        source.fail_open.store(true, Ordering::Relaxed);
        let registry = ChannelRegistry::new(&source);
        let worker = WorkerHandle::new();

        let result = registry.channel_for(&worker).await;

        assert!(matches!(result, Err(Error::ConnectionLost)));
    }
}
