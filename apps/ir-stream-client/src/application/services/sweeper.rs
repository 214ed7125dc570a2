//! Eviction Sweeper
//!
//! Periodically unsubscribes channels nobody has queried within the idle
//! timeout. Each sweep snapshots the key set, then evicts candidates one at a
//! time; the cache re-checks idleness under its own lock, so a query racing
//! the sweep always wins.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::application::services::cache::SubscriptionCache;
use crate::domain::channel::ChannelKey;

/// Sweeper timing and pinned channels.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Time between sweeps.
    pub interval: Duration,
    /// Entries idle longer than this are evicted.
    pub idle_timeout: Duration,
    /// Channels never evicted.
    pub pinned: HashSet<ChannelKey>,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(300),
            pinned: HashSet::new(),
        }
    }
}

/// Background idle-eviction task.
#[derive(Debug)]
pub struct EvictionSweeper {
    cache: Arc<SubscriptionCache>,
    config: SweeperConfig,
    cancel: CancellationToken,
}

impl EvictionSweeper {
    /// Create a sweeper over `cache`.
    #[must_use]
    pub const fn new(
        cache: Arc<SubscriptionCache>,
        config: SweeperConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            cache,
            config,
            cancel,
        }
    }

    /// Sweep every `interval` until cancelled.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval_at(
            Instant::now() + self.config.interval,
            self.config.interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            interval_secs = self.config.interval.as_secs(),
            idle_timeout_secs = self.config.idle_timeout.as_secs(),
            pinned = self.config.pinned.len(),
            "eviction sweeper started"
        );

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    tracing::info!("eviction sweeper stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let evicted = self.sweep(Instant::now());
                    if !evicted.is_empty() {
                        tracing::info!(count = evicted.len(), remaining = self.cache.len(), "sweep evicted idle channels");
                    }
                }
            }
        }
    }

    /// Evict every unpinned entry idle at `now`. Returns the evicted keys.
    pub fn sweep(&self, now: Instant) -> Vec<ChannelKey> {
        self.cache
            .snapshot()
            .into_iter()
            .filter(|(key, last_access)| {
                !self.config.pinned.contains(key)
                    && now.saturating_duration_since(*last_access) > self.config.idle_timeout
            })
            .filter_map(|(key, _)| {
                self.cache
                    .evict_if_idle(&key, now, self.config.idle_timeout)
                    .then_some(key)
            })
            .collect()
    }
}
