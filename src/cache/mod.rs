//! In-memory order cache.
//!
//! A bounded LRU keyed by `order_uid`. Every entry expires a fixed TTL after
//! it was inserted; expired entries are dropped when touched by `get` and by
//! the optional background sweeper, so `get` never returns one.

use async_trait::async_trait;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{CacheConfig, MAX_DURATION};
use crate::metrics::Metrics;
use crate::models::Order;

#[async_trait]
pub trait OrderCache: Send + Sync {
    /// Returns the order and refreshes its recency, or `None` on miss or expiry
    async fn get(&self, order_uid: &str) -> Option<Order>;

    /// Insert or replace; the TTL restarts from now
    async fn add(&self, order_uid: String, order: Order);
}

/// Cache entry with TTL
struct CacheEntry {
    order: Order,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

pub struct LruOrderCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
    ttl: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl LruOrderCache {
    /// `ttl` is capped at [`MAX_DURATION`]
    pub fn new(capacity: NonZeroUsize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl: ttl.min(MAX_DURATION),
            metrics: None,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.max_size, config.ttl)
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Drop every expired entry, returning how many were removed
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;

        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(uid, _)| uid.clone())
            .collect();

        for uid in &expired {
            entries.pop(uid);
        }
        expired.len()
    }

    /// Purge expired entries every `interval` until `shutdown` fires
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::debug!("Cache sweeper stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        let removed = self.purge_expired().await;
                        if removed > 0 {
                            tracing::debug!(removed = removed, "Purged expired cache entries");
                        }
                    }
                }
            }
        })
    }

    fn record_lookup(&self, hit: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.record_cache_lookup(hit);
        }
    }
}

#[async_trait]
impl OrderCache for LruOrderCache {
    async fn get(&self, order_uid: &str) -> Option<Order> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;

        let expired = match entries.get(order_uid) {
            Some(entry) if !entry.is_expired(now) => {
                self.record_lookup(true);
                return Some(entry.order.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            entries.pop(order_uid);
            tracing::debug!(order_uid = %order_uid, "Cache entry expired");
        }
        self.record_lookup(false);
        None
    }

    async fn add(&self, order_uid: String, order: Order) {
        let entry = CacheEntry {
            order,
            expires_at: Instant::now() + self.ttl,
        };

        let mut entries = self.entries.lock().await;
        if let Some((evicted, _)) = entries.push(order_uid.clone(), entry) {
            if evicted != order_uid {
                tracing::debug!(evicted = %evicted, "Evicted least recently used order");
            }
        }
    }
}
