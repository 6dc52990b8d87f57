use std::sync::Arc;

use crate::cache::OrderCache;
use crate::models::Order;
use crate::store::{OrderStore, StoreError};

// ============================================================================
// Order Service
// ============================================================================
//
// Cache-aside reads and write-through creates over the durable store. The
// service never retries; retries live in the store under its own profiles.
//
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum OrderServiceError {
    #[error("order not found: {0}")]
    NotFound(String),

    /// The store could not answer; says nothing about whether the order exists
    #[error("order store unavailable: {0}")]
    Unavailable(#[source] StoreError),
}

#[derive(Clone)]
pub struct OrderService {
    store: Arc<dyn OrderStore>,
    cache: Arc<dyn OrderCache>,
}

impl OrderService {
    pub fn new(store: Arc<dyn OrderStore>, cache: Arc<dyn OrderCache>) -> Self {
        Self { store, cache }
    }

    /// Persist, then cache. A failed write is never cached.
    pub async fn create(&self, order: &Order) -> Result<(), StoreError> {
        self.store.create(order).await?;

        tracing::debug!(order_uid = %order.order_uid, "Order created, adding to cache");
        self.cache.add(order.order_uid.clone(), order.clone()).await;
        Ok(())
    }

    pub async fn get_by_uid(&self, order_uid: &str) -> Result<Order, OrderServiceError> {
        if let Some(order) = self.cache.get(order_uid).await {
            tracing::debug!(order_uid = %order_uid, "Order found in cache");
            return Ok(order);
        }

        tracing::debug!(order_uid = %order_uid, "Cache miss, querying store");

        match self.store.get_by_uid(order_uid).await {
            Ok(order) => {
                self.cache.add(order_uid.to_string(), order.clone()).await;
                Ok(order)
            }
            Err(StoreError::NotFound(_)) => {
                tracing::debug!(order_uid = %order_uid, "Order not found");
                Err(OrderServiceError::NotFound(order_uid.to_string()))
            }
            Err(e) => {
                tracing::error!(order_uid = %order_uid, error = %e, "Order lookup failed");
                Err(OrderServiceError::Unavailable(e))
            }
        }
    }

    /// Newest orders straight from the store; lists are never cached
    pub async fn get_latest(&self, limit: u32) -> Result<Vec<Order>, StoreError> {
        self.store.get_latest(limit).await
    }

    /// Load the newest `limit` orders into the cache, returning how many were added
    pub async fn warm_cache(&self, limit: u32) -> Result<usize, StoreError> {
        let orders = self.store.get_latest(limit).await?;
        let count = orders.len();

        // oldest first so the newest orders end up most recently used
        for order in orders.into_iter().rev() {
            self.cache.add(order.order_uid.clone(), order).await;
        }

        tracing::info!(orders = count, "🔥 Cache warmed from store");
        Ok(count)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cache::LruOrderCache;
    use crate::models::fixtures;
    use crate::utils::{retry_on_transient, BackoffPolicy};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::num::NonZeroUsize;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// How the fake store answers `create`
    #[derive(Clone, Copy, Debug)]
    pub(crate) enum CreateBehavior {
        Succeed,
        /// Transient failures for the first n attempts, then success
        FailTransiently(u32),
        AlwaysTransient,
        Conflict,
        /// Data the database refuses, such as a NUL byte in a text column
        Rejected,
    }

    /// In-memory store with call counters. `create` and `get_by_uid` go through
    /// the same retry combinator a real store uses.
    pub(crate) struct FakeStore {
        pub orders: Mutex<HashMap<String, Order>>,
        pub create_calls: AtomicU32,
        pub get_calls: AtomicU32,
        pub latest_calls: AtomicU32,
        pub behavior: CreateBehavior,
        pub reads_unavailable: bool,
        pub policy: BackoffPolicy,
    }

    impl FakeStore {
        pub(crate) fn new(behavior: CreateBehavior) -> Self {
            Self {
                orders: Mutex::new(HashMap::new()),
                create_calls: AtomicU32::new(0),
                get_calls: AtomicU32::new(0),
                latest_calls: AtomicU32::new(0),
                behavior,
                reads_unavailable: false,
                policy: BackoffPolicy::new(
                    "db_write",
                    Duration::from_secs(5),
                    Duration::from_millis(100),
                    Duration::from_secs(1),
                ),
            }
        }

        pub(crate) fn with_orders(orders: impl IntoIterator<Item = Order>) -> Self {
            let store = Self::new(CreateBehavior::Succeed);
            {
                let mut map = store.orders.lock().unwrap();
                for order in orders {
                    map.insert(order.order_uid.clone(), order);
                }
            }
            store
        }

        pub(crate) fn stored(&self) -> usize {
            self.orders.lock().unwrap().len()
        }

        fn transient() -> StoreError {
            StoreError::Database(sqlx::Error::PoolTimedOut)
        }

        fn try_create(&self, order: &Order) -> Result<(), StoreError> {
            let call = self.create_calls.fetch_add(1, Ordering::SeqCst) + 1;
            match self.behavior {
                CreateBehavior::FailTransiently(n) if call <= n => return Err(Self::transient()),
                CreateBehavior::AlwaysTransient => return Err(Self::transient()),
                CreateBehavior::Conflict => {
                    return Err(StoreError::Conflict {
                        order_uid: order.order_uid.clone(),
                        constraint: "items_pkey".into(),
                    })
                }
                CreateBehavior::Rejected => {
                    return Err(StoreError::Invalid {
                        order_uid: order.order_uid.clone(),
                        detail: "invalid byte sequence for encoding \"UTF8\": 0x00".into(),
                    })
                }
                _ => {}
            }

            let mut orders = self.orders.lock().unwrap();
            if orders.contains_key(&order.order_uid) {
                return Err(StoreError::Duplicate(order.order_uid.clone()));
            }
            orders.insert(order.order_uid.clone(), order.clone());
            Ok(())
        }
    }

    #[async_trait]
    impl OrderStore for FakeStore {
        async fn create(&self, order: &Order) -> Result<(), StoreError> {
            let result = retry_on_transient(&self.policy, None, |_| async {
                self.try_create(order)
            })
            .await;
            StoreError::settle(&self.policy, result)
        }

        async fn get_by_uid(&self, order_uid: &str) -> Result<Order, StoreError> {
            self.get_calls.fetch_add(1, Ordering::SeqCst);
            if self.reads_unavailable {
                return Err(StoreError::Exhausted {
                    operation: "db_read",
                    attempts: 3,
                    source: Box::new(Self::transient()),
                });
            }
            self.orders
                .lock()
                .unwrap()
                .get(order_uid)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(order_uid.to_string()))
        }

        async fn get_latest(&self, limit: u32) -> Result<Vec<Order>, StoreError> {
            self.latest_calls.fetch_add(1, Ordering::SeqCst);
            let mut orders: Vec<Order> = self.orders.lock().unwrap().values().cloned().collect();
            orders.sort_by(|a, b| b.date_created.cmp(&a.date_created));
            orders.truncate(limit as usize);
            Ok(orders)
        }
    }

    fn service_with(store: Arc<FakeStore>) -> (OrderService, Arc<LruOrderCache>) {
        let cache = Arc::new(LruOrderCache::new(
            NonZeroUsize::new(100).unwrap(),
            Duration::from_secs(60),
        ));
        (OrderService::new(store, cache.clone()), cache)
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_writes_through_to_cache() {
        let store = Arc::new(FakeStore::new(CreateBehavior::Succeed));
        let (service, _) = service_with(store.clone());
        let order = fixtures::order("uid-1");

        service.create(&order).await.unwrap();
        let loaded = service.get_by_uid("uid-1").await.unwrap();

        assert_eq!(loaded, order);
        assert_eq!(store.get_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_miss_populates_cache_once() {
        let store = Arc::new(FakeStore::with_orders([fixtures::order("uid-1")]));
        let (service, _) = service_with(store.clone());

        service.get_by_uid("uid-1").await.unwrap();
        service.get_by_uid("uid-1").await.unwrap();

        assert_eq!(store.get_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_forces_store_read() {
        let store = Arc::new(FakeStore::with_orders([fixtures::order("uid-1")]));
        let (service, _) = service_with(store.clone());

        service.get_by_uid("uid-1").await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        service.get_by_uid("uid-1").await.unwrap();

        assert_eq!(store.get_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_create_is_not_cached() {
        let store = Arc::new(FakeStore::new(CreateBehavior::Conflict));
        let (service, cache) = service_with(store.clone());

        let err = service.create(&fixtures::order("uid-1")).await.unwrap_err();

        assert!(matches!(err, StoreError::Conflict { .. }));
        assert!(cache.get("uid-1").await.is_none());
        assert_eq!(store.create_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_create_returned_unchanged() {
        let store = Arc::new(FakeStore::with_orders([fixtures::order("uid-1")]));
        let (service, _) = service_with(store.clone());

        let err = service.create(&fixtures::order("uid-1")).await.unwrap_err();

        assert!(err.is_duplicate());
        assert_eq!(store.create_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_order_is_not_found() {
        let store = Arc::new(FakeStore::new(CreateBehavior::Succeed));
        let (service, cache) = service_with(store);

        let err = service.get_by_uid("nope").await.unwrap_err();

        assert!(matches!(err, OrderServiceError::NotFound(ref uid) if uid == "nope"));
        assert!(cache.get("nope").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_store_is_unavailable_not_missing() {
        let mut store = FakeStore::with_orders([fixtures::order("uid-1")]);
        store.reads_unavailable = true;
        let store = Arc::new(store);
        let (service, cache) = service_with(store);

        let err = service.get_by_uid("uid-1").await.unwrap_err();

        assert!(matches!(
            err,
            OrderServiceError::Unavailable(StoreError::Exhausted { .. })
        ));
        assert!(cache.get("uid-1").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_latest_bypasses_cache() {
        let base = chrono::Utc::now();
        let store = Arc::new(FakeStore::with_orders((0..5).map(|i| {
            fixtures::order_created_at(&format!("uid-{i}"), base + chrono::Duration::minutes(i))
        })));
        let (service, cache) = service_with(store.clone());

        let latest = service.get_latest(3).await.unwrap();
        let uids: Vec<&str> = latest.iter().map(|o| o.order_uid.as_str()).collect();

        assert_eq!(uids, vec!["uid-4", "uid-3", "uid-2"]);
        assert_eq!(cache.len().await, 0);
        assert_eq!(store.latest_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_retries_transient_failures_then_succeeds() {
        let store = Arc::new(FakeStore::new(CreateBehavior::FailTransiently(2)));
        let (service, _) = service_with(store.clone());
        let started = tokio::time::Instant::now();

        service.create(&fixtures::order("uid-1")).await.unwrap();

        assert_eq!(store.create_calls.load(Ordering::SeqCst), 3);
        assert_eq!(store.stored(), 1);
        assert!(started.elapsed() < store.policy.max_elapsed_time);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_exhaustion_leaves_nothing_behind() {
        let store = Arc::new(FakeStore::new(CreateBehavior::AlwaysTransient));
        let (service, cache) = service_with(store.clone());

        let err = service.create(&fixtures::order("uid-1")).await.unwrap_err();

        assert!(matches!(err, StoreError::Exhausted { .. }));
        assert_eq!(store.stored(), 0);
        assert!(cache.get("uid-1").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_warm_cache_loads_latest_orders() {
        let base = chrono::Utc::now();
        let store = Arc::new(FakeStore::with_orders((0..4).map(|i| {
            fixtures::order_created_at(&format!("uid-{i}"), base + chrono::Duration::minutes(i))
        })));
        let (service, cache) = service_with(store.clone());

        assert_eq!(service.warm_cache(2).await.unwrap(), 2);
        service.get_by_uid("uid-3").await.unwrap();
        service.get_by_uid("uid-2").await.unwrap();

        assert_eq!(cache.len().await, 2);
        assert_eq!(store.get_calls.load(Ordering::SeqCst), 0);
    }
}
