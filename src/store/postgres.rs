use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::future::Future;
use std::sync::Arc;

use crate::config::RetrySettings;
use crate::metrics::Metrics;
use crate::models::Order;
use crate::utils::{retry_on_transient, BackoffPolicy, RetryResult};

use super::rows::{assemble_orders, DeliveryRow, ItemRow, OrderRow, PaymentRow, RelatedRows};
use super::{OrderStore, StoreError};

// ============================================================================
// PostgreSQL Order Store
// ============================================================================
//
// Write path: one transaction inserts into orders, deliveries, payments and
// items. Any failure drops the transaction (rolled back by sqlx) and the whole
// write is retried from scratch under the db_write profile. A unique violation
// on orders is a duplicate event and is never retried.
//
// Read path: the order rows are selected first, then each child table is
// queried once with `order_uid = ANY($1)` for the whole page.
//
// ============================================================================

const SCHEMA: &str = include_str!("../../sql/schema.sql");

const ORDER_COLUMNS: &str = "order_uid, track_number, entry, locale, internal_signature, \
     customer_id, delivery_service, shardkey, sm_id, date_created, oof_shard";

pub struct PgOrderStore {
    pool: PgPool,
    write_policy: BackoffPolicy,
    read_policy: BackoffPolicy,
    metrics: Option<Arc<Metrics>>,
}

impl PgOrderStore {
    pub fn new(pool: PgPool, retry: &RetrySettings) -> Self {
        Self {
            pool,
            write_policy: retry.db_write.clone(),
            read_policy: retry.db_read.clone(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(pool)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the four tables if they are missing
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        tracing::info!("Order schema ready");
        Ok(())
    }

    /// Run `operation` under `policy`, reporting retries to the metrics registry
    async fn retried<T, F, Fut>(
        &self,
        policy: &BackoffPolicy,
        mut operation: F,
    ) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempts = 0;
        let result = retry_on_transient(policy, None, |attempt| {
            attempts = attempt;
            if attempt > 1 {
                if let Some(metrics) = &self.metrics {
                    metrics.record_retry_attempt(policy.name, attempt);
                }
            }
            operation()
        })
        .await;

        if let Some(metrics) = &self.metrics {
            let outcome = match &result {
                RetryResult::Success(_) if attempts > 1 => Some("success"),
                RetryResult::PermanentFailure(_) if attempts > 1 => Some("permanent"),
                RetryResult::Exhausted { .. } => Some("exhausted"),
                RetryResult::Cancelled { .. } => Some("cancelled"),
                _ => None,
            };
            if let Some(outcome) = outcome {
                metrics.record_retry_outcome(policy.name, outcome);
            }
        }

        StoreError::settle(policy, result)
    }

    async fn insert_order(&self, order: &Order) -> Result<(), StoreError> {
        let uid = order.order_uid.as_str();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO orders (
                order_uid, track_number, entry, locale, internal_signature,
                customer_id, delivery_service, shardkey, sm_id, date_created, oof_shard
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(uid)
        .bind(&order.track_number)
        .bind(&order.entry)
        .bind(&order.locale)
        .bind(&order.internal_signature)
        .bind(&order.customer_id)
        .bind(&order.delivery_service)
        .bind(&order.shardkey)
        .bind(order.sm_id)
        .bind(order.date_created)
        .bind(&order.oof_shard)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::from_write(e, uid))?;

        let d = &order.delivery;
        sqlx::query(
            r#"
            INSERT INTO deliveries (order_uid, name, phone, zip, city, address, region, email)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(uid)
        .bind(&d.name)
        .bind(&d.phone)
        .bind(&d.zip)
        .bind(&d.city)
        .bind(&d.address)
        .bind(&d.region)
        .bind(&d.email)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::from_write(e, uid))?;

        let p = &order.payment;
        sqlx::query(
            r#"
            INSERT INTO payments (
                order_uid, transaction, request_id, currency, provider, amount,
                payment_dt, bank, delivery_cost, goods_total, custom_fee
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(uid)
        .bind(&p.transaction)
        .bind(&p.request_id)
        .bind(&p.currency)
        .bind(&p.provider)
        .bind(p.amount)
        .bind(p.payment_dt)
        .bind(&p.bank)
        .bind(p.delivery_cost)
        .bind(p.goods_total)
        .bind(p.custom_fee)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::from_write(e, uid))?;

        for item in &order.items {
            sqlx::query(
                r#"
                INSERT INTO items (
                    order_uid, chrt_id, track_number, price, rid, name,
                    sale, size, total_price, nm_id, brand, status
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                "#,
            )
            .bind(uid)
            .bind(item.chrt_id)
            .bind(&item.track_number)
            .bind(item.price)
            .bind(&item.rid)
            .bind(&item.name)
            .bind(item.sale)
            .bind(&item.size)
            .bind(item.total_price)
            .bind(item.nm_id)
            .bind(&item.brand)
            .bind(item.status)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::from_write(e, uid))?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn fetch_order(&self, order_uid: &str) -> Result<Order, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row: Option<OrderRow> = sqlx::query_as(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE order_uid = $1"
        ))
        .bind(order_uid)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Err(StoreError::NotFound(order_uid.to_string()));
        };

        let related = load_related(&mut tx, &[order_uid.to_string()]).await?;
        tx.commit().await?;

        let mut orders = assemble_orders(vec![row], related)?;
        orders
            .pop()
            .ok_or_else(|| StoreError::NotFound(order_uid.to_string()))
    }

    async fn fetch_latest(&self, limit: u32) -> Result<Vec<Order>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let rows: Vec<OrderRow> = sqlx::query_as(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders ORDER BY date_created DESC, order_uid LIMIT $1"
        ))
        .bind(i64::from(limit))
        .fetch_all(&mut *tx)
        .await?;

        if rows.is_empty() {
            tx.commit().await?;
            return Ok(vec![]);
        }

        let uids: Vec<String> = rows.iter().map(|r| r.order_uid.clone()).collect();
        let related = load_related(&mut tx, &uids).await?;
        tx.commit().await?;

        assemble_orders(rows, related)
    }
}

/// One query per child table for the whole set of order uids
async fn load_related(
    tx: &mut Transaction<'_, Postgres>,
    uids: &[String],
) -> Result<RelatedRows, StoreError> {
    let deliveries: Vec<DeliveryRow> = sqlx::query_as(
        r#"
        SELECT order_uid, name, phone, zip, city, address, region, email
        FROM deliveries
        WHERE order_uid = ANY($1)
        "#,
    )
    .bind(uids)
    .fetch_all(&mut **tx)
    .await?;

    let payments: Vec<PaymentRow> = sqlx::query_as(
        r#"
        SELECT order_uid, transaction, request_id, currency, provider, amount,
               payment_dt, bank, delivery_cost, goods_total, custom_fee
        FROM payments
        WHERE order_uid = ANY($1)
        "#,
    )
    .bind(uids)
    .fetch_all(&mut **tx)
    .await?;

    let items: Vec<ItemRow> = sqlx::query_as(
        r#"
        SELECT order_uid, chrt_id, track_number, price, rid, name,
               sale, size, total_price, nm_id, brand, status
        FROM items
        WHERE order_uid = ANY($1)
        ORDER BY order_uid, chrt_id
        "#,
    )
    .bind(uids)
    .fetch_all(&mut **tx)
    .await?;

    Ok(RelatedRows {
        deliveries,
        payments,
        items,
    })
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn create(&self, order: &Order) -> Result<(), StoreError> {
        let result = self
            .retried(&self.write_policy, || self.insert_order(order))
            .await;

        match result {
            Ok(()) => {
                tracing::info!(
                    order_uid = %order.order_uid,
                    items = order.items.len(),
                    "✅ Order persisted"
                );
                Ok(())
            }
            Err(err) => {
                if err.is_duplicate() {
                    tracing::warn!(order_uid = %order.order_uid, "Duplicate order, not retrying");
                }
                Err(err)
            }
        }
    }

    async fn get_by_uid(&self, order_uid: &str) -> Result<Order, StoreError> {
        self.retried(&self.read_policy, || self.fetch_order(order_uid))
            .await
    }

    async fn get_latest(&self, limit: u32) -> Result<Vec<Order>, StoreError> {
        let orders = self
            .retried(&self.read_policy, || self.fetch_latest(limit))
            .await?;
        tracing::debug!(limit = limit, returned = orders.len(), "Loaded latest orders");
        Ok(orders)
    }
}

// ============================================================================
// Tests
// ============================================================================
//
// The database-backed tests are ignored by default. Run them against a
// scratch database with:
//
//   TEST_DATABASE_URL=postgres://... cargo test -- --ignored
//
// Each test uses its own order uids.
//
// ============================================================================
