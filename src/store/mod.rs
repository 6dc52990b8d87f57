// Private module declarations
mod errors;
mod postgres;
mod rows;

use async_trait::async_trait;

use crate::models::Order;

// Re-export for public API
pub use errors::StoreError;
pub use postgres::PgOrderStore;

/// Durable order storage.
///
/// Implementations retry transient failures internally under their own
/// backoff profiles and return permanent errors unchanged.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Persist an order with all its parts atomically
    async fn create(&self, order: &Order) -> Result<(), StoreError>;

    async fn get_by_uid(&self, order_uid: &str) -> Result<Order, StoreError>;

    /// Up to `limit` orders, newest `date_created` first
    async fn get_latest(&self, limit: u32) -> Result<Vec<Order>, StoreError>;
}
