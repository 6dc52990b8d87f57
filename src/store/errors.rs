use sqlx::error::DatabaseError;

use crate::utils::{BackoffPolicy, IsTransient, RetryResult};

// ============================================================================
// Store Errors
// ============================================================================
//
// Classification happens here, on typed driver errors, so the retry loop
// never has to inspect error text:
//
//   Duplicate / Conflict / Invalid / NotFound / MissingRelation -> permanent
//   Database with SQLSTATE class 22, 23 or 42                   -> permanent
//   Database (connection, timeout, serialization...)            -> transient
//   Exhausted / Cancelled                                       -> already retried
//
// ============================================================================

/// SQLSTATE classes a retry cannot fix: data exception, integrity constraint
/// violation, syntax error or access rule violation
const REJECTED_CLASSES: [&str; 3] = ["22", "23", "42"];

fn rejected_by_database(db_err: &dyn DatabaseError) -> bool {
    db_err
        .code()
        .is_some_and(|code| REJECTED_CLASSES.iter().any(|class| code.starts_with(class)))
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("order {0} already exists")]
    Duplicate(String),

    #[error("conflicting row for order {order_uid} ({constraint})")]
    Conflict { order_uid: String, constraint: String },

    #[error("order {order_uid} rejected by the database: {detail}")]
    Invalid { order_uid: String, detail: String },

    #[error("order not found: {0}")]
    NotFound(String),

    #[error("order {order_uid} has no {table} row")]
    MissingRelation {
        order_uid: String,
        table: &'static str,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{operation} gave up after {attempts} attempts: {source}")]
    Exhausted {
        operation: &'static str,
        attempts: u32,
        #[source]
        source: Box<StoreError>,
    },

    #[error("{0} cancelled")]
    Cancelled(&'static str),
}

impl StoreError {
    /// Map a failed write statement. Unique violations become Duplicate or
    /// Conflict, other data and constraint errors become Invalid.
    pub fn from_write(err: sqlx::Error, order_uid: &str) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() {
                let on_orders = db_err.table() == Some("orders")
                    || db_err.constraint() == Some("orders_pkey");

                return if on_orders {
                    StoreError::Duplicate(order_uid.to_string())
                } else {
                    StoreError::Conflict {
                        order_uid: order_uid.to_string(),
                        constraint: db_err.constraint().unwrap_or("unique").to_string(),
                    }
                };
            }

            if rejected_by_database(db_err.as_ref()) {
                return StoreError::Invalid {
                    order_uid: order_uid.to_string(),
                    detail: db_err.message().to_string(),
                };
            }
        }
        StoreError::Database(err)
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, StoreError::Duplicate(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }

    /// Collapse a retry outcome into the store's error vocabulary
    pub(crate) fn settle<T>(
        policy: &BackoffPolicy,
        result: RetryResult<T, StoreError>,
    ) -> Result<T, StoreError> {
        match result {
            RetryResult::Success(value) => Ok(value),
            RetryResult::PermanentFailure(err) => Err(err),
            RetryResult::Exhausted {
                attempts,
                last_error,
                ..
            } => Err(StoreError::Exhausted {
                operation: policy.name,
                attempts,
                source: Box::new(last_error),
            }),
            RetryResult::Cancelled { .. } => Err(StoreError::Cancelled(policy.name)),
        }
    }
}

impl IsTransient for StoreError {
    fn is_transient(&self) -> bool {
        match self {
            StoreError::Database(sqlx::Error::Database(db_err)) => {
                !rejected_by_database(db_err.as_ref())
            }
            StoreError::Database(err) => !matches!(
                err,
                sqlx::Error::PoolClosed
                    | sqlx::Error::Configuration(_)
                    | sqlx::Error::ColumnNotFound(_)
                    | sqlx::Error::ColumnDecode { .. }
                    | sqlx::Error::Decode(_)
                    | sqlx::Error::TypeNotFound { .. }
            ),
            _ => false,
        }
    }
}
