pub mod retry;

pub use retry::{retry_on_transient, retry_with_backoff, BackoffPolicy, IsTransient, RetryResult};
