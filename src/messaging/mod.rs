// Private module declarations
mod dead_letter;
mod source;

use async_trait::async_trait;
use rdkafka::error::KafkaError;

use crate::utils::IsTransient;

// Re-export for public API
pub use dead_letter::{DeadLetterReason, KafkaDeadLetterSink};
pub use source::KafkaOrderSource;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),

    #[error("message source closed")]
    Closed,

    #[error("blocking broker call failed: {0}")]
    Blocking(#[from] tokio::task::JoinError),
}

impl IsTransient for BrokerError {
    fn is_transient(&self) -> bool {
        match self {
            BrokerError::Kafka(e) => !matches!(
                e,
                KafkaError::ClientConfig(..)
                    | KafkaError::ClientCreation(_)
                    | KafkaError::Subscription(_)
            ),
            BrokerError::Closed | BrokerError::Blocking(_) => false,
        }
    }
}

/// A message read from the orders topic, detached from the client's buffers
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

/// Where the consumer reads orders from
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Wait for the next message
    async fn next_message(&self) -> Result<InboundMessage, BrokerError>;

    /// Mark `message` and everything before it on its partition as processed
    async fn commit(&self, message: &InboundMessage) -> Result<(), BrokerError>;
}

/// Where unprocessable messages are parked
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn publish(
        &self,
        message: &InboundMessage,
        reason: DeadLetterReason,
        detail: &str,
    ) -> Result<(), BrokerError>;
}
