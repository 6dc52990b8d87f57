use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::time::Duration;

use crate::utils::{retry_on_transient, BackoffPolicy, RetryResult};

use super::{BrokerError, DeadLetterSink, InboundMessage};

// ============================================================================
// Dead Letter Topic Publisher
// ============================================================================
//
// Parks messages the consumer can never process. The original payload and key
// are kept byte-for-byte; the failure is described in headers:
//
//   dlq-reason            malformed | conflict | invalid
//   dlq-error             decoder or store error text
//   dlq-source-topic      topic the message was read from
//   dlq-source-partition
//   dlq-source-offset
//
// ============================================================================

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterReason {
    /// Payload is not a valid order
    Malformed,
    /// Order conflicts with stored rows and can never be inserted
    Conflict,
    /// Order decoded but the database rejects its data
    Invalid,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::Malformed => "malformed",
            DeadLetterReason::Conflict => "conflict",
            DeadLetterReason::Invalid => "invalid",
        }
    }
}

pub struct KafkaDeadLetterSink {
    producer: FutureProducer,
    topic: String,
    policy: BackoffPolicy,
}

impl KafkaDeadLetterSink {
    pub fn new(brokers: &str, topic: &str, policy: BackoffPolicy) -> Result<Self, BrokerError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .create()?;

        Ok(Self {
            producer,
            topic: topic.to_string(),
            policy,
        })
    }

    async fn send_once(
        &self,
        message: &InboundMessage,
        headers: &OwnedHeaders,
    ) -> Result<(), BrokerError> {
        let mut record = FutureRecord::<[u8], [u8]>::to(&self.topic)
            .payload(message.payload.as_slice())
            .headers(headers.clone());
        if let Some(key) = &message.key {
            record = record.key(key.as_slice());
        }

        self.producer
            .send(record, Timeout::After(SEND_TIMEOUT))
            .await
            .map(|_| ())
            .map_err(|(e, _)| BrokerError::Kafka(e))
    }
}

fn dead_letter_headers(
    message: &InboundMessage,
    reason: DeadLetterReason,
    detail: &str,
) -> OwnedHeaders {
    let partition = message.partition.to_string();
    let offset = message.offset.to_string();

    OwnedHeaders::new()
        .insert(Header {
            key: "dlq-reason",
            value: Some(reason.as_str()),
        })
        .insert(Header {
            key: "dlq-error",
            value: Some(detail),
        })
        .insert(Header {
            key: "dlq-source-topic",
            value: Some(message.topic.as_str()),
        })
        .insert(Header {
            key: "dlq-source-partition",
            value: Some(partition.as_str()),
        })
        .insert(Header {
            key: "dlq-source-offset",
            value: Some(offset.as_str()),
        })
}

#[async_trait]
impl DeadLetterSink for KafkaDeadLetterSink {
    async fn publish(
        &self,
        message: &InboundMessage,
        reason: DeadLetterReason,
        detail: &str,
    ) -> Result<(), BrokerError> {
        let headers = dead_letter_headers(message, reason, detail);

        let result = retry_on_transient(&self.policy, None, |_attempt| {
            self.send_once(message, &headers)
        })
        .await;

        match result {
            RetryResult::Success(()) => {
                tracing::info!(
                    topic = %self.topic,
                    reason = reason.as_str(),
                    source_offset = message.offset,
                    "Published to dead letter topic"
                );
                Ok(())
            }
            RetryResult::PermanentFailure(e) | RetryResult::Exhausted { last_error: e, .. } => {
                tracing::error!(
                    error = %e,
                    topic = %self.topic,
                    "Failed to publish to dead letter topic"
                );
                Err(e)
            }
            RetryResult::Cancelled { .. } => Err(BrokerError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::message::Headers;

    fn header<'a>(headers: &'a OwnedHeaders, key: &str) -> Option<&'a [u8]> {
        headers
            .iter()
            .find(|h| h.key == key)
            .and_then(|h| h.value)
    }

    #[test]
    fn test_headers_describe_failure_and_origin() {
        let message = InboundMessage {
            topic: "orders".into(),
            partition: 3,
            offset: 1207,
            key: None,
            payload: b"{not json".to_vec(),
        };

        let headers = dead_letter_headers(&message, DeadLetterReason::Malformed, "expected value");

        assert_eq!(headers.count(), 5);
        assert_eq!(header(&headers, "dlq-reason"), Some(&b"malformed"[..]));
        assert_eq!(header(&headers, "dlq-error"), Some(&b"expected value"[..]));
        assert_eq!(header(&headers, "dlq-source-topic"), Some(&b"orders"[..]));
        assert_eq!(header(&headers, "dlq-source-partition"), Some(&b"3"[..]));
        assert_eq!(header(&headers, "dlq-source-offset"), Some(&b"1207"[..]));
    }

    #[test]
    fn test_reason_labels() {
        assert_eq!(DeadLetterReason::Malformed.as_str(), "malformed");
        assert_eq!(DeadLetterReason::Conflict.as_str(), "conflict");
        assert_eq!(DeadLetterReason::Invalid.as_str(), "invalid");
    }
}
