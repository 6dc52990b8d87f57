use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::error::KafkaError;
use rdkafka::{Offset, TopicPartitionList};
use std::sync::Arc;

use crate::config::KafkaConfig;

use super::{BrokerError, InboundMessage, MessageSource};

/// Orders topic consumer with manual offset commits
pub struct KafkaOrderSource {
    consumer: Arc<StreamConsumer>,
    topic: String,
}

impl KafkaOrderSource {
    pub fn new(config: &KafkaConfig) -> Result<Self, BrokerError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", config.bootstrap_servers())
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "6000")
            .set("fetch.min.bytes", "10000")
            .set("fetch.max.bytes", "10000000")
            .create()?;

        consumer.subscribe(&[config.topic.as_str()])?;

        tracing::info!(
            topic = %config.topic,
            group_id = %config.group_id,
            brokers = %config.bootstrap_servers(),
            "📡 Subscribed to orders topic"
        );

        Ok(Self {
            consumer: Arc::new(consumer),
            topic: config.topic.clone(),
        })
    }
}

/// The committed offset is the next one to read
fn commit_offsets(message: &InboundMessage) -> Result<TopicPartitionList, KafkaError> {
    let mut offsets = TopicPartitionList::new();
    offsets.add_partition_offset(
        &message.topic,
        message.partition,
        Offset::Offset(message.offset + 1),
    )?;
    Ok(offsets)
}

impl From<&BorrowedMessage<'_>> for InboundMessage {
    fn from(message: &BorrowedMessage<'_>) -> Self {
        InboundMessage {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(<[u8]>::to_vec),
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        }
    }
}

#[async_trait]
impl MessageSource for KafkaOrderSource {
    async fn next_message(&self) -> Result<InboundMessage, BrokerError> {
        let message = self.consumer.recv().await?;
        Ok(InboundMessage::from(&message))
    }

    async fn commit(&self, message: &InboundMessage) -> Result<(), BrokerError> {
        let offsets = commit_offsets(message)?;

        // a sync commit waits on the broker; keep it off the async workers
        let consumer = self.consumer.clone();
        tokio::task::spawn_blocking(move || consumer.commit(&offsets, CommitMode::Sync)).await??;

        tracing::debug!(
            topic = %self.topic,
            partition = message.partition,
            offset = message.offset,
            "Offset committed"
        );
        Ok(())
    }
}
