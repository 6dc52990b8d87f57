use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::RetrySettings;
use crate::health::{self, HealthRegistry, HealthStatus};
use crate::messaging::{
    BrokerError, DeadLetterReason, DeadLetterSink, InboundMessage, MessageSource,
};
use crate::metrics::Metrics;
use crate::models::Order;
use crate::service::OrderService;
use crate::store::StoreError;
use crate::utils::{retry_on_transient, retry_with_backoff, BackoffPolicy, IsTransient, RetryResult};

// ============================================================================
// Order Stream Consumer
// ============================================================================
//
// One message at a time:
//
//   Reading    -> next message under the broker_read profile, raced against
//                 shutdown; exhaustion loops back here
//   Persisting -> decode, then OrderService::create under the persist profile
//   Committing -> offset commit; a failure is logged, the order stays stored
//
// Offsets are committed only once the order is durable (or already was), or
// once an unprocessable message has been parked on the dead letter topic.
// Everything else is left uncommitted for the broker to redeliver.
//
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Reading,
    Persisting,
    Committing,
}

enum ReadOutcome {
    Message(InboundMessage),
    /// Budget ran out; go back to Reading
    Retry,
    Shutdown,
    Failed(BrokerError),
}

pub struct OrderConsumer {
    source: Arc<dyn MessageSource>,
    service: OrderService,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
    read_policy: BackoffPolicy,
    persist_policy: BackoffPolicy,
    health: Arc<HealthRegistry>,
    metrics: Arc<Metrics>,
    state: ConsumerState,
}

impl OrderConsumer {
    pub fn new(
        source: Arc<dyn MessageSource>,
        service: OrderService,
        retry: &RetrySettings,
        health: Arc<HealthRegistry>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            source,
            service,
            dead_letters: None,
            read_policy: retry.broker_read.clone(),
            persist_policy: retry.persist.clone(),
            health,
            metrics,
            state: ConsumerState::Reading,
        }
    }

    pub fn with_dead_letters(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    /// Consume until `shutdown` fires or the source fails permanently.
    ///
    /// Shutdown is honoured at the top of the loop and while waiting for a
    /// message. A persist already in progress runs to the end of its budget.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<(), BrokerError> {
        tracing::info!("🚀 Order consumer started");
        self.health.update(health::CONSUMER, HealthStatus::Healthy).await;

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            self.transition(ConsumerState::Reading);
            let message = match self.read(&shutdown).await {
                ReadOutcome::Message(message) => message,
                ReadOutcome::Retry => continue,
                ReadOutcome::Shutdown => break,
                ReadOutcome::Failed(e) => {
                    self.health
                        .update(health::CONSUMER, HealthStatus::Unhealthy(e.to_string()))
                        .await;
                    return Err(e);
                }
            };
            self.metrics.messages_consumed.inc();

            self.transition(ConsumerState::Persisting);
            if self.process(&message).await {
                self.transition(ConsumerState::Committing);
                self.commit(&message).await;
            }
        }

        tracing::info!(state = ?self.state(), "Order consumer stopped");
        Ok(())
    }

    fn transition(&mut self, next: ConsumerState) {
        tracing::trace!(from = ?self.state, to = ?next, "Consumer state");
        self.state = next;
    }

    async fn read(&self, shutdown: &CancellationToken) -> ReadOutcome {
        let policy = &self.read_policy;

        let result = tokio::select! {
            _ = shutdown.cancelled() => return ReadOutcome::Shutdown,
            result = retry_on_transient(policy, Some(shutdown), |attempt| {
                if attempt > 1 {
                    self.metrics.record_retry_attempt(policy.name, attempt);
                }
                self.source.next_message()
            }) => result,
        };

        match result {
            RetryResult::Success(message) => {
                self.health.update(health::CONSUMER, HealthStatus::Healthy).await;
                ReadOutcome::Message(message)
            }
            RetryResult::Exhausted { attempts, last_error, .. } => {
                tracing::error!(
                    attempts = attempts,
                    error = %last_error,
                    "Failed to read message after retries"
                );
                self.metrics.record_retry_outcome(policy.name, "exhausted");
                self.health
                    .update(
                        health::CONSUMER,
                        HealthStatus::Degraded(format!("broker read exhausted: {last_error}")),
                    )
                    .await;
                ReadOutcome::Retry
            }
            RetryResult::PermanentFailure(e) => {
                self.metrics.record_retry_outcome(policy.name, "permanent");
                ReadOutcome::Failed(e)
            }
            RetryResult::Cancelled { .. } => ReadOutcome::Shutdown,
        }
    }

    /// Decode and persist; returns whether the offset should be committed
    async fn process(&self, message: &InboundMessage) -> bool {
        let order = match Order::decode(&message.payload) {
            Ok(order) => order,
            Err(e) => {
                tracing::error!(
                    partition = message.partition,
                    offset = message.offset,
                    error = %e,
                    payload = %String::from_utf8_lossy(&message.payload),
                    "Failed to decode order"
                );
                return self
                    .park(message, DeadLetterReason::Malformed, &e.to_string())
                    .await;
            }
        };

        let started = Instant::now();
        let result = self.persist(&order).await;
        let elapsed = started.elapsed().as_secs_f64();
        let uid = order.order_uid.as_str();

        match result {
            RetryResult::Success(()) => {
                tracing::info!(order_uid = %uid, "Successfully processed order");
                self.metrics.record_persist("success", elapsed);
                self.health.update(health::DATABASE, HealthStatus::Healthy).await;
                true
            }
            RetryResult::PermanentFailure(StoreError::Duplicate(_)) => {
                tracing::info!(order_uid = %uid, "Order already stored, committing redelivery");
                self.metrics.record_persist("duplicate", elapsed);
                true
            }
            RetryResult::PermanentFailure(e @ StoreError::Conflict { .. }) => {
                self.metrics.record_persist("conflict", elapsed);
                self.park(message, DeadLetterReason::Conflict, &e.to_string())
                    .await
            }
            RetryResult::PermanentFailure(e @ StoreError::Invalid { .. }) => {
                tracing::error!(order_uid = %uid, error = %e, "Order rejected by the database");
                self.metrics.record_persist("invalid", elapsed);
                self.park(message, DeadLetterReason::Invalid, &e.to_string())
                    .await
            }
            RetryResult::PermanentFailure(e) => {
                tracing::error!(order_uid = %uid, error = %e, "Failed to save order");
                self.metrics.record_persist("failed", elapsed);
                self.metrics.record_retry_outcome(self.persist_policy.name, "permanent");
                self.metrics.record_skipped("persist_failed");
                false
            }
            RetryResult::Exhausted { last_error, .. } => {
                tracing::error!(
                    order_uid = %uid,
                    error = %last_error,
                    "Failed to save order after retries"
                );
                self.metrics.record_persist("exhausted", elapsed);
                self.metrics.record_retry_outcome(self.persist_policy.name, "exhausted");
                self.metrics.record_skipped("persist_exhausted");
                self.health
                    .update(
                        health::DATABASE,
                        HealthStatus::Degraded(format!("order persist exhausted: {last_error}")),
                    )
                    .await;
                false
            }
            RetryResult::Cancelled { .. } => {
                self.metrics.record_skipped("cancelled");
                false
            }
        }
    }

    async fn persist(&self, order: &Order) -> RetryResult<(), StoreError> {
        let policy = &self.persist_policy;

        let mut attempts = 0;
        let result = retry_with_backoff(policy, None, persist_is_permanent, |attempt| {
            attempts = attempt;
            if attempt > 1 {
                self.metrics.record_retry_attempt(policy.name, attempt);
            }
            self.service.create(order)
        })
        .await;

        if result.is_success() && attempts > 1 {
            self.metrics.record_retry_outcome(policy.name, "success");
        }
        result
    }

    /// Send an unprocessable message to the dead letter topic. Returns whether
    /// it is now safe to commit.
    async fn park(&self, message: &InboundMessage, reason: DeadLetterReason, detail: &str) -> bool {
        let Some(sink) = &self.dead_letters else {
            tracing::warn!(
                offset = message.offset,
                reason = reason.as_str(),
                "No dead letter topic configured, skipping without commit"
            );
            self.metrics.record_skipped(reason.as_str());
            return false;
        };

        match sink.publish(message, reason, detail).await {
            Ok(()) => {
                self.metrics.record_dlq_message(reason.as_str());
                true
            }
            Err(e) => {
                tracing::error!(
                    offset = message.offset,
                    error = %e,
                    "Dead letter publish failed, skipping without commit"
                );
                self.metrics.record_skipped("dead_letter_failed");
                false
            }
        }
    }

    async fn commit(&self, message: &InboundMessage) {
        match self.source.commit(message).await {
            Ok(()) => self.metrics.messages_committed.inc(),
            Err(e) => tracing::error!(
                partition = message.partition,
                offset = message.offset,
                error = %e,
                "Failed to commit message"
            ),
        }
    }
}

/// Exhausted store calls are retried again under the persist budget
fn persist_is_permanent(err: &StoreError) -> bool {
    !(err.is_transient() || matches!(err, StoreError::Exhausted { .. }))
}
