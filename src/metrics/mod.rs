// Private module declaration
mod server;

use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
};

// Re-export for public API
pub use server::start_metrics_server;

// ============================================================================
// Metrics Module - Prometheus metrics for observability
// ============================================================================
//
// Provides metrics for:
// - Stream consumption (consumed, committed, skipped by reason)
// - Order persistence latency
// - Retry attempts and outcomes per backoff profile
// - Cache hits and misses
// - Dead-lettered messages
//
// All metrics live in a private registry scraped via /metrics
// ============================================================================

/// Central metrics registry for the pipeline
pub struct Metrics {
    registry: Registry,

    // Consumer Metrics
    pub messages_consumed: IntCounter,
    pub messages_committed: IntCounter,
    pub messages_skipped: IntCounterVec,
    pub persist_duration: HistogramVec,

    // Retry Metrics
    pub retry_attempts_total: IntCounterVec,
    pub retry_success: IntCounterVec,
    pub retry_failure: IntCounterVec,

    // Cache Metrics
    pub cache_hits: IntCounter,
    pub cache_misses: IntCounter,

    // DLQ Metrics
    pub dlq_messages_total: IntCounter,
    pub dlq_messages_by_reason: IntCounterVec,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        // Consumer Metrics
        let messages_consumed = IntCounter::new(
            "orders_messages_consumed_total",
            "Messages read from the orders topic",
        )?;
        registry.register(Box::new(messages_consumed.clone()))?;

        let messages_committed = IntCounter::new(
            "orders_messages_committed_total",
            "Messages whose offset was committed",
        )?;
        registry.register(Box::new(messages_committed.clone()))?;

        let messages_skipped = IntCounterVec::new(
            Opts::new("orders_messages_skipped_total", "Messages left uncommitted"),
            &["reason"],
        )?;
        registry.register(Box::new(messages_skipped.clone()))?;

        let persist_duration = HistogramVec::new(
            HistogramOpts::new("orders_persist_duration_seconds", "Time to persist one order, retries included")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]),
            &["outcome"],
        )?;
        registry.register(Box::new(persist_duration.clone()))?;

        // Retry Metrics
        let retry_attempts_total = IntCounterVec::new(
            Opts::new("retry_attempts_total", "Total retry attempts"),
            &["operation", "attempt"],
        )?;
        registry.register(Box::new(retry_attempts_total.clone()))?;

        let retry_success = IntCounterVec::new(
            Opts::new("retry_success_total", "Retried operations that eventually succeeded"),
            &["operation"],
        )?;
        registry.register(Box::new(retry_success.clone()))?;

        let retry_failure = IntCounterVec::new(
            Opts::new("retry_failure_total", "Retried operations that gave up"),
            &["operation", "outcome"],
        )?;
        registry.register(Box::new(retry_failure.clone()))?;

        // Cache Metrics
        let cache_hits = IntCounter::new("order_cache_hits_total", "Order cache hits")?;
        registry.register(Box::new(cache_hits.clone()))?;

        let cache_misses = IntCounter::new(
            "order_cache_misses_total",
            "Order cache misses, expired entries included",
        )?;
        registry.register(Box::new(cache_misses.clone()))?;

        // DLQ Metrics
        let dlq_messages_total = IntCounter::new(
            "dlq_messages_total",
            "Total messages published to the dead letter topic",
        )?;
        registry.register(Box::new(dlq_messages_total.clone()))?;

        let dlq_messages_by_reason = IntCounterVec::new(
            Opts::new("dlq_messages_by_reason", "Dead-lettered messages by reason"),
            &["reason"],
        )?;
        registry.register(Box::new(dlq_messages_by_reason.clone()))?;

        Ok(Self {
            registry,
            messages_consumed,
            messages_committed,
            messages_skipped,
            persist_duration,
            retry_attempts_total,
            retry_success,
            retry_failure,
            cache_hits,
            cache_misses,
            dlq_messages_total,
            dlq_messages_by_reason,
        })
    }

    /// Get the Prometheus registry for exposing metrics via HTTP
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_skipped(&self, reason: &str) {
        self.messages_skipped.with_label_values(&[reason]).inc();
    }

    pub fn record_persist(&self, outcome: &str, duration_secs: f64) {
        self.persist_duration
            .with_label_values(&[outcome])
            .observe(duration_secs);
    }

    /// Helper to record retry attempt
    pub fn record_retry_attempt(&self, operation: &str, attempt: u32) {
        self.retry_attempts_total
            .with_label_values(&[operation, &attempt.to_string()])
            .inc();
    }

    /// `outcome` is one of `success`, `permanent`, `exhausted`, `cancelled`
    pub fn record_retry_outcome(&self, operation: &str, outcome: &str) {
        if outcome == "success" {
            self.retry_success.with_label_values(&[operation]).inc();
        } else {
            self.retry_failure
                .with_label_values(&[operation, outcome])
                .inc();
        }
    }

    pub fn record_cache_lookup(&self, hit: bool) {
        if hit {
            self.cache_hits.inc();
        } else {
            self.cache_misses.inc();
        }
    }

    /// Helper to record DLQ message
    pub fn record_dlq_message(&self, reason: &str) {
        self.dlq_messages_total.inc();
        self.dlq_messages_by_reason.with_label_values(&[reason]).inc();
    }
}
