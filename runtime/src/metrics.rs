//! Prometheus metrics for the message connector.
//!
//! Every stage of the pipeline reports through a small recorder type:
//! - [`FlowMetrics`]: inbound messages, discards, decode failures
//! - [`LockMetrics`]: lock waits, skips, interruptions
//! - [`AggregatorMetrics`]: group releases and dispatch failures
//! - [`AdviceMetrics`]: duplicates and subscription-cancelled clean-ups
//! - [`RetryMetrics`]: dispatch retries
//! - [`DeadLetterMetrics`]: dead-letter queue size
//!
//! Recording is a no-op until a recorder is installed, so tests and embedded
//! uses do not need [`MetricsExporter`].
//!
//! # Example
//!
//! ```rust,no_run
//! use message_connector_runtime::metrics::MetricsExporter;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut exporter = MetricsExporter::new();
//! exporter.install()?;
//!
//! // Later, e.g. from a /metrics handler:
//! let text = exporter.render().unwrap_or_default();
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus recorder installation and rendering.
#[derive(Default)]
pub struct MetricsExporter {
    handle: Option<PrometheusHandle>,
}

impl MetricsExporter {
    /// Create an exporter that is not installed yet.
    #[must_use]
    pub const fn new() -> Self {
        Self { handle: None }
    }

    /// Describe the connector metrics and install the global recorder.
    ///
    /// Installing twice in one process is tolerated: the second call logs a
    /// warning and leaves this exporter without a handle.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or installed.
    pub fn install(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0, 30.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!("Prometheus recorder installed");
                Ok(())
            }
            Err(BuildError::FailedToSetGlobalRecorder(_)) => {
                tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                Ok(())
            }
            Err(e) => Err(MetricsError::Install(e.to_string())),
        }
    }

    /// Handle to the installed recorder.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus text format.
    ///
    /// Returns `None` if this exporter did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    // Flow
    describe_counter!(
        "message_connector_messages_received_total",
        "Total number of messages entering the connector flow"
    );
    describe_counter!(
        "message_connector_messages_discarded_total",
        "Messages without an event type, sent to the error channel"
    );
    describe_counter!(
        "message_connector_decode_errors_total",
        "Messages whose payload could not be decoded"
    );
    describe_counter!(
        "message_connector_correlation_errors_total",
        "Messages that could not be correlated"
    );
    describe_histogram!(
        "message_connector_handle_duration_seconds",
        "Time spent handling a decoded message"
    );

    // Locks
    describe_histogram!(
        "message_connector_lock_wait_duration_seconds",
        "Time spent waiting for a correlation lock"
    );
    describe_counter!(
        "message_connector_lock_unavailable_total",
        "Operations skipped because the lock was not acquired in time"
    );
    describe_counter!(
        "message_connector_lock_interrupted_total",
        "Lock waits ended by an interrupt"
    );

    // Aggregation
    describe_counter!(
        "message_connector_messages_aggregated_total",
        "Messages appended to a message group"
    );
    describe_counter!(
        "message_connector_groups_released_total",
        "Outputs released from message groups"
    );
    describe_counter!(
        "message_connector_dispatch_failures_total",
        "Released outputs that could not be dispatched"
    );
    describe_gauge!(
        "message_connector_message_groups",
        "Message groups currently pending"
    );

    // Advices
    describe_counter!(
        "message_connector_duplicates_total",
        "Redelivered messages dropped by the idempotent receiver"
    );
    describe_counter!(
        "message_connector_subscription_cancelled_removed_total",
        "Start-message registrations removed after a subscription was cancelled"
    );

    // Retry
    describe_counter!("message_connector_retry_attempts_total", "Dispatch retry attempts");
    describe_counter!(
        "message_connector_retry_exhausted_total",
        "Dispatches that failed after all retries"
    );

    // Dead letters
    describe_gauge!(
        "message_connector_dead_letter_queue_size",
        "Messages currently held in the dead-letter queue"
    );
    describe_counter!(
        "message_connector_dead_letters_dropped_total",
        "Dead letters dropped because the queue was full"
    );
}

/// Flow metrics recorder.
pub struct FlowMetrics;

impl FlowMetrics {
    /// Record a message entering the flow.
    pub fn record_received() {
        counter!("message_connector_messages_received_total").increment(1);
    }

    /// Record a message dropped by the event-type filter.
    pub fn record_discarded() {
        counter!("message_connector_messages_discarded_total").increment(1);
    }

    /// Record a payload decode failure.
    pub fn record_decode_error() {
        counter!("message_connector_decode_errors_total").increment(1);
    }

    /// Record a correlation failure.
    pub fn record_correlation_error() {
        counter!("message_connector_correlation_errors_total").increment(1);
    }

    /// Record the time the handler chain took.
    pub fn record_handled(duration: Duration) {
        histogram!("message_connector_handle_duration_seconds").record(duration.as_secs_f64());
    }
}

/// Lock metrics recorder.
pub struct LockMetrics;

impl LockMetrics {
    /// Record an acquired lock and how long it took.
    pub fn record_acquired(waited: Duration) {
        histogram!("message_connector_lock_wait_duration_seconds").record(waited.as_secs_f64());
    }

    /// Record an operation skipped for want of the lock.
    pub fn record_unavailable() {
        counter!("message_connector_lock_unavailable_total").increment(1);
    }

    /// Record an interrupted wait.
    pub fn record_interrupted() {
        counter!("message_connector_lock_interrupted_total").increment(1);
    }
}

/// Aggregator metrics recorder.
pub struct AggregatorMetrics;

impl AggregatorMetrics {
    /// Record a message appended to its group.
    pub fn record_aggregated(event_type: &str) {
        counter!("message_connector_messages_aggregated_total", "event_type" => event_type.to_string())
            .increment(1);
    }

    /// Record a released output.
    pub fn record_released(payload_type: &'static str) {
        counter!("message_connector_groups_released_total", "payload_type" => payload_type).increment(1);
    }

    /// Record a dispatch failure.
    pub fn record_dispatch_failure() {
        counter!("message_connector_dispatch_failures_total").increment(1);
    }

    /// Record the number of pending groups.
    #[allow(clippy::cast_precision_loss)] // Group counts stay far below 2^52
    pub fn record_group_count(count: usize) {
        gauge!("message_connector_message_groups").set(count as f64);
    }
}

/// Advice metrics recorder.
pub struct AdviceMetrics;

impl AdviceMetrics {
    /// Record a duplicate dropped by the idempotent receiver.
    pub fn record_duplicate() {
        counter!("message_connector_duplicates_total").increment(1);
    }

    /// Record start-message registrations removed from a group.
    pub fn record_subscription_cancelled(removed: usize) {
        counter!("message_connector_subscription_cancelled_removed_total").increment(removed as u64);
    }
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a retry attempt.
    pub fn record_attempt() {
        counter!("message_connector_retry_attempts_total").increment(1);
    }

    /// Record exhausted retries.
    pub fn record_exhausted() {
        counter!("message_connector_retry_exhausted_total").increment(1);
    }
}

/// Dead-letter metrics recorder.
pub struct DeadLetterMetrics;

impl DeadLetterMetrics {
    /// Record the current queue size.
    #[allow(clippy::cast_precision_loss)] // Queue sizes stay far below 2^52
    pub fn record_size(size: usize) {
        gauge!("message_connector_dead_letter_queue_size").set(size as f64);
    }

    /// Record a dead letter dropped because the queue was full.
    pub fn record_dropped() {
        counter!("message_connector_dead_letters_dropped_total").increment(1);
    }
}
