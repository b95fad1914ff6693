//! Message connector service.
//!
//! Consumes BPMN message events from Redpanda, aggregates them per
//! correlation key and publishes released commands back to Redpanda.
//!
//! Configuration is read from the file named by `MESSAGE_CONNECTOR_CONFIG`
//! (optional) and `MESSAGE_CONNECTOR_*` environment overrides.
//!
//! With `MESSAGE_CONNECTOR_POSTGRES_URL` set, message groups and correlation
//! locks are kept in `PostgreSQL`: pending messages survive a restart and
//! several instances may share the consumer group. Without it they live in
//! memory and only a single instance may run.
//!
//! ```bash
//! MESSAGE_CONNECTOR_BROKERS=localhost:9092 cargo run -p message-connector-redpanda
//! ```

use anyhow::Context;
use futures::StreamExt;
use message_connector_core::{LockRegistry, MessageChannel, MessageGroupStore};
use message_connector_postgres::{PostgresLockRegistry, PostgresMessageGroupStore};
use message_connector_redpanda::{RedpandaInbound, RedpandaMessageChannel};
use message_connector_runtime::flow::{FlowError, MessageConnectorFlow};
use message_connector_runtime::lock::{DefaultLockRegistry, InterruptSignal, LockTemplate};
use message_connector_runtime::metrics::MetricsExporter;
use message_connector_runtime::{ConnectorConfig, DeadLetterChannel, InMemoryMessageGroupStore};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ConnectorConfig::from_env().context("Invalid connector configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.observability.log_filter.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        brokers = %config.transport.brokers,
        input_topic = %config.transport.input_topic,
        output_topic = %config.transport.output_topic,
        consumer_group = %config.transport.consumer_group,
        concurrency = config.transport.concurrency,
        "Starting message connector"
    );

    let mut metrics = MetricsExporter::new();
    if config.observability.metrics_enabled {
        metrics.install().context("Failed to install metrics recorder")?;
    }

    let output: Arc<dyn MessageChannel> = Arc::new(
        RedpandaMessageChannel::builder()
            .brokers(&config.transport.brokers)
            .default_topic(&config.transport.output_topic)
            .headers(config.headers.clone())
            .build()?,
    );
    let errors = error_channel(&config)?;

    let (store, registry) = storage(&config).await?;
    let interrupt = InterruptSignal::new();
    let locks = LockTemplate::with_interrupt(registry, interrupt.clone());
    let flow = Arc::new(
        MessageConnectorFlow::builder(output)
            .config(&config)
            .group_store(store)
            .lock_template(locks)
            .error_channel(Arc::clone(&errors))
            .build(),
    );

    let mut consumers = JoinSet::new();
    for consumer in 0..config.transport.concurrency {
        let inbound = RedpandaInbound::builder()
            .brokers(&config.transport.brokers)
            .topic(&config.transport.input_topic)
            .consumer_group(&config.transport.consumer_group)
            .headers(config.headers.clone())
            .error_channel(Arc::clone(&errors))
            .build()?;
        consumers.spawn(consume(consumer, inbound, Arc::clone(&flow)));
    }

    tokio::select! {
        () = shutdown_signal() => {}
        Some(finished) = consumers.join_next() => {
            match finished {
                Ok(Ok(())) => warn!("Consumer stream ended"),
                Ok(Err(e)) => error!(error = %e, "Consumer failed"),
                Err(e) => error!(error = %e, "Consumer task panicked"),
            }
        }
    }

    info!("Shutting down");
    interrupt.interrupt();
    consumers.shutdown().await;

    if let Some(rendered) = metrics.render() {
        tracing::debug!(metrics = %rendered, "Final metrics");
    }
    Ok(())
}

/// `PostgreSQL` group store and advisory locks when configured, otherwise in-memory ones.
async fn storage(config: &ConnectorConfig) -> anyhow::Result<(Arc<dyn MessageGroupStore>, Arc<dyn LockRegistry>)> {
    let Some(url) = &config.store.postgres_url else {
        warn!("No PostgreSQL configured, message groups are kept in memory; run a single instance only");
        return Ok((
            Arc::new(InMemoryMessageGroupStore::new()),
            Arc::new(DefaultLockRegistry::new()),
        ));
    };

    let pool = message_connector_postgres::connect(url, config.store.max_connections)
        .await
        .context("Failed to connect to PostgreSQL")?;
    let store = PostgresMessageGroupStore::from_pool(pool.clone());
    store.migrate().await.context("Failed to prepare message group tables")?;
    let registry = PostgresLockRegistry::new(pool).with_poll_interval(config.store.lock_poll_interval());

    info!(max_connections = config.store.max_connections, "Message groups and locks kept in PostgreSQL");
    Ok((Arc::new(store), Arc::new(registry)))
}

/// Error topic when configured, otherwise a bounded in-memory queue.
fn error_channel(config: &ConnectorConfig) -> anyhow::Result<Arc<dyn MessageChannel>> {
    let Some(topic) = &config.transport.error_topic else {
        warn!("No error topic configured, rejected messages are kept in memory");
        return Ok(Arc::new(
            DeadLetterChannel::new(config.dead_letter.max_size).with_headers(&config.headers),
        ));
    };

    Ok(Arc::new(
        RedpandaMessageChannel::builder()
            .brokers(&config.transport.brokers)
            .default_topic(topic)
            .route_by_destination(false)
            .headers(config.headers.clone())
            .build()?,
    ))
}

/// Feed one consumer's deliveries through the flow.
///
/// Messages the flow rejected were parked on the error channel and are
/// acknowledged; everything else failing is handed out again.
async fn consume(
    consumer: usize,
    inbound: RedpandaInbound,
    flow: Arc<MessageConnectorFlow>,
) -> anyhow::Result<()> {
    let mut deliveries = inbound.subscribe()?;

    while let Some(delivery) = deliveries.next().await {
        let delivery = match delivery {
            Ok(delivery) => delivery,
            Err(e) => {
                warn!(consumer, error = %e, "Transport error");
                continue;
            }
        };

        let (message, ack) = delivery.into_parts();
        let message_id = message.id();
        match flow.send(message).await {
            Ok(outcome) => {
                tracing::trace!(consumer, message_id = %message_id, ?outcome, "Message processed");
                ack.ack();
            }
            Err(FlowError::Decode { .. } | FlowError::Correlation(_)) => ack.ack(),
            Err(e) => {
                warn!(consumer, message_id = %message_id, error = %e, "Processing failed, redelivering");
                ack.redeliver();
            }
        }
    }

    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C signal"),
        () = terminate => info!("Received SIGTERM signal"),
    }
}
