use std::sync::Arc;
use std::time::Duration;

use leavegate_core::config::{AppConfig, ConfigError, LoadOptions};
use leavegate_core::consumer::SourceError;
use leavegate_core::publisher::TracingOutcomePublisher;
use leavegate_core::{
    AdmissionConsumer, AdmissionCoordinator, AdmissionLimits, AdmissionService, AdmissionSettings,
    CapacityPolicy, ConsumerSettings, DeadLetterSink, IdempotencyLedger, OutboxRelay,
    OutcomeFanout, OutcomeOutbox, PublishRetryPolicy, ReplayEventSource,
};
use leavegate_db::{
    connect_with_config, migrations, DbPool, SqlDeadLetterSink, SqlIdempotencyLedger,
    SqlOutcomeOutbox, SqlStateStore,
};
use thiserror::Error;
use tracing::info;

use crate::webhook::WebhookOutcomePublisher;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub service: Arc<AdmissionService>,
    pub ledger: Arc<dyn IdempotencyLedger>,
    pub dead_letters: Arc<dyn DeadLetterSink>,
    /// Re-offers outcomes a publisher refused; spawned next to the server.
    pub relay: OutboxRelay,
    /// Present when `consumer.replay_path` points at an event file.
    pub consumer: Option<AdmissionConsumer>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("event source unavailable: {0}")]
    EventSource(#[source] SourceError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool =
        connect_with_config(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let store = Arc::new(SqlStateStore::new(db_pool.clone()));
    let ledger: Arc<dyn IdempotencyLedger> = Arc::new(SqlIdempotencyLedger::new(db_pool.clone()));
    let dead_letters: Arc<dyn DeadLetterSink> = Arc::new(SqlDeadLetterSink::new(db_pool.clone()));
    let outbox: Arc<dyn OutcomeOutbox> = Arc::new(SqlOutcomeOutbox::new(db_pool.clone()));
    let limits = AdmissionLimits::from(&config.admission);

    let fanout = outcome_fanout(&config).with_outbox(outbox);
    let relay = fanout.relay(Duration::from_millis(config.publisher.relay_interval_ms));
    info!(
        event_name = "system.bootstrap.publishers_configured",
        correlation_id = "bootstrap",
        publishers = ?fanout.publisher_names(),
        relay_interval_ms = config.publisher.relay_interval_ms,
        "outcome publishers configured"
    );

    let coordinator = Arc::new(AdmissionCoordinator::new(
        store,
        ledger.clone(),
        Arc::new(CapacityPolicy::new(limits.clone())),
        fanout,
        AdmissionSettings::from(&config.admission),
    ));
    let service =
        Arc::new(AdmissionService::new(coordinator.clone(), dead_letters.clone(), limits));

    let consumer = match &config.consumer.replay_path {
        Some(path) => {
            let source = ReplayEventSource::from_path(path, config.consumer.partitions)
                .await
                .map_err(BootstrapError::EventSource)?;
            info!(
                event_name = "system.bootstrap.replay_source_loaded",
                correlation_id = "bootstrap",
                path = %path.display(),
                records = source.len(),
                "replay event source loaded"
            );
            Some(AdmissionConsumer::new(
                coordinator,
                Arc::new(source),
                dead_letters.clone(),
                ConsumerSettings::from(&config),
            ))
        }
        None => None,
    };

    Ok(Application { config, db_pool, service, ledger, dead_letters, relay, consumer })
}

fn outcome_fanout(config: &AppConfig) -> OutcomeFanout {
    let fanout = OutcomeFanout::new(PublishRetryPolicy::from(&config.publisher))
        .with_publisher(Arc::new(TracingOutcomePublisher));
    match WebhookOutcomePublisher::from_config(&config.publisher) {
        Some(webhook) => fanout.with_publisher(Arc::new(webhook)),
        None => fanout,
    }
}
