mod api;
mod bootstrap;
mod health;
mod webhook;

use std::time::Duration;

use anyhow::Result;
use leavegate_core::config::{AppConfig, LoadOptions};
use tokio::sync::watch;

use crate::health::{ConsumerState, HealthState};

fn init_logging(config: &AppConfig) {
    use leavegate_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    // Logging comes up before bootstrap so its events are captured.
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    let initial_consumer_state =
        if app.consumer.is_some() { ConsumerState::Running } else { ConsumerState::Disabled };
    let (consumer_state_tx, consumer_state_rx) = watch::channel(initial_consumer_state);
    let health_state = HealthState {
        db_pool: app.db_pool.clone(),
        ledger: app.ledger.clone(),
        dead_letters: app.dead_letters.clone(),
        outbox: app.relay.outbox().clone(),
        consumer: consumer_state_rx,
    };
    let router = api::router(app.service.clone()).merge(health::router(health_state));

    let mut http_shutdown = shutdown_rx.clone();
    let http = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = http_shutdown.wait_for(|stop| *stop).await;
            })
            .await
    });
    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        bind_address = %address,
        "leavegate-server listening"
    );

    let relay = tokio::spawn(app.relay.run(shutdown_rx.clone()));

    let consumer = app.consumer.map(|consumer| {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let summary = consumer.run(shutdown).await;
            let _ = consumer_state_tx.send(ConsumerState::from(&summary));
            summary
        })
    });

    wait_for_shutdown().await?;
    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        "leavegate-server stopping"
    );
    let _ = shutdown_tx.send(true);

    let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);
    if let Some(consumer) = consumer {
        match tokio::time::timeout(grace, consumer).await {
            Ok(Ok(summary)) => tracing::info!(
                event_name = "consumer.run.finished",
                correlation_id = "shutdown",
                received = summary.received,
                applied = summary.applied,
                dead_lettered = summary.dead_lettered,
                halted_partitions = ?summary.halted_partitions(),
                "replay consumer drained"
            ),
            Ok(Err(error)) => tracing::error!(
                event_name = "consumer.run.panicked",
                correlation_id = "shutdown",
                error = %error,
                "replay consumer task failed"
            ),
            Err(_) => tracing::warn!(
                event_name = "consumer.run.shutdown_timeout",
                correlation_id = "shutdown",
                grace_secs = grace.as_secs(),
                "replay consumer did not stop within the grace period"
            ),
        }
    }

    match tokio::time::timeout(grace, relay).await {
        Ok(Ok(pass)) => tracing::info!(
            event_name = "publisher.relay.finished",
            correlation_id = "shutdown",
            delivered = pass.delivered,
            rescheduled = pass.rescheduled,
            "outbox relay stopped"
        ),
        Ok(Err(error)) => tracing::error!(
            event_name = "publisher.relay.panicked",
            correlation_id = "shutdown",
            error = %error,
            "outbox relay task failed"
        ),
        Err(_) => tracing::warn!(
            event_name = "publisher.relay.shutdown_timeout",
            correlation_id = "shutdown",
            grace_secs = grace.as_secs(),
            "outbox relay did not stop within the grace period"
        ),
    }

    match tokio::time::timeout(grace, http).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(error))) => tracing::error!(
            event_name = "system.server.error",
            correlation_id = "shutdown",
            error = %error,
            "http server terminated with an error"
        ),
        Ok(Err(error)) => tracing::error!(
            event_name = "system.server.error",
            correlation_id = "shutdown",
            error = %error,
            "http server task failed"
        ),
        Err(_) => tracing::warn!(
            event_name = "system.server.shutdown_timeout",
            correlation_id = "shutdown",
            grace_secs = grace.as_secs(),
            "http server did not stop within the grace period"
        ),
    }

    app.db_pool.close().await;
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
