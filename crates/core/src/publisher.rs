use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::admission::retry::Backoff;
use crate::config::PublisherConfig;
use crate::consumer::worker::shutdown_requested;
use crate::domain::outcome::OutcomeEvent;
use crate::outbox::{InMemoryOutcomeOutbox, OutcomeOutbox, PendingDelivery};
use crate::store::StoreError;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("publisher `{publisher}` failed: {message}")]
pub struct PublishError {
    pub publisher: String,
    pub message: String,
}

impl PublishError {
    pub fn new(publisher: &str, message: impl Into<String>) -> Self {
        Self { publisher: publisher.to_string(), message: message.into() }
    }
}

#[async_trait]
pub trait OutcomePublisher: Send + Sync {
    fn name(&self) -> &str;

    async fn publish(&self, outcome: &OutcomeEvent) -> Result<(), PublishError>;
}

/// Emits each outcome as a structured log line for the analytics pipeline.
#[derive(Clone, Debug, Default)]
pub struct TracingOutcomePublisher;

#[async_trait]
impl OutcomePublisher for TracingOutcomePublisher {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn publish(&self, outcome: &OutcomeEvent) -> Result<(), PublishError> {
        info!(
            event_name = "admission.outcome.published",
            request_id = %outcome.request_id,
            employee_id = %outcome.employee_id,
            event_type = outcome.event_type.as_str(),
            decision = outcome.decision.as_str(),
            reason = outcome.reason.as_str(),
            decided_at = %outcome.decided_at.to_rfc3339(),
            "leave outcome"
        );
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryOutcomePublisher {
    outcomes: Arc<Mutex<Vec<OutcomeEvent>>>,
}

impl InMemoryOutcomePublisher {
    pub fn outcomes(&self) -> Vec<OutcomeEvent> {
        match self.outcomes.lock() {
            Ok(outcomes) => outcomes.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl OutcomePublisher for InMemoryOutcomePublisher {
    fn name(&self) -> &str {
        "memory"
    }

    async fn publish(&self, outcome: &OutcomeEvent) -> Result<(), PublishError> {
        match self.outcomes.lock() {
            Ok(mut outcomes) => outcomes.push(outcome.clone()),
            Err(poisoned) => poisoned.into_inner().push(outcome.clone()),
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublishRetryPolicy {
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl Default for PublishRetryPolicy {
    fn default() -> Self {
        Self { max_retries: 3, backoff: Backoff::new(100, 2_000) }
    }
}

impl From<&PublisherConfig> for PublishRetryPolicy {
    fn from(config: &PublisherConfig) -> Self {
        let base_ms = config.base_delay_ms;
        Self {
            max_retries: config.max_retries,
            backoff: Backoff::new(base_ms, base_ms.saturating_mul(20)),
        }
    }
}

impl PublishRetryPolicy {
    /// When the delivery that has already failed `attempt + 1` times is tried again.
    pub fn next_attempt_at(&self, now: DateTime<Utc>, attempt: u32) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.backoff.jittered(attempt))
            .unwrap_or_else(|_| chrono::Duration::zero());
        now + delay
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReport {
    pub delivered: Vec<String>,
    /// Publishers that refused the outcome; each now has a pending delivery.
    pub deferred: Vec<String>,
}

/// Offers every outcome to all publishers once. A publisher that refuses it
/// gets a pending delivery in the outbox, which [`OutboxRelay`] retries off
/// the partition worker.
#[derive(Clone)]
pub struct OutcomeFanout {
    publishers: Vec<Arc<dyn OutcomePublisher>>,
    policy: PublishRetryPolicy,
    outbox: Arc<dyn OutcomeOutbox>,
}

impl Default for OutcomeFanout {
    fn default() -> Self {
        Self::new(PublishRetryPolicy::default())
    }
}

impl OutcomeFanout {
    pub fn new(policy: PublishRetryPolicy) -> Self {
        Self { publishers: Vec::new(), policy, outbox: Arc::new(InMemoryOutcomeOutbox::default()) }
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn OutcomePublisher>) -> Self {
        self.publishers.push(publisher);
        self
    }

    pub fn with_outbox(mut self, outbox: Arc<dyn OutcomeOutbox>) -> Self {
        self.outbox = outbox;
        self
    }

    pub fn publisher_names(&self) -> Vec<String> {
        self.publishers.iter().map(|publisher| publisher.name().to_string()).collect()
    }

    pub fn outbox(&self) -> &Arc<dyn OutcomeOutbox> {
        &self.outbox
    }

    pub fn relay(&self, interval: Duration) -> OutboxRelay {
        OutboxRelay {
            publishers: self.publishers.clone(),
            outbox: self.outbox.clone(),
            policy: self.policy,
            interval,
            batch_size: RELAY_BATCH_SIZE,
        }
    }

    /// Fails only when a refused outcome could not be written to the outbox;
    /// the caller must then leave the event unacknowledged.
    pub async fn publish(&self, outcome: &OutcomeEvent) -> Result<PublishReport, StoreError> {
        let mut report = PublishReport::default();
        for publisher in &self.publishers {
            let name = publisher.name().to_string();
            let publish_error = match publisher.publish(outcome).await {
                Ok(()) => {
                    report.delivered.push(name);
                    continue;
                }
                Err(publish_error) => publish_error,
            };

            let now = Utc::now();
            self.outbox
                .enqueue(PendingDelivery::new(
                    outcome.clone(),
                    &name,
                    publish_error.to_string(),
                    now,
                    self.policy.next_attempt_at(now, 0),
                ))
                .await?;
            warn!(
                event_name = "publisher.delivery.deferred",
                publisher = %name,
                request_id = %outcome.request_id,
                employee_id = %outcome.employee_id,
                error = %publish_error,
                "outcome refused, queued for redelivery"
            );
            report.deferred.push(name);
        }
        Ok(report)
    }
}

const RELAY_BATCH_SIZE: u32 = 100;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayPass {
    pub delivered: u64,
    pub rescheduled: u64,
}

/// Background re-drive of the outbox. A delivery is retried with backoff
/// until its publisher accepts it; past `max_retries` it is reported as
/// overdue on every attempt but never dropped.
pub struct OutboxRelay {
    publishers: Vec<Arc<dyn OutcomePublisher>>,
    outbox: Arc<dyn OutcomeOutbox>,
    policy: PublishRetryPolicy,
    interval: Duration,
    batch_size: u32,
}

impl OutboxRelay {
    pub fn outbox(&self) -> &Arc<dyn OutcomeOutbox> {
        &self.outbox
    }

    pub async fn redrive(&self, now: DateTime<Utc>) -> Result<RelayPass, StoreError> {
        let mut pass = RelayPass::default();
        for delivery in self.outbox.due(now, self.batch_size).await? {
            let publisher =
                self.publishers.iter().find(|publisher| publisher.name() == delivery.publisher);
            let attempt = match publisher {
                Some(publisher) => publisher
                    .publish(&delivery.outcome)
                    .await
                    .map_err(|publish_error| publish_error.to_string()),
                None => Err(format!("publisher `{}` is not configured", delivery.publisher)),
            };

            match attempt {
                Ok(()) => {
                    self.outbox.complete(&delivery.id).await?;
                    pass.delivered += 1;
                    info!(
                        event_name = "publisher.delivery.redriven",
                        publisher = %delivery.publisher,
                        request_id = %delivery.outcome.request_id,
                        attempts = delivery.attempts + 1,
                        "queued outcome delivered"
                    );
                }
                Err(message) => {
                    let attempts = delivery.attempts.saturating_add(1);
                    let next_attempt_at = self.policy.next_attempt_at(now, delivery.attempts);
                    self.outbox.reschedule(&delivery.id, attempts, &message, next_attempt_at).await?;
                    pass.rescheduled += 1;
                    if attempts > self.policy.max_retries {
                        error!(
                            event_name = "publisher.delivery.overdue",
                            publisher = %delivery.publisher,
                            request_id = %delivery.outcome.request_id,
                            employee_id = %delivery.outcome.employee_id,
                            attempts,
                            error = %message,
                            "outcome still undelivered past the retry budget"
                        );
                    } else {
                        warn!(
                            event_name = "publisher.delivery.retry",
                            publisher = %delivery.publisher,
                            request_id = %delivery.outcome.request_id,
                            attempts,
                            error = %message,
                            "queued outcome refused again"
                        );
                    }
                }
            }
        }
        Ok(pass)
    }

    /// Re-drives due deliveries every `interval` until `shutdown` flips to `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> RelayPass {
        let mut total = RelayPass::default();
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.redrive(Utc::now()).await {
                Ok(pass) => {
                    total.delivered += pass.delivered;
                    total.rescheduled += pass.rescheduled;
                }
                Err(store_error) => warn!(
                    event_name = "publisher.relay.failed",
                    error = %store_error,
                    "outbox unavailable, will retry on the next tick"
                ),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }
        info!(
            event_name = "publisher.relay.stopped",
            delivered = total.delivered,
            rescheduled = total.rescheduled,
            "outbox relay stopped"
        );
        total
    }
}
