//! Outcomes a publisher has not acknowledged yet.
//!
//! A delivery is keyed by `(request_id, event_type, publisher)` and stays in
//! the outbox until that publisher accepts it, so a committed decision reaches
//! every publisher at least once even across restarts.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::domain::outcome::OutcomeEvent;
use crate::store::StoreError;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingDelivery {
    pub id: String,
    pub publisher: String,
    pub outcome: OutcomeEvent,
    pub attempts: u32,
    pub last_error: String,
    pub next_attempt_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl PendingDelivery {
    pub fn id_for(outcome: &OutcomeEvent, publisher: &str) -> String {
        format!("{}:{}:{publisher}", outcome.request_id, outcome.event_type.as_str())
    }

    pub fn new(
        outcome: OutcomeEvent,
        publisher: &str,
        last_error: impl Into<String>,
        now: DateTime<Utc>,
        next_attempt_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Self::id_for(&outcome, publisher),
            publisher: publisher.to_string(),
            outcome,
            attempts: 1,
            last_error: last_error.into(),
            next_attempt_at,
            created_at: now,
        }
    }
}

#[async_trait]
pub trait OutcomeOutbox: Send + Sync {
    /// Inserts the delivery. An existing id keeps its attempts and takes the
    /// new error and schedule.
    async fn enqueue(&self, delivery: PendingDelivery) -> Result<(), StoreError>;

    /// Deliveries whose `next_attempt_at` has passed, oldest schedule first.
    async fn due(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<PendingDelivery>, StoreError>;

    async fn reschedule(
        &self,
        id: &str,
        attempts: u32,
        last_error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Removes a delivered entry. Unknown ids return `false`.
    async fn complete(&self, id: &str) -> Result<bool, StoreError>;

    async fn pending_count(&self) -> Result<u64, StoreError>;
}

#[derive(Default)]
pub struct InMemoryOutcomeOutbox {
    deliveries: RwLock<BTreeMap<String, PendingDelivery>>,
    failed_enqueues: Mutex<u32>,
}

impl InMemoryOutcomeOutbox {
    /// The next `count` enqueues fail as if the store were down.
    pub fn fail_next_enqueues(&self, count: u32) {
        match self.failed_enqueues.lock() {
            Ok(mut remaining) => *remaining = count,
            Err(poisoned) => *poisoned.into_inner() = count,
        }
    }

    pub async fn get(&self, id: &str) -> Option<PendingDelivery> {
        self.deliveries.read().await.get(id).cloned()
    }

    pub async fn all(&self) -> Vec<PendingDelivery> {
        self.deliveries.read().await.values().cloned().collect()
    }

    fn take_failure(&self) -> bool {
        let mut remaining = match self.failed_enqueues.lock() {
            Ok(remaining) => remaining,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *remaining > 0 {
            *remaining -= 1;
            return true;
        }
        false
    }
}

#[async_trait]
impl OutcomeOutbox for InMemoryOutcomeOutbox {
    async fn enqueue(&self, delivery: PendingDelivery) -> Result<(), StoreError> {
        if self.take_failure() {
            return Err(StoreError::Unavailable("outbox offline".to_string()));
        }
        let mut deliveries = self.deliveries.write().await;
        match deliveries.get_mut(&delivery.id) {
            Some(existing) => {
                existing.last_error = delivery.last_error;
                existing.next_attempt_at = delivery.next_attempt_at;
            }
            None => {
                deliveries.insert(delivery.id.clone(), delivery);
            }
        }
        Ok(())
    }

    async fn due(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<PendingDelivery>, StoreError> {
        let deliveries = self.deliveries.read().await;
        let mut due: Vec<PendingDelivery> = deliveries
            .values()
            .filter(|delivery| delivery.next_attempt_at <= now)
            .cloned()
            .collect();
        due.sort_by(|left, right| {
            left.next_attempt_at.cmp(&right.next_attempt_at).then_with(|| left.id.cmp(&right.id))
        });
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn reschedule(
        &self,
        id: &str,
        attempts: u32,
        last_error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if let Some(delivery) = self.deliveries.write().await.get_mut(id) {
            delivery.attempts = attempts;
            delivery.last_error = last_error.to_string();
            delivery.next_attempt_at = next_attempt_at;
        }
        Ok(())
    }

    async fn complete(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.deliveries.write().await.remove(id).is_some())
    }

    async fn pending_count(&self) -> Result<u64, StoreError> {
        Ok(self.deliveries.read().await.len() as u64)
    }
}
