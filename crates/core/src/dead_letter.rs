use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::store::StoreError;

/// Event parked for operator review, keyed by where it came from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: String,
    pub partition: Option<u32>,
    pub offset: Option<u64>,
    pub request_id: Option<String>,
    pub employee_id: Option<String>,
    pub payload: String,
    pub error_class: String,
    pub message: String,
    pub attempts: u32,
    pub first_failed_at: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl DeadLetter {
    pub fn stream_id(partition: u32, offset: u64) -> String {
        format!("p{partition}-o{offset}")
    }

    pub fn sync_id(request_id: &str, event_type: &str) -> String {
        format!("sync-{request_id}-{}", event_type.to_ascii_lowercase())
    }

    pub fn new(
        id: String,
        payload: impl Into<String>,
        error_class: &str,
        message: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            partition: None,
            offset: None,
            request_id: None,
            employee_id: None,
            payload: payload.into(),
            error_class: error_class.to_string(),
            message: message.into(),
            attempts: 1,
            first_failed_at: at,
            last_failed_at: at,
            resolved_at: None,
        }
    }

    pub fn at_position(mut self, partition: u32, offset: u64) -> Self {
        self.partition = Some(partition);
        self.offset = Some(offset);
        self
    }

    pub fn for_request(mut self, request_id: &str, employee_id: &str) -> Self {
        self.request_id = Some(request_id.to_string());
        self.employee_id = Some(employee_id.to_string());
        self
    }
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Inserts the letter, or bumps `attempts` and refreshes the error on an existing id.
    async fn record(&self, letter: DeadLetter) -> Result<(), StoreError>;

    /// Marks an unresolved letter as resolved. Unknown ids are ignored.
    async fn resolve(&self, id: &str, at: DateTime<Utc>) -> Result<bool, StoreError>;

    async fn list_unresolved(&self, limit: u32) -> Result<Vec<DeadLetter>, StoreError>;
}

#[derive(Default)]
pub struct InMemoryDeadLetterSink {
    letters: RwLock<BTreeMap<String, DeadLetter>>,
    failed_records: Mutex<u32>,
}

impl InMemoryDeadLetterSink {
    /// The next `count` writes fail as if the sink were down.
    pub fn fail_next_records(&self, count: u32) {
        match self.failed_records.lock() {
            Ok(mut remaining) => *remaining = count,
            Err(poisoned) => *poisoned.into_inner() = count,
        }
    }

    fn take_failure(&self) -> bool {
        let mut remaining = match self.failed_records.lock() {
            Ok(remaining) => remaining,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *remaining > 0 {
            *remaining -= 1;
            return true;
        }
        false
    }

    pub async fn get(&self, id: &str) -> Option<DeadLetter> {
        self.letters.read().await.get(id).cloned()
    }

    pub async fn all(&self) -> Vec<DeadLetter> {
        self.letters.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterSink {
    async fn record(&self, letter: DeadLetter) -> Result<(), StoreError> {
        if self.take_failure() {
            return Err(StoreError::Unavailable("dead-letter sink offline".to_string()));
        }
        let mut letters = self.letters.write().await;
        match letters.get_mut(&letter.id) {
            Some(existing) => {
                existing.attempts = existing.attempts.saturating_add(1);
                existing.error_class = letter.error_class;
                existing.message = letter.message;
                existing.last_failed_at = letter.last_failed_at;
                existing.resolved_at = None;
            }
            None => {
                letters.insert(letter.id.clone(), letter);
            }
        }
        Ok(())
    }

    async fn resolve(&self, id: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut letters = self.letters.write().await;
        match letters.get_mut(id) {
            Some(letter) if letter.resolved_at.is_none() => {
                letter.resolved_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_unresolved(&self, limit: u32) -> Result<Vec<DeadLetter>, StoreError> {
        let letters = self.letters.read().await;
        let mut unresolved: Vec<DeadLetter> =
            letters.values().filter(|letter| letter.resolved_at.is_none()).cloned().collect();
        unresolved.sort_by(|left, right| left.first_failed_at.cmp(&right.first_failed_at));
        unresolved.truncate(limit as usize);
        Ok(unresolved)
    }
}
