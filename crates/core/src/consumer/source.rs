use std::collections::BTreeSet;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("event source read failed: {0}")]
    Receive(String),
    #[error("event source ack failed: {0}")]
    Acknowledge(String),
    #[error("replay input could not be loaded: {0}")]
    Load(String),
}

/// One record of the partitioned event log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRecord {
    pub partition: u32,
    pub offset: u64,
    /// Partition key. Always the employee id for leave events.
    pub key: String,
    pub payload: Vec<u8>,
}

impl StreamRecord {
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Stable partition for a key, independent of process or platform.
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    if partitions <= 1 {
        return 0;
    }
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0_u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % u64::from(partitions)) as u32
}

#[async_trait]
pub trait EventSource: Send + Sync {
    /// Next record to deliver, or `None` once a finite source is drained.
    async fn next_record(&self) -> Result<Option<StreamRecord>, SourceError>;

    async fn acknowledge(&self, record: &StreamRecord) -> Result<(), SourceError>;
}

#[derive(Default)]
struct ReplayState {
    cursor: usize,
    acknowledged: BTreeSet<(u32, u64)>,
}

/// Newline-delimited JSON events replayed as a partitioned stream.
///
/// Acknowledgements are tracked per `(partition, offset)`; [`Self::rewind`]
/// starts a new delivery pass over everything still unacknowledged, the way a
/// broker redelivers after a consumer restart.
pub struct ReplayEventSource {
    records: Vec<StreamRecord>,
    state: Mutex<ReplayState>,
}

#[derive(Deserialize)]
struct PartitionKey {
    #[serde(default)]
    employee_id: Option<String>,
}

impl ReplayEventSource {
    pub fn new(records: Vec<StreamRecord>) -> Self {
        Self { records, state: Mutex::new(ReplayState::default()) }
    }

    pub fn from_json_lines(input: &str, partitions: u32) -> Self {
        let partitions = partitions.max(1);
        let mut next_offsets = vec![0_u64; partitions as usize];
        let records = input
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| {
                // Unparseable lines still flow through so they get dead-lettered.
                let key = serde_json::from_str::<PartitionKey>(line)
                    .ok()
                    .and_then(|key| key.employee_id)
                    .unwrap_or_default();
                let partition = partition_for(&key, partitions);
                let offset = next_offsets[partition as usize];
                next_offsets[partition as usize] += 1;
                StreamRecord { partition, offset, key, payload: line.as_bytes().to_vec() }
            })
            .collect();
        Self::new(records)
    }

    pub async fn from_path(path: &Path, partitions: u32) -> Result<Self, SourceError> {
        let input = tokio::fs::read_to_string(path)
            .await
            .map_err(|error| SourceError::Load(format!("{}: {error}", path.display())))?;
        Ok(Self::from_json_lines(&input, partitions))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub async fn rewind(&self) {
        self.state.lock().await.cursor = 0;
    }

    pub async fn unacknowledged(&self) -> Vec<StreamRecord> {
        let state = self.state.lock().await;
        self.records
            .iter()
            .filter(|record| !state.acknowledged.contains(&(record.partition, record.offset)))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventSource for ReplayEventSource {
    async fn next_record(&self) -> Result<Option<StreamRecord>, SourceError> {
        let mut state = self.state.lock().await;
        while let Some(record) = self.records.get(state.cursor) {
            state.cursor += 1;
            if !state.acknowledged.contains(&(record.partition, record.offset)) {
                return Ok(Some(record.clone()));
            }
        }
        Ok(None)
    }

    async fn acknowledge(&self, record: &StreamRecord) -> Result<(), SourceError> {
        self.state.lock().await.acknowledged.insert((record.partition, record.offset));
        Ok(())
    }
}
