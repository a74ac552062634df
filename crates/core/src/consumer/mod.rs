//! Partition-parallel consumer over the leave event log.
//!
//! A single dispatcher reads the source and routes each record to the worker
//! owning its partition, so events of one employee are applied in stream
//! order while different partitions proceed concurrently.

pub mod source;
pub mod worker;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

pub use source::{partition_for, EventSource, ReplayEventSource, SourceError, StreamRecord};
pub use worker::{PartitionWorker, WorkerExit, WorkerRetry};

use crate::admission::{AdmissionCoordinator, Backoff, HandleDisposition};
use crate::config::AppConfig;
use crate::dead_letter::DeadLetterSink;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConsumerSettings {
    pub partitions: u32,
    pub channel_capacity: usize,
    pub retry: WorkerRetry,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            partitions: 4,
            channel_capacity: 64,
            retry: WorkerRetry { limit: 20, backoff: Backoff::default() },
        }
    }
}

impl From<&AppConfig> for ConsumerSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            partitions: config.consumer.partitions.max(1),
            channel_capacity: config.consumer.channel_capacity.max(1) as usize,
            retry: WorkerRetry {
                limit: config.consumer.transient_retry_limit,
                backoff: Backoff::new(config.admission.backoff_base_ms, config.admission.backoff_max_ms),
            },
        }
    }
}

#[derive(Debug, Default)]
pub struct ConsumerStats {
    received: AtomicU64,
    applied: AtomicU64,
    replayed: AtomicU64,
    reconciled: AtomicU64,
    dead_lettered: AtomicU64,
    retries: AtomicU64,
    acknowledged: AtomicU64,
    undelivered: AtomicU64,
}

impl ConsumerStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_disposition(&self, disposition: HandleDisposition) {
        match disposition {
            HandleDisposition::Applied { .. } => Self::bump(&self.applied),
            HandleDisposition::Replayed => Self::bump(&self.replayed),
            HandleDisposition::Reconciled => Self::bump(&self.reconciled),
        }
    }

    pub(crate) fn record_dead_letter(&self) {
        Self::bump(&self.dead_lettered);
    }

    pub(crate) fn record_retry(&self) {
        Self::bump(&self.retries);
    }

    pub(crate) fn record_ack(&self) {
        Self::bump(&self.acknowledged);
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionReport {
    pub partition: u32,
    pub exit: WorkerExit,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerSummary {
    pub received: u64,
    pub applied: u64,
    pub replayed: u64,
    pub reconciled: u64,
    pub dead_lettered: u64,
    pub retries: u64,
    pub acknowledged: u64,
    /// Records routed to a partition that had already stopped.
    pub undelivered: u64,
    pub partitions: Vec<PartitionReport>,
    pub source_error: Option<String>,
}

impl ConsumerSummary {
    pub fn halted_partitions(&self) -> Vec<u32> {
        self.partitions
            .iter()
            .filter(|report| matches!(report.exit, WorkerExit::Halted { .. } | WorkerExit::Stalled { .. }))
            .map(|report| report.partition)
            .collect()
    }
}

pub struct AdmissionConsumer {
    coordinator: Arc<AdmissionCoordinator>,
    source: Arc<dyn EventSource>,
    dead_letters: Arc<dyn DeadLetterSink>,
    settings: ConsumerSettings,
}

impl AdmissionConsumer {
    pub fn new(
        coordinator: Arc<AdmissionCoordinator>,
        source: Arc<dyn EventSource>,
        dead_letters: Arc<dyn DeadLetterSink>,
        settings: ConsumerSettings,
    ) -> Self {
        Self { coordinator, source, dead_letters, settings }
    }

    /// Runs until the source is drained or `shutdown` flips to `true`.
    /// Workers stop between events, never during a commit.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> ConsumerSummary {
        let stats = Arc::new(ConsumerStats::default());
        let partitions = self.settings.partitions.max(1);
        let mut senders = Vec::with_capacity(partitions as usize);
        let mut workers: Vec<(u32, JoinHandle<WorkerExit>)> = Vec::with_capacity(partitions as usize);

        for partition in 0..partitions {
            let (sender, receiver) = mpsc::channel(self.settings.channel_capacity.max(1));
            let worker = PartitionWorker::new(
                partition,
                self.coordinator.clone(),
                self.source.clone(),
                self.dead_letters.clone(),
                stats.clone(),
                self.settings.retry,
            );
            workers.push((partition, tokio::spawn(worker.run(receiver, shutdown.clone()))));
            senders.push(sender);
        }
        info!(event_name = "consumer.started", partitions, "admission consumer started");

        let source_error = self.dispatch(&senders, &stats, &mut shutdown).await;
        drop(senders);

        let mut reports = Vec::with_capacity(workers.len());
        for (partition, handle) in workers {
            let exit = match handle.await {
                Ok(exit) => exit,
                Err(join_error) => {
                    error!(
                        event_name = "consumer.partition.crashed",
                        partition,
                        error = %join_error,
                        "partition worker task failed"
                    );
                    WorkerExit::Stalled { offset: 0, error_class: "worker_panic".to_string() }
                }
            };
            reports.push(PartitionReport { partition, exit });
        }

        let summary = ConsumerSummary {
            received: stats.received.load(Ordering::Relaxed),
            applied: stats.applied.load(Ordering::Relaxed),
            replayed: stats.replayed.load(Ordering::Relaxed),
            reconciled: stats.reconciled.load(Ordering::Relaxed),
            dead_lettered: stats.dead_lettered.load(Ordering::Relaxed),
            retries: stats.retries.load(Ordering::Relaxed),
            acknowledged: stats.acknowledged.load(Ordering::Relaxed),
            undelivered: stats.undelivered.load(Ordering::Relaxed),
            partitions: reports,
            source_error,
        };
        info!(
            event_name = "consumer.stopped",
            received = summary.received,
            applied = summary.applied,
            dead_lettered = summary.dead_lettered,
            halted = summary.halted_partitions().len(),
            "admission consumer stopped"
        );
        summary
    }

    async fn dispatch(
        &self,
        senders: &[mpsc::Sender<StreamRecord>],
        stats: &ConsumerStats,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<String> {
        let workers = senders.len() as u32;
        loop {
            let next = tokio::select! {
                biased;
                _ = worker::shutdown_requested(shutdown) => return None,
                next = self.source.next_record() => next,
            };
            let record = match next {
                Ok(Some(record)) => record,
                Ok(None) => return None,
                Err(source_error) => {
                    error!(
                        event_name = "consumer.source.failed",
                        error = %source_error,
                        "event source failed, draining partitions"
                    );
                    return Some(source_error.to_string());
                }
            };
            ConsumerStats::bump(&stats.received);

            let worker = (record.partition % workers) as usize;
            let (partition, offset) = (record.partition, record.offset);
            let delivered = tokio::select! {
                biased;
                _ = worker::shutdown_requested(shutdown) => return None,
                sent = senders[worker].send(record) => sent.is_ok(),
            };
            if !delivered {
                ConsumerStats::bump(&stats.undelivered);
                debug!(
                    event_name = "consumer.partition.unavailable",
                    partition,
                    offset,
                    "partition worker stopped, record left unacknowledged"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use tokio::sync::watch;

    use super::{AdmissionConsumer, ConsumerSettings, ReplayEventSource, WorkerExit, WorkerRetry};
    use crate::admission::{AdmissionCoordinator, AdmissionSettings, Backoff};
    use crate::dead_letter::{DeadLetterSink, InMemoryDeadLetterSink};
    use crate::domain::employee::{AvailabilityRecord, AvailabilityStatus, EmployeeId, QuotaRecord};
    use crate::memory::InMemoryAdmissionStore;
    use crate::policy::{AdmissionLimits, CapacityPolicy};
    use crate::publisher::{InMemoryOutcomePublisher, OutcomeFanout, PublishRetryPolicy};
    use crate::store::{StateCommit, StateStore};

    struct Fixture {
        store: Arc<InMemoryAdmissionStore>,
        dead_letters: Arc<InMemoryDeadLetterSink>,
        published: InMemoryOutcomePublisher,
        coordinator: Arc<AdmissionCoordinator>,
    }

    async fn fixture(staff: usize, minimum_available: u32) -> Fixture {
        let store = Arc::new(InMemoryAdmissionStore::new());
        for index in 0..staff {
            let employee = EmployeeId(format!("e-{index}"));
            store
                .onboard(
                    AvailabilityRecord::onboard(employee.clone(), Utc::now()),
                    QuotaRecord::onboard(employee, 20, 0, 0, Utc::now()).expect("quota"),
                )
                .await
                .expect("onboard");
        }
        let published = InMemoryOutcomePublisher::default();
        let coordinator = Arc::new(AdmissionCoordinator::new(
            store.clone(),
            store.clone(),
            Arc::new(CapacityPolicy::new(AdmissionLimits::new(minimum_available))),
            OutcomeFanout::new(PublishRetryPolicy::default()).with_publisher(Arc::new(published.clone())),
            AdmissionSettings {
                max_commit_attempts: 2,
                backoff: Backoff::new(0, 0),
                ..AdmissionSettings::default()
            },
        ));
        Fixture {
            store,
            dead_letters: Arc::new(InMemoryDeadLetterSink::default()),
            published,
            coordinator,
        }
    }

    fn settings(partitions: u32, retry_limit: u32) -> ConsumerSettings {
        ConsumerSettings {
            partitions,
            channel_capacity: 8,
            retry: WorkerRetry { limit: retry_limit, backoff: Backoff::new(0, 0) },
        }
    }

    fn line(request: &str, employee: &str, kind: &str, start: &str, end: &str) -> String {
        format!(
            r#"{{"request_id":"{request}","employee_id":"{employee}","type":"{kind}","leave_type":"annual","start_date":"{start}","end_date":"{end}","issued_at":"2026-04-01T09:00:00Z"}}"#
        )
    }

    fn consumer(fixture: &Fixture, source: Arc<ReplayEventSource>, settings: ConsumerSettings) -> AdmissionConsumer {
        AdmissionConsumer::new(fixture.coordinator.clone(), source, fixture.dead_letters.clone(), settings)
    }

    #[tokio::test]
    async fn replay_applies_events_and_parks_malformed_lines() {
        let fixture = fixture(6, 2).await;
        let input = [
            line("r-1", "e-1", "SUBMITTED", "2026-05-04", "2026-05-08"),
            line("r-2", "e-2", "SUBMITTED", "2026-05-04", "2026-05-05"),
            line("r-1", "e-1", "CANCELLED", "2026-05-04", "2026-05-08"),
            r#"{"request_id":"r-9","employee_id":"e-3","type":"SUBMITTED"}"#.to_string(),
        ]
        .join("\n");
        let source = Arc::new(ReplayEventSource::from_json_lines(&input, 3));
        let (_tx, shutdown) = watch::channel(false);

        let summary = consumer(&fixture, source.clone(), settings(3, 2)).run(shutdown).await;

        assert_eq!(summary.received, 4);
        assert_eq!(summary.applied, 3);
        assert_eq!(summary.dead_lettered, 1);
        assert_eq!(summary.acknowledged, 4);
        assert!(summary.partitions.iter().all(|report| report.exit == WorkerExit::Drained));
        assert!(source.unacknowledged().await.is_empty());

        let quota = fixture.store.get_quota(&EmployeeId("e-1".into())).await.expect("read").expect("quota");
        assert_eq!(quota.taken_ytd, 0);
        let parked = fixture.dead_letters.list_unresolved(10).await.expect("list");
        assert_eq!(parked[0].error_class, "malformed_event");
        assert_eq!(fixture.published.outcomes().len(), 3);
    }

    #[tokio::test]
    async fn duplicate_delivery_is_replayed_not_reapplied() {
        let fixture = fixture(4, 1).await;
        let submit = line("r-1", "e-1", "SUBMITTED", "2026-05-04", "2026-05-06");
        let source = Arc::new(ReplayEventSource::from_json_lines(&format!("{submit}\n{submit}"), 2));
        let (_tx, shutdown) = watch::channel(false);

        let summary = consumer(&fixture, source, settings(2, 2)).run(shutdown).await;

        assert_eq!((summary.applied, summary.replayed), (1, 1));
        let quota = fixture.store.get_quota(&EmployeeId("e-1".into())).await.expect("read").expect("quota");
        assert_eq!(quota.taken_ytd, 3);
    }

    #[tokio::test]
    async fn transient_outage_is_retried_before_acknowledging() {
        let fixture = fixture(4, 1).await;
        fixture.store.fail_next_snapshots(2);
        let source = Arc::new(ReplayEventSource::from_json_lines(
            &line("r-1", "e-1", "SUBMITTED", "2026-05-04", "2026-05-06"),
            1,
        ));
        let (_tx, shutdown) = watch::channel(false);

        let summary = consumer(&fixture, source, settings(1, 5)).run(shutdown).await;

        assert_eq!(summary.retries, 2);
        assert_eq!(summary.applied, 1);
        assert_eq!(summary.acknowledged, 1);
        assert_eq!(summary.dead_lettered, 0);
    }

    #[tokio::test]
    async fn exhausted_concurrency_is_parked_then_resolved_on_success() {
        let fixture = fixture(4, 1).await;
        // Two commit attempts per handle: the first handle exhausts, the retry wins.
        fixture.store.force_conflicts(2);
        let source = Arc::new(ReplayEventSource::from_json_lines(
            &line("r-1", "e-1", "SUBMITTED", "2026-05-04", "2026-05-06"),
            1,
        ));
        let (_tx, shutdown) = watch::channel(false);

        let summary = consumer(&fixture, source, settings(1, 3)).run(shutdown).await;

        assert_eq!(summary.applied, 1);
        assert_eq!(summary.dead_lettered, 1);
        let letter = fixture.dead_letters.get("p0-o0").await.expect("parked");
        assert_eq!(letter.error_class, "concurrency_exhausted");
        assert!(letter.resolved_at.is_some());
    }

    #[tokio::test]
    async fn malformed_event_is_not_acknowledged_while_the_sink_is_down() {
        let fixture = fixture(2, 1).await;
        fixture.dead_letters.fail_next_records(100);
        let source = Arc::new(ReplayEventSource::from_json_lines(
            r#"{"request_id":"r-9","type":"SUBMITTED"}"#,
            1,
        ));
        let (_tx, shutdown) = watch::channel(false);

        let summary = consumer(&fixture, source.clone(), settings(1, 2)).run(shutdown).await;

        assert_eq!(summary.acknowledged, 0);
        assert_eq!(summary.dead_lettered, 0);
        assert!(matches!(
            &summary.partitions[0].exit,
            WorkerExit::Stalled { error_class, .. } if error_class == "transient_store"
        ));
        assert_eq!(source.unacknowledged().await.len(), 1);
        assert!(fixture.dead_letters.all().await.is_empty());
    }

    #[tokio::test]
    async fn malformed_event_is_acknowledged_once_the_sink_recovers() {
        let fixture = fixture(2, 1).await;
        fixture.dead_letters.fail_next_records(1);
        let source = Arc::new(ReplayEventSource::from_json_lines(
            r#"{"request_id":"r-9","type":"SUBMITTED"}"#,
            1,
        ));
        let (_tx, shutdown) = watch::channel(false);

        let summary = consumer(&fixture, source.clone(), settings(1, 3)).run(shutdown).await;

        assert_eq!((summary.retries, summary.dead_lettered, summary.acknowledged), (1, 1, 1));
        assert!(source.unacknowledged().await.is_empty());
        let letter = fixture.dead_letters.get("p0-o0").await.expect("parked");
        assert_eq!(letter.error_class, "malformed_event");
        assert_eq!(letter.attempts, 1);
    }

    #[tokio::test]
    async fn persistent_failure_stalls_only_its_partition() {
        let fixture = fixture(4, 1).await;
        fixture.store.fail_next_snapshots(100);
        let source = Arc::new(ReplayEventSource::from_json_lines(
            &line("r-1", "e-1", "SUBMITTED", "2026-05-04", "2026-05-06"),
            1,
        ));
        let (_tx, shutdown) = watch::channel(false);

        let summary = consumer(&fixture, source.clone(), settings(1, 2)).run(shutdown).await;

        assert_eq!(summary.halted_partitions(), vec![0]);
        assert!(matches!(
            &summary.partitions[0].exit,
            WorkerExit::Stalled { error_class, .. } if error_class == "transient_store"
        ));
        assert_eq!(source.unacknowledged().await.len(), 1);
    }

    #[tokio::test]
    async fn observed_capacity_breach_halts_the_partition() {
        let fixture = fixture(3, 2).await;
        for id in ["e-0", "e-1"] {
            let record = fixture
                .store
                .get_availability(&EmployeeId(id.into()))
                .await
                .expect("read")
                .expect("record");
            fixture
                .store
                .commit(StateCommit {
                    availability: Some(AvailabilityRecord { status: AvailabilityStatus::OnLeave, ..record }),
                    quota: None,
                    request: None,
                    read_set: Vec::new(),
                    ledger_entry: None,
                })
                .await
                .expect("seed breach");
        }
        let source = Arc::new(ReplayEventSource::from_json_lines(
            &line("r-1", "e-2", "SUBMITTED", "2026-05-04", "2026-05-06"),
            1,
        ));
        let (_tx, shutdown) = watch::channel(false);

        let summary = consumer(&fixture, source.clone(), settings(1, 2)).run(shutdown).await;

        assert!(matches!(summary.partitions[0].exit, WorkerExit::Halted { offset: 0, .. }));
        assert_eq!(source.unacknowledged().await.len(), 1);
        let letter = fixture.dead_letters.get("p0-o0").await.expect("parked");
        assert_eq!(letter.error_class, "policy_violation_detected");
    }

    #[tokio::test]
    async fn shutdown_before_start_leaves_everything_unacknowledged() {
        let fixture = fixture(4, 1).await;
        let source = Arc::new(ReplayEventSource::from_json_lines(
            &line("r-1", "e-1", "SUBMITTED", "2026-05-04", "2026-05-06"),
            2,
        ));
        let (_tx, shutdown) = watch::channel(true);

        let summary = consumer(&fixture, source.clone(), settings(2, 2)).run(shutdown).await;

        assert_eq!(summary.received, 0);
        assert!(summary.partitions.iter().all(|report| report.exit == WorkerExit::ShutDown));
        assert_eq!(source.unacknowledged().await.len(), 1);
    }
}
