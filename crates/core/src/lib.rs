pub mod admission;
pub mod config;
pub mod consumer;
pub mod dead_letter;
pub mod domain;
pub mod errors;
pub mod ledger;
pub mod memory;
pub mod outbox;
pub mod policy;
pub mod publisher;
pub mod store;

pub use admission::{
    AdmissionCoordinator, AdmissionError, AdmissionService, AdmissionSettings,
    AvailabilityStats, FailureDisposition, HandleDisposition, HandleReport, QuotaBalance,
    RosterEntry, SubmitLeave,
};
pub use consumer::{
    AdmissionConsumer, ConsumerSettings, ConsumerSummary, EventSource, ReplayEventSource,
    StreamRecord,
};
pub use dead_letter::{DeadLetter, DeadLetterSink, InMemoryDeadLetterSink};
pub use domain::employee::{
    AvailabilityRecord, AvailabilityStatus, DateRange, EmployeeId, QuotaRecord,
};
pub use domain::event::{LeaveEvent, LeaveEventKind, LeaveEventType, WireLeaveEvent};
pub use domain::outcome::{Decision, DecisionReason, OutcomeEvent};
pub use domain::request::{LeaveRequest, LeaveRequestStatus, LeaveType, RequestId};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use ledger::{IdempotencyEntry, IdempotencyKey, LedgerEntryState};
pub use memory::InMemoryAdmissionStore;
pub use policy::{AdmissionLimits, AdmissionPolicy, CapacityPolicy};
pub use outbox::{InMemoryOutcomeOutbox, OutcomeOutbox, PendingDelivery};
pub use publisher::{
    OutboxRelay, OutcomeFanout, OutcomePublisher, PublishError, PublishReport, PublishRetryPolicy,
    RelayPass,
};
pub use store::{CommitStatus, IdempotencyLedger, StateCommit, StateStore, StoreError};

pub use chrono;
