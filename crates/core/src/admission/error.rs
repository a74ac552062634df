use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::event::EventDecodeError;
use crate::errors::ApplicationError;
use crate::policy::PolicyError;
use crate::store::StoreError;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("transient store failure: {0}")]
    TransientStore(StoreError),
    #[error("conditional write for `{key}` lost {attempts} consecutive races")]
    ConcurrencyExhausted { key: String, attempts: u32 },
    #[error("malformed event: {reason}")]
    MalformedEvent { reason: String },
    #[error("capacity invariant already broken in the store: {absent} absent, limit {limit}")]
    PolicyViolationDetected { absent: u32, limit: u32 },
}

/// What the caller must do with the event that failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureDisposition {
    /// Leave unacknowledged and retry after backoff.
    RetryUnacknowledged,
    /// Park for operator review, leave unacknowledged, keep retrying.
    DeadLetterAndRetry,
    /// Park for audit and acknowledge so the partition moves on.
    DeadLetterAndAcknowledge,
    /// Stop the partition; the store no longer satisfies the capacity invariant.
    HaltPartition,
}

impl AdmissionError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedEvent { reason: reason.into() }
    }

    pub fn error_class(&self) -> &'static str {
        match self {
            Self::TransientStore(_) => "transient_store",
            Self::ConcurrencyExhausted { .. } => "concurrency_exhausted",
            Self::MalformedEvent { .. } => "malformed_event",
            Self::PolicyViolationDetected { .. } => "policy_violation_detected",
        }
    }

    pub fn disposition(&self) -> FailureDisposition {
        match self {
            Self::TransientStore(_) => FailureDisposition::RetryUnacknowledged,
            Self::ConcurrencyExhausted { .. } => FailureDisposition::DeadLetterAndRetry,
            Self::MalformedEvent { .. } => FailureDisposition::DeadLetterAndAcknowledge,
            Self::PolicyViolationDetected { .. } => FailureDisposition::HaltPartition,
        }
    }
}

impl From<StoreError> for AdmissionError {
    fn from(error: StoreError) -> Self {
        match error {
            // An event for an employee the store has never onboarded cannot be decided.
            StoreError::MissingRecord { .. } => Self::malformed(error.to_string()),
            other => Self::TransientStore(other),
        }
    }
}

impl From<EventDecodeError> for AdmissionError {
    fn from(error: EventDecodeError) -> Self {
        Self::malformed(error.to_string())
    }
}

impl From<PolicyError> for AdmissionError {
    fn from(error: PolicyError) -> Self {
        match error {
            PolicyError::CapacityBreached { absent, limit } => {
                Self::PolicyViolationDetected { absent, limit }
            }
            other => Self::malformed(format!("decision engine rejected the event: {other}")),
        }
    }
}

impl From<AdmissionError> for ApplicationError {
    fn from(error: AdmissionError) -> Self {
        match error {
            AdmissionError::MalformedEvent { reason } => Self::InvalidInput(reason),
            other @ AdmissionError::TransientStore(_)
            | other @ AdmissionError::ConcurrencyExhausted { .. } => {
                Self::Persistence(other.to_string())
            }
            other @ AdmissionError::PolicyViolationDetected { .. } => {
                Self::Integration(other.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AdmissionError, FailureDisposition};
    use crate::errors::{ApplicationError, InterfaceError};
    use crate::policy::PolicyError;
    use crate::store::StoreError;

    #[test]
    fn each_class_has_its_disposition() {
        let cases = [
            (
                AdmissionError::from(StoreError::Unavailable("connection refused".into())),
                "transient_store",
                FailureDisposition::RetryUnacknowledged,
            ),
            (
                AdmissionError::ConcurrencyExhausted { key: "r:SUBMITTED".into(), attempts: 5 },
                "concurrency_exhausted",
                FailureDisposition::DeadLetterAndRetry,
            ),
            (
                AdmissionError::malformed("missing employee_id"),
                "malformed_event",
                FailureDisposition::DeadLetterAndAcknowledge,
            ),
            (
                AdmissionError::from(PolicyError::CapacityBreached { absent: 3, limit: 2 }),
                "policy_violation_detected",
                FailureDisposition::HaltPartition,
            ),
        ];

        for (error, class, disposition) in cases {
            assert_eq!(error.error_class(), class);
            assert_eq!(error.disposition(), disposition);
        }
    }

    #[test]
    fn unknown_employee_is_malformed_not_transient() {
        let error = AdmissionError::from(StoreError::MissingRecord {
            kind: "availability",
            employee_id: "e-404".into(),
        });
        assert_eq!(error.error_class(), "malformed_event");
    }

    #[test]
    fn infrastructure_failures_surface_as_try_again_later() {
        let interface = ApplicationError::from(AdmissionError::TransientStore(
            StoreError::Timeout { timeout_ms: 500 },
        ))
        .into_interface("corr-1");
        assert!(matches!(interface, InterfaceError::ServiceUnavailable { .. }));

        let rejected = ApplicationError::from(AdmissionError::malformed("start after end"))
            .into_interface("corr-2");
        assert!(matches!(rejected, InterfaceError::BadRequest { .. }));
    }
}
