use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::request::RequestId;
use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EmployeeId(pub String);

impl EmployeeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EmployeeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AvailabilityStatus {
    Available,
    OnLeave,
    Pending,
}

impl AvailabilityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "AVAILABLE",
            Self::OnLeave => "ON_LEAVE",
            Self::Pending => "PENDING",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "AVAILABLE" => Some(Self::Available),
            "ON_LEAVE" => Some(Self::OnLeave),
            "PENDING" => Some(Self::Pending),
            _ => None,
        }
    }
}

/// Inclusive calendar range of a leave.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, DomainError> {
        if start > end {
            return Err(DomainError::InvalidDateRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn days(&self) -> u32 {
        let span = (self.end - self.start).num_days() + 1;
        u32::try_from(span).unwrap_or(u32::MAX)
    }

    pub fn overlaps(&self, other: &DateRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityRecord {
    pub employee_id: EmployeeId,
    pub status: AvailabilityStatus,
    pub leave: Option<DateRange>,
    pub active_request_id: Option<RequestId>,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl AvailabilityRecord {
    pub fn onboard(employee_id: EmployeeId, at: DateTime<Utc>) -> Self {
        Self {
            employee_id,
            status: AvailabilityStatus::Available,
            leave: None,
            active_request_id: None,
            version: 0,
            updated_at: at,
        }
    }

    pub fn is_absent(&self) -> bool {
        !matches!(self.status, AvailabilityStatus::Available)
    }

    /// Whether this record consumes a capacity slot for a leave over `range`.
    ///
    /// An `ON_LEAVE` record always holds a slot. A `PENDING` record only competes
    /// with ranges it overlaps.
    pub fn occupies_slot_during(&self, range: &DateRange) -> bool {
        match self.status {
            AvailabilityStatus::Available => false,
            AvailabilityStatus::OnLeave => true,
            AvailabilityStatus::Pending => {
                self.leave.as_ref().map(|leave| leave.overlaps(range)).unwrap_or(true)
            }
        }
    }

    pub fn holds_request(&self, request_id: &RequestId) -> bool {
        self.is_absent() && self.active_request_id.as_ref() == Some(request_id)
    }

    pub fn start_leave(
        &self,
        status: AvailabilityStatus,
        range: DateRange,
        request_id: RequestId,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            status,
            leave: Some(range),
            active_request_id: Some(request_id),
            updated_at: at,
            ..self.clone()
        }
    }

    pub fn release(&self, at: DateTime<Utc>) -> Self {
        Self {
            status: AvailabilityStatus::Available,
            leave: None,
            active_request_id: None,
            updated_at: at,
            ..self.clone()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaRecord {
    pub employee_id: EmployeeId,
    pub annual_allowance: u32,
    pub carried_over: u32,
    pub taken_ytd: u32,
    pub pending_days: u32,
    pub available_days: u32,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl QuotaRecord {
    pub fn onboard(
        employee_id: EmployeeId,
        annual_allowance: u32,
        carried_over: u32,
        taken_ytd: u32,
        at: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        let entitlement = annual_allowance.checked_add(carried_over).ok_or_else(|| {
            quota_error(&employee_id, "allowance plus carry-over overflows".to_string())
        })?;
        let available_days = entitlement.checked_sub(taken_ytd).ok_or_else(|| {
            quota_error(
                &employee_id,
                format!("taken {taken_ytd} exceeds entitlement {entitlement}"),
            )
        })?;

        Ok(Self {
            employee_id,
            annual_allowance,
            carried_over,
            taken_ytd,
            pending_days: 0,
            available_days,
            version: 0,
            updated_at: at,
        })
    }

    /// `available = allowance + carried_over - taken - pending`.
    pub fn check_balance(&self) -> Result<(), DomainError> {
        let entitlement = u64::from(self.annual_allowance) + u64::from(self.carried_over);
        let committed = u64::from(self.taken_ytd)
            + u64::from(self.pending_days)
            + u64::from(self.available_days);
        if entitlement != committed {
            return Err(quota_error(
                &self.employee_id,
                format!(
                    "allowance {} + carried {} != taken {} + pending {} + available {}",
                    self.annual_allowance,
                    self.carried_over,
                    self.taken_ytd,
                    self.pending_days,
                    self.available_days
                ),
            ));
        }
        Ok(())
    }

    pub fn consume(&self, days: u32, at: DateTime<Utc>) -> Result<Self, DomainError> {
        let available_days = self.take_available(days)?;
        Ok(Self {
            taken_ytd: self.taken_ytd.saturating_add(days),
            available_days,
            updated_at: at,
            ..self.clone()
        })
    }

    pub fn reserve(&self, days: u32, at: DateTime<Utc>) -> Result<Self, DomainError> {
        let available_days = self.take_available(days)?;
        Ok(Self {
            pending_days: self.pending_days.saturating_add(days),
            available_days,
            updated_at: at,
            ..self.clone()
        })
    }

    pub fn commit_pending(&self, days: u32, at: DateTime<Utc>) -> Result<Self, DomainError> {
        let pending_days = self.take_pending(days)?;
        Ok(Self {
            pending_days,
            taken_ytd: self.taken_ytd.saturating_add(days),
            updated_at: at,
            ..self.clone()
        })
    }

    pub fn release_pending(&self, days: u32, at: DateTime<Utc>) -> Result<Self, DomainError> {
        let pending_days = self.take_pending(days)?;
        Ok(Self {
            pending_days,
            available_days: self.available_days.saturating_add(days),
            updated_at: at,
            ..self.clone()
        })
    }

    pub fn restore_taken(&self, days: u32, at: DateTime<Utc>) -> Result<Self, DomainError> {
        let taken_ytd = self.taken_ytd.checked_sub(days).ok_or_else(|| {
            quota_error(
                &self.employee_id,
                format!("cannot restore {days} days, only {} taken", self.taken_ytd),
            )
        })?;
        Ok(Self {
            taken_ytd,
            available_days: self.available_days.saturating_add(days),
            updated_at: at,
            ..self.clone()
        })
    }

    fn take_available(&self, days: u32) -> Result<u32, DomainError> {
        self.available_days.checked_sub(days).ok_or_else(|| {
            quota_error(
                &self.employee_id,
                format!("requested {days} days with {} available", self.available_days),
            )
        })
    }

    fn take_pending(&self, days: u32) -> Result<u32, DomainError> {
        self.pending_days.checked_sub(days).ok_or_else(|| {
            quota_error(
                &self.employee_id,
                format!("cannot settle {days} pending days, only {} pending", self.pending_days),
            )
        })
    }
}

fn quota_error(employee_id: &EmployeeId, detail: String) -> DomainError {
    DomainError::QuotaInvariant { employee_id: employee_id.0.clone(), detail }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, Utc};

    use super::{AvailabilityRecord, AvailabilityStatus, DateRange, EmployeeId, QuotaRecord};
    use crate::domain::request::RequestId;
    use crate::errors::DomainError;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 7, day).expect("valid date")
    }

    #[test]
    fn date_range_counts_inclusive_days() {
        let range = DateRange::new(date(6), date(10)).expect("range");
        assert_eq!(range.days(), 5);
        assert_eq!(DateRange::new(date(6), date(6)).expect("range").days(), 1);
    }

    #[test]
    fn reversed_date_range_is_rejected() {
        let error = DateRange::new(date(10), date(6)).expect_err("reversed");
        assert!(matches!(error, DomainError::InvalidDateRange { .. }));
    }

    #[test]
    fn overlap_is_inclusive_at_the_edges() {
        let first = DateRange::new(date(1), date(5)).expect("range");
        let touching = DateRange::new(date(5), date(9)).expect("range");
        let disjoint = DateRange::new(date(6), date(9)).expect("range");
        assert!(first.overlaps(&touching));
        assert!(!first.overlaps(&disjoint));
    }

    #[test]
    fn pending_record_only_occupies_overlapping_ranges() {
        let now = Utc::now();
        let record = AvailabilityRecord::onboard(EmployeeId("e-1".into()), now).start_leave(
            AvailabilityStatus::Pending,
            DateRange::new(date(1), date(5)).expect("range"),
            RequestId("r-1".into()),
            now,
        );
        assert!(record.occupies_slot_during(&DateRange::new(date(4), date(8)).expect("range")));
        assert!(!record.occupies_slot_during(&DateRange::new(date(6), date(8)).expect("range")));

        let on_leave = AvailabilityRecord { status: AvailabilityStatus::OnLeave, ..record };
        assert!(on_leave.occupies_slot_during(&DateRange::new(date(20), date(21)).expect("range")));
    }

    #[test]
    fn status_round_trips_storage_encoding() {
        for status in
            [AvailabilityStatus::Available, AvailabilityStatus::OnLeave, AvailabilityStatus::Pending]
        {
            assert_eq!(AvailabilityStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(AvailabilityStatus::parse("vacationing"), None);
    }

    #[test]
    fn quota_moves_keep_the_balance() {
        let now = Utc::now();
        let quota = QuotaRecord::onboard(EmployeeId("e-1".into()), 25, 3, 2, now).expect("quota");
        assert_eq!(quota.available_days, 26);

        let reserved = quota.reserve(4, now).expect("reserve");
        assert_eq!((reserved.pending_days, reserved.available_days), (4, 22));
        reserved.check_balance().expect("balanced after reserve");

        let committed = reserved.commit_pending(4, now).expect("commit");
        assert_eq!((committed.taken_ytd, committed.pending_days), (6, 0));
        committed.check_balance().expect("balanced after commit");

        let restored = committed.restore_taken(4, now).expect("restore");
        assert_eq!(restored.available_days, 26);
        restored.check_balance().expect("balanced after restore");
    }

    #[test]
    fn consuming_more_than_available_is_refused() {
        let quota = QuotaRecord::onboard(EmployeeId("e-2".into()), 3, 0, 0, Utc::now())
            .expect("quota");
        let error = quota.consume(5, Utc::now()).expect_err("overdraw");
        assert!(matches!(error, DomainError::QuotaInvariant { .. }));
    }

    #[test]
    fn onboarding_rejects_taken_beyond_entitlement() {
        let error = QuotaRecord::onboard(EmployeeId("e-3".into()), 10, 0, 12, Utc::now())
            .expect_err("over-taken");
        assert!(matches!(error, DomainError::QuotaInvariant { .. }));
    }
}
