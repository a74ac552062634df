use leavegate_core::chrono::{DateTime, Utc};
use leavegate_core::domain::employee::{AvailabilityRecord, EmployeeId, QuotaRecord};
use leavegate_core::store::{StateStore, StoreError};

use crate::connection::DbPool;
use crate::repositories::{RepositoryError, SqlStateStore};

/// Deterministic roster of `employees` people, each with the same
/// entitlement. Ids are `emp-001`, `emp-002`, ...
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RosterSeed {
    pub employees: u32,
    pub allowance: u32,
    pub carried_over: u32,
}

impl Default for RosterSeed {
    fn default() -> Self {
        Self { employees: 25, allowance: 20, carried_over: 0 }
    }
}

impl RosterSeed {
    pub fn new(employees: u32, allowance: u32) -> Self {
        Self { employees, allowance, ..Self::default() }
    }

    pub fn employee_ids(&self) -> Vec<EmployeeId> {
        (1..=self.employees).map(|index| EmployeeId(format!("emp-{index:03}"))).collect()
    }

    /// Onboards every employee of the roster. Employees that already exist are
    /// left untouched and counted as skipped, so loading twice is harmless.
    pub async fn load(&self, pool: &DbPool, at: DateTime<Utc>) -> Result<SeedResult, SeedError> {
        let store = SqlStateStore::new(pool.clone());
        let mut result = SeedResult::default();

        for employee_id in self.employee_ids() {
            let quota =
                QuotaRecord::onboard(employee_id.clone(), self.allowance, self.carried_over, 0, at)
                    .map_err(|error| SeedError::Roster(error.to_string()))?;
            match store.onboard(AvailabilityRecord::onboard(employee_id.clone(), at), quota).await {
                Ok(()) => result.onboarded.push(employee_id.0),
                Err(StoreError::AlreadyOnboarded(id)) => result.skipped.push(id),
                Err(error) => return Err(SeedError::Store(error)),
            }
        }

        Ok(result)
    }

    /// Checks that every seeded employee has both records and a balanced quota.
    pub async fn verify(&self, pool: &DbPool) -> Result<VerificationResult, SeedError> {
        let store = SqlStateStore::new(pool.clone());
        let mut checks = Vec::with_capacity(self.employees as usize);

        for employee_id in self.employee_ids() {
            let availability = store.get_availability(&employee_id).await?;
            let quota = store.get_quota(&employee_id).await?;
            let present = availability.is_some()
                && quota.map(|quota| quota.check_balance().is_ok()).unwrap_or(false);
            checks.push((employee_id.0, present));
        }

        let all_present = checks.iter().all(|(_, present)| *present);
        Ok(VerificationResult { all_present, checks })
    }

    /// Removes the seeded employees. Their requests go with them through the
    /// cascading foreign keys.
    pub async fn clean(&self, pool: &DbPool) -> Result<u64, SeedError> {
        let mut tx = pool.begin().await.map_err(RepositoryError::from)?;
        let mut removed = 0;
        for employee_id in self.employee_ids() {
            let result = sqlx::query("DELETE FROM employee_availability WHERE employee_id = ?")
                .bind(employee_id.as_str())
                .execute(&mut *tx)
                .await
                .map_err(RepositoryError::from)?;
            removed += result.rows_affected();
        }
        tx.commit().await.map_err(RepositoryError::from)?;
        Ok(removed)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SeedError {
    #[error("invalid roster: {0}")]
    Roster(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

#[derive(Debug, Default)]
pub struct SeedResult {
    pub onboarded: Vec<String>,
    pub skipped: Vec<String>,
}

#[derive(Debug)]
pub struct VerificationResult {
    pub all_present: bool,
    pub checks: Vec<(String, bool)>,
}

#[cfg(test)]
mod tests {
    use leavegate_core::chrono::Utc;
    use leavegate_core::domain::employee::EmployeeId;
    use leavegate_core::store::StateStore;

    use super::RosterSeed;
    use crate::repositories::SqlStateStore;
    use crate::{connect_with_settings, migrations};

    #[test]
    fn employee_ids_are_zero_padded_and_ordered() {
        let ids = RosterSeed::new(3, 20).employee_ids();
        assert_eq!(
            ids,
            vec![
                EmployeeId("emp-001".to_string()),
                EmployeeId("emp-002".to_string()),
                EmployeeId("emp-003".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn loading_twice_skips_existing_employees() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30)
            .await
            .expect("connect to test database");
        migrations::run_pending(&pool).await.expect("run migrations");

        let seed = RosterSeed::new(4, 18);
        let first = seed.load(&pool, Utc::now()).await.expect("load roster");
        assert_eq!(first.onboarded.len(), 4);
        assert!(first.skipped.is_empty());

        let second = seed.load(&pool, Utc::now()).await.expect("reload roster");
        assert!(second.onboarded.is_empty());
        assert_eq!(second.skipped.len(), 4);

        let verification = seed.verify(&pool).await.expect("verify roster");
        assert!(verification.all_present);
        assert_eq!(verification.checks.len(), 4);

        let quota = SqlStateStore::new(pool.clone())
            .get_quota(&EmployeeId("emp-002".to_string()))
            .await
            .expect("quota")
            .expect("row");
        assert_eq!((quota.annual_allowance, quota.available_days), (18, 18));
    }

    #[tokio::test]
    async fn clean_removes_the_seeded_roster() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30)
            .await
            .expect("connect to test database");
        migrations::run_pending(&pool).await.expect("run migrations");

        let seed = RosterSeed::new(2, 20);
        seed.load(&pool, Utc::now()).await.expect("load roster");
        assert_eq!(seed.clean(&pool).await.expect("clean"), 2);

        let verification = seed.verify(&pool).await.expect("verify after clean");
        assert!(!verification.all_present);
        assert!(SqlStateStore::new(pool.clone())
            .list_quotas()
            .await
            .expect("list quotas")
            .is_empty());
    }
}
