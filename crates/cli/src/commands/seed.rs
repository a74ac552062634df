use leavegate_core::chrono::Utc;
use leavegate_db::RosterSeed;
use serde_json::json;

use crate::commands::{with_database, CommandResult};

/// Onboards a deterministic roster. Reruns skip employees that already exist,
/// so their balances and availability are left as they are.
pub fn run(employees: u32, allowance: u32) -> CommandResult {
    if employees == 0 {
        return CommandResult::failure(
            "seed",
            "invalid_arguments",
            "--employees must be greater than zero",
            2,
        );
    }

    let seed = RosterSeed::new(employees, allowance);
    let result = with_database("seed", |_, pool| async move {
        let loaded = seed
            .load(&pool, Utc::now())
            .await
            .map_err(|error| ("seed_execution", error.to_string(), 6u8))?;
        let verification =
            seed.verify(&pool).await.map_err(|error| ("seed_verification", error.to_string(), 7u8))?;

        if !verification.all_present {
            let failed = verification
                .checks
                .iter()
                .filter_map(|(employee, present)| (!present).then_some(employee.as_str()))
                .collect::<Vec<_>>();
            return Err(("seed_verification", verification_message(&failed), 7u8));
        }
        Ok(loaded)
    });

    match result {
        Ok(loaded) => CommandResult::success_with_details(
            "seed",
            format!(
                "roster ready: {} onboarded, {} already present",
                loaded.onboarded.len(),
                loaded.skipped.len()
            ),
            json!({
                "employees": employees,
                "allowance": allowance,
                "onboarded": loaded.onboarded,
                "skipped": loaded.skipped,
            }),
        ),
        Err(failure) => failure,
    }
}

fn verification_message(failed: &[&str]) -> String {
    if failed.is_empty() {
        "Some roster records failed to load".to_string()
    } else {
        format!("Roster verification failed for employees: {}", failed.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::{run, verification_message};

    #[test]
    fn verification_message_names_the_missing_employees() {
        assert_eq!(
            verification_message(&["emp-002", "emp-007"]),
            "Roster verification failed for employees: emp-002, emp-007"
        );
    }

    #[test]
    fn verification_message_falls_back_without_labels() {
        assert_eq!(verification_message(&[]), "Some roster records failed to load");
    }

    #[test]
    fn empty_roster_is_rejected_before_touching_the_database() {
        let result = run(0, 20);
        assert_eq!(result.exit_code, 2);
        assert!(result.output.contains("invalid_arguments"));
    }
}
