use leavegate_core::chrono::Utc;
use leavegate_core::IdempotencyLedger;
use leavegate_db::SqlIdempotencyLedger;
use serde_json::json;

use crate::commands::{with_database, CommandResult};

/// Drops completed idempotency entries whose retention window has lapsed.
/// In-flight reservations are never purged.
pub fn run() -> CommandResult {
    let result = with_database("compact-ledger", |config, pool| async move {
        let purged = SqlIdempotencyLedger::new(pool)
            .purge_expired(Utc::now())
            .await
            .map_err(|error| ("ledger_compaction", error.to_string(), 6u8))?;
        Ok((purged, config.admission.ledger_retention_hours))
    });

    match result {
        Ok((purged, retention_hours)) => CommandResult::success_with_details(
            "compact-ledger",
            format!("purged {purged} expired idempotency entries"),
            json!({ "purged": purged, "retention_hours": retention_hours }),
        ),
        Err(failure) => failure,
    }
}
