use leavegate_core::DeadLetterSink;
use leavegate_db::SqlDeadLetterSink;
use serde_json::json;

use crate::commands::{with_database, CommandResult};

pub const DEFAULT_LIMIT: u32 = 50;

pub fn run(limit: u32) -> CommandResult {
    let result = with_database("dead-letters", |_, pool| async move {
        SqlDeadLetterSink::new(pool)
            .list_unresolved(limit.max(1))
            .await
            .map_err(|error| ("dead_letter_query", error.to_string(), 6u8))
    });

    match result {
        Ok(letters) => {
            let message = if letters.is_empty() {
                "no unresolved dead letters".to_string()
            } else {
                format!("{} unresolved dead letters", letters.len())
            };
            CommandResult::success_with_details(
                "dead-letters",
                message,
                json!({ "count": letters.len(), "letters": letters }),
            )
        }
        Err(failure) => failure,
    }
}
