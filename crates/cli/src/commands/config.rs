use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use leavegate_core::config::{AppConfig, LoadOptions};
use secrecy::ExposeSecret;
use toml::Value;

struct FieldSources {
    doc: Option<Value>,
    path: Option<PathBuf>,
}

impl FieldSources {
    fn detect() -> Self {
        let path = detect_config_path();
        let doc = load_config_file_doc(path.as_deref());
        Self { doc, path }
    }

    fn line(&self, key_path: &str, value: &str) -> String {
        let env_key = env_key_for(key_path);
        let source = field_source(key_path, &env_key, self.doc.as_ref(), self.path.as_deref());
        render_line(key_path, value, source)
    }
}

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };
    let sources = FieldSources::detect();

    let admission = &config.admission;
    let consumer = &config.consumer;
    let publisher = &config.publisher;

    let total_employees = admission
        .total_employees
        .map(|total| total.to_string())
        .unwrap_or_else(|| "<roster size>".to_string());
    let review_types = if admission.review_leave_types.is_empty() {
        "<none>".to_string()
    } else {
        admission.review_leave_types.join(",")
    };
    let replay_path = consumer
        .replay_path
        .as_ref()
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| "<unset>".to_string());
    let webhook_secret = publisher
        .webhook_secret
        .as_ref()
        .map(|secret| redact_secret(secret.expose_secret()))
        .unwrap_or_else(|| "<unset>".to_string());

    let lines = vec![
        "effective config (source precedence: env > file > default):".to_string(),
        sources.line("database.url", &config.database.url),
        sources.line("database.max_connections", &config.database.max_connections.to_string()),
        sources.line("database.timeout_secs", &config.database.timeout_secs.to_string()),
        sources.line("admission.minimum_available", &admission.minimum_available.to_string()),
        sources.line("admission.total_employees", &total_employees),
        sources.line("admission.max_commit_attempts", &admission.max_commit_attempts.to_string()),
        sources.line("admission.backoff_base_ms", &admission.backoff_base_ms.to_string()),
        sources.line("admission.backoff_max_ms", &admission.backoff_max_ms.to_string()),
        sources.line("admission.handle_timeout_ms", &admission.handle_timeout_ms.to_string()),
        sources.line("admission.ledger_mode", &format!("{:?}", admission.ledger_mode)),
        sources.line(
            "admission.ledger_retention_hours",
            &admission.ledger_retention_hours.to_string(),
        ),
        sources.line("admission.review_leave_types", &review_types),
        sources.line("consumer.partitions", &consumer.partitions.to_string()),
        sources.line("consumer.channel_capacity", &consumer.channel_capacity.to_string()),
        sources.line("consumer.replay_path", &replay_path),
        sources.line("consumer.transient_retry_limit", &consumer.transient_retry_limit.to_string()),
        sources.line("publisher.webhook_url", publisher.webhook_url.as_deref().unwrap_or("<unset>")),
        sources.line("publisher.webhook_secret", &webhook_secret),
        sources.line("publisher.max_retries", &publisher.max_retries.to_string()),
        sources.line("publisher.base_delay_ms", &publisher.base_delay_ms.to_string()),
        sources.line("publisher.timeout_secs", &publisher.timeout_secs.to_string()),
        sources.line("publisher.relay_interval_ms", &publisher.relay_interval_ms.to_string()),
        sources.line("server.bind_address", &config.server.bind_address),
        sources.line("server.port", &config.server.port.to_string()),
        sources.line(
            "server.graceful_shutdown_secs",
            &config.server.graceful_shutdown_secs.to_string(),
        ),
        sources.line("logging.level", &config.logging.level),
        sources.line("logging.format", &format!("{:?}", config.logging.format)),
    ];

    lines.join("\n")
}

fn env_key_for(key_path: &str) -> String {
    format!("LEAVEGATE_{}", key_path.replace('.', "_").to_ascii_uppercase())
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("leavegate.toml"), PathBuf::from("config/leavegate.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: &str,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if env::var_os(env_key).is_some() {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

fn redact_secret(secret: &str) -> String {
    if secret.trim().is_empty() {
        "<empty>".to_string()
    } else {
        "<redacted>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use toml::Value;

    use super::{contains_path, env_key_for, field_source, redact_secret};

    #[test]
    fn env_keys_follow_the_section_field_convention() {
        assert_eq!(env_key_for("admission.minimum_available"), "LEAVEGATE_ADMISSION_MINIMUM_AVAILABLE");
        assert_eq!(env_key_for("publisher.webhook_url"), "LEAVEGATE_PUBLISHER_WEBHOOK_URL");
    }

    #[test]
    fn file_values_are_attributed_to_the_file() {
        let doc: Value = "[admission]\nminimum_available = 12\n".parse().expect("toml");

        assert!(contains_path(&doc, "admission.minimum_available"));
        assert!(!contains_path(&doc, "admission.total_employees"));
        assert_eq!(
            field_source(
                "admission.minimum_available",
                "LEAVEGATE_TEST_UNSET_KEY_FOR_SOURCE",
                Some(&doc),
                Some(std::path::Path::new("leavegate.toml")),
            ),
            "file (leavegate.toml)"
        );
    }

    #[test]
    fn secrets_never_render_in_clear_text() {
        assert_eq!(redact_secret("whsec-abc"), "<redacted>");
        assert_eq!(redact_secret("  "), "<empty>");
    }
}
