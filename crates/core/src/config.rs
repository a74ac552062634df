use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub admission: AdmissionConfig,
    pub consumer: ConsumerConfig,
    pub publisher: PublisherConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct AdmissionConfig {
    /// Staff that must stay available at all times.
    pub minimum_available: u32,
    /// Headcount the capacity rule is evaluated against. Falls back to the roster size.
    pub total_employees: Option<u32>,
    pub max_commit_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub handle_timeout_ms: u64,
    pub ledger_mode: LedgerMode,
    pub ledger_retention_hours: u64,
    pub review_leave_types: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct ConsumerConfig {
    pub partitions: u32,
    pub channel_capacity: u32,
    pub replay_path: Option<PathBuf>,
    pub transient_retry_limit: u32,
}

#[derive(Clone, Debug)]
pub struct PublisherConfig {
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<SecretString>,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub timeout_secs: u64,
    /// How often undelivered outcomes are retried from the outbox.
    pub relay_interval_ms: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// How the idempotency entry is made durable relative to the state commit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerMode {
    /// Entry is written inside the same store transaction as the state change.
    Transactional,
    /// Entry is reserved before the commit and completed after it.
    ReserveThenComplete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub minimum_available: Option<u32>,
    pub total_employees: Option<u32>,
    pub ledger_mode: Option<LedgerMode>,
    pub partitions: Option<u32>,
    pub replay_path: Option<PathBuf>,
    pub webhook_url: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://leavegate.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            admission: AdmissionConfig {
                minimum_available: 20,
                total_employees: None,
                max_commit_attempts: 5,
                backoff_base_ms: 20,
                backoff_max_ms: 1_000,
                handle_timeout_ms: 5_000,
                ledger_mode: LedgerMode::Transactional,
                ledger_retention_hours: 168,
                review_leave_types: vec!["unpaid".to_string()],
            },
            consumer: ConsumerConfig {
                partitions: 4,
                channel_capacity: 64,
                replay_path: None,
                transient_retry_limit: 20,
            },
            publisher: PublisherConfig {
                webhook_url: None,
                webhook_secret: None,
                max_retries: 3,
                base_delay_ms: 100,
                timeout_secs: 10,
                relay_interval_ms: 1_000,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl std::str::FromStr for LedgerMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "transactional" => Ok(Self::Transactional),
            "reserve_then_complete" => Ok(Self::ReserveThenComplete),
            other => Err(ConfigError::Validation(format!(
                "unsupported ledger mode `{other}` (expected transactional|reserve_then_complete)"
            ))),
        }
    }
}

impl LedgerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transactional => "transactional",
            Self::ReserveThenComplete => "reserve_then_complete",
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("leavegate.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(admission) = patch.admission {
            if let Some(minimum_available) = admission.minimum_available {
                self.admission.minimum_available = minimum_available;
            }
            if let Some(total_employees) = admission.total_employees {
                self.admission.total_employees = Some(total_employees);
            }
            if let Some(max_commit_attempts) = admission.max_commit_attempts {
                self.admission.max_commit_attempts = max_commit_attempts;
            }
            if let Some(backoff_base_ms) = admission.backoff_base_ms {
                self.admission.backoff_base_ms = backoff_base_ms;
            }
            if let Some(backoff_max_ms) = admission.backoff_max_ms {
                self.admission.backoff_max_ms = backoff_max_ms;
            }
            if let Some(handle_timeout_ms) = admission.handle_timeout_ms {
                self.admission.handle_timeout_ms = handle_timeout_ms;
            }
            if let Some(ledger_mode) = admission.ledger_mode {
                self.admission.ledger_mode = ledger_mode;
            }
            if let Some(ledger_retention_hours) = admission.ledger_retention_hours {
                self.admission.ledger_retention_hours = ledger_retention_hours;
            }
            if let Some(review_leave_types) = admission.review_leave_types {
                self.admission.review_leave_types = normalize_leave_types(review_leave_types);
            }
        }

        if let Some(consumer) = patch.consumer {
            if let Some(partitions) = consumer.partitions {
                self.consumer.partitions = partitions;
            }
            if let Some(channel_capacity) = consumer.channel_capacity {
                self.consumer.channel_capacity = channel_capacity;
            }
            if let Some(replay_path) = consumer.replay_path {
                self.consumer.replay_path = Some(replay_path);
            }
            if let Some(transient_retry_limit) = consumer.transient_retry_limit {
                self.consumer.transient_retry_limit = transient_retry_limit;
            }
        }

        if let Some(publisher) = patch.publisher {
            if let Some(webhook_url) = publisher.webhook_url {
                self.publisher.webhook_url = Some(webhook_url);
            }
            if let Some(webhook_secret) = publisher.webhook_secret {
                self.publisher.webhook_secret = Some(webhook_secret.into());
            }
            if let Some(max_retries) = publisher.max_retries {
                self.publisher.max_retries = max_retries;
            }
            if let Some(base_delay_ms) = publisher.base_delay_ms {
                self.publisher.base_delay_ms = base_delay_ms;
            }
            if let Some(timeout_secs) = publisher.timeout_secs {
                self.publisher.timeout_secs = timeout_secs;
            }
            if let Some(relay_interval_ms) = publisher.relay_interval_ms {
                self.publisher.relay_interval_ms = relay_interval_ms;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("LEAVEGATE_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("LEAVEGATE_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("LEAVEGATE_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("LEAVEGATE_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("LEAVEGATE_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("LEAVEGATE_ADMISSION_MINIMUM_AVAILABLE") {
            self.admission.minimum_available =
                parse_u32("LEAVEGATE_ADMISSION_MINIMUM_AVAILABLE", &value)?;
        }
        if let Some(value) = read_env("LEAVEGATE_ADMISSION_TOTAL_EMPLOYEES") {
            self.admission.total_employees =
                Some(parse_u32("LEAVEGATE_ADMISSION_TOTAL_EMPLOYEES", &value)?);
        }
        if let Some(value) = read_env("LEAVEGATE_ADMISSION_MAX_COMMIT_ATTEMPTS") {
            self.admission.max_commit_attempts =
                parse_u32("LEAVEGATE_ADMISSION_MAX_COMMIT_ATTEMPTS", &value)?;
        }
        if let Some(value) = read_env("LEAVEGATE_ADMISSION_BACKOFF_BASE_MS") {
            self.admission.backoff_base_ms =
                parse_u64("LEAVEGATE_ADMISSION_BACKOFF_BASE_MS", &value)?;
        }
        if let Some(value) = read_env("LEAVEGATE_ADMISSION_BACKOFF_MAX_MS") {
            self.admission.backoff_max_ms =
                parse_u64("LEAVEGATE_ADMISSION_BACKOFF_MAX_MS", &value)?;
        }
        if let Some(value) = read_env("LEAVEGATE_ADMISSION_HANDLE_TIMEOUT_MS") {
            self.admission.handle_timeout_ms =
                parse_u64("LEAVEGATE_ADMISSION_HANDLE_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = read_env("LEAVEGATE_ADMISSION_LEDGER_MODE") {
            self.admission.ledger_mode = value.parse()?;
        }
        if let Some(value) = read_env("LEAVEGATE_ADMISSION_LEDGER_RETENTION_HOURS") {
            self.admission.ledger_retention_hours =
                parse_u64("LEAVEGATE_ADMISSION_LEDGER_RETENTION_HOURS", &value)?;
        }
        if let Some(value) = read_env("LEAVEGATE_ADMISSION_REVIEW_LEAVE_TYPES") {
            self.admission.review_leave_types =
                normalize_leave_types(value.split(',').map(str::to_string).collect());
        }

        if let Some(value) = read_env("LEAVEGATE_CONSUMER_PARTITIONS") {
            self.consumer.partitions = parse_u32("LEAVEGATE_CONSUMER_PARTITIONS", &value)?;
        }
        if let Some(value) = read_env("LEAVEGATE_CONSUMER_CHANNEL_CAPACITY") {
            self.consumer.channel_capacity =
                parse_u32("LEAVEGATE_CONSUMER_CHANNEL_CAPACITY", &value)?;
        }
        if let Some(value) = read_env("LEAVEGATE_CONSUMER_REPLAY_PATH") {
            self.consumer.replay_path = Some(PathBuf::from(value));
        }
        if let Some(value) = read_env("LEAVEGATE_CONSUMER_TRANSIENT_RETRY_LIMIT") {
            self.consumer.transient_retry_limit =
                parse_u32("LEAVEGATE_CONSUMER_TRANSIENT_RETRY_LIMIT", &value)?;
        }

        if let Some(value) = read_env("LEAVEGATE_PUBLISHER_WEBHOOK_URL") {
            self.publisher.webhook_url = Some(value);
        }
        if let Some(value) = read_env("LEAVEGATE_PUBLISHER_WEBHOOK_SECRET") {
            self.publisher.webhook_secret = Some(value.into());
        }
        if let Some(value) = read_env("LEAVEGATE_PUBLISHER_MAX_RETRIES") {
            self.publisher.max_retries = parse_u32("LEAVEGATE_PUBLISHER_MAX_RETRIES", &value)?;
        }
        if let Some(value) = read_env("LEAVEGATE_PUBLISHER_BASE_DELAY_MS") {
            self.publisher.base_delay_ms =
                parse_u64("LEAVEGATE_PUBLISHER_BASE_DELAY_MS", &value)?;
        }
        if let Some(value) = read_env("LEAVEGATE_PUBLISHER_TIMEOUT_SECS") {
            self.publisher.timeout_secs = parse_u64("LEAVEGATE_PUBLISHER_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("LEAVEGATE_PUBLISHER_RELAY_INTERVAL_MS") {
            self.publisher.relay_interval_ms =
                parse_u64("LEAVEGATE_PUBLISHER_RELAY_INTERVAL_MS", &value)?;
        }

        if let Some(value) = read_env("LEAVEGATE_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("LEAVEGATE_SERVER_PORT") {
            self.server.port = parse_u16("LEAVEGATE_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("LEAVEGATE_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("LEAVEGATE_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        let log_level =
            read_env("LEAVEGATE_LOGGING_LEVEL").or_else(|| read_env("LEAVEGATE_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("LEAVEGATE_LOGGING_FORMAT").or_else(|| read_env("LEAVEGATE_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(minimum_available) = overrides.minimum_available {
            self.admission.minimum_available = minimum_available;
        }
        if let Some(total_employees) = overrides.total_employees {
            self.admission.total_employees = Some(total_employees);
        }
        if let Some(ledger_mode) = overrides.ledger_mode {
            self.admission.ledger_mode = ledger_mode;
        }
        if let Some(partitions) = overrides.partitions {
            self.consumer.partitions = partitions;
        }
        if let Some(replay_path) = overrides.replay_path {
            self.consumer.replay_path = Some(replay_path);
        }
        if let Some(webhook_url) = overrides.webhook_url {
            self.publisher.webhook_url = Some(webhook_url);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_admission(&self.admission)?;
        validate_consumer(&self.consumer)?;
        validate_publisher(&self.publisher)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("leavegate.toml"), PathBuf::from("config/leavegate.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn normalize_leave_types(values: Vec<String>) -> Vec<String> {
    let mut normalized: Vec<String> = values
        .into_iter()
        .map(|value| value.trim().to_ascii_lowercase())
        .filter(|value| !value.is_empty())
        .collect();
    normalized.sort();
    normalized.dedup();
    normalized
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_admission(admission: &AdmissionConfig) -> Result<(), ConfigError> {
    if let Some(total) = admission.total_employees {
        if total == 0 {
            return Err(ConfigError::Validation(
                "admission.total_employees must be greater than zero when set".to_string(),
            ));
        }
        if admission.minimum_available > total {
            return Err(ConfigError::Validation(format!(
                "admission.minimum_available ({}) cannot exceed admission.total_employees ({total})",
                admission.minimum_available
            )));
        }
    }

    if admission.max_commit_attempts == 0 || admission.max_commit_attempts > 50 {
        return Err(ConfigError::Validation(
            "admission.max_commit_attempts must be in range 1..=50".to_string(),
        ));
    }

    if admission.backoff_base_ms > admission.backoff_max_ms {
        return Err(ConfigError::Validation(
            "admission.backoff_base_ms must not exceed admission.backoff_max_ms".to_string(),
        ));
    }

    if admission.handle_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "admission.handle_timeout_ms must be greater than zero".to_string(),
        ));
    }

    if admission.ledger_retention_hours == 0 {
        return Err(ConfigError::Validation(
            "admission.ledger_retention_hours must cover the stream redelivery window (>= 1)"
                .to_string(),
        ));
    }

    Ok(())
}

fn validate_consumer(consumer: &ConsumerConfig) -> Result<(), ConfigError> {
    if consumer.partitions == 0 || consumer.partitions > 256 {
        return Err(ConfigError::Validation(
            "consumer.partitions must be in range 1..=256".to_string(),
        ));
    }

    if consumer.channel_capacity == 0 {
        return Err(ConfigError::Validation(
            "consumer.channel_capacity must be greater than zero".to_string(),
        ));
    }

    if consumer.transient_retry_limit == 0 {
        return Err(ConfigError::Validation(
            "consumer.transient_retry_limit must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_publisher(publisher: &PublisherConfig) -> Result<(), ConfigError> {
    if let Some(url) = &publisher.webhook_url {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ConfigError::Validation(
                "publisher.webhook_url must start with http:// or https://".to_string(),
            ));
        }
    }

    if publisher.webhook_secret.is_some() && publisher.webhook_url.is_none() {
        return Err(ConfigError::Validation(
            "publisher.webhook_secret is set but publisher.webhook_url is missing".to_string(),
        ));
    }

    if publisher.timeout_secs == 0 || publisher.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "publisher.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if publisher.relay_interval_ms == 0 || publisher.relay_interval_ms > 60_000 {
        return Err(ConfigError::Validation(
            "publisher.relay_interval_ms must be in range 1..=60000".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    admission: Option<AdmissionPatch>,
    consumer: Option<ConsumerPatch>,
    publisher: Option<PublisherPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct AdmissionPatch {
    minimum_available: Option<u32>,
    total_employees: Option<u32>,
    max_commit_attempts: Option<u32>,
    backoff_base_ms: Option<u64>,
    backoff_max_ms: Option<u64>,
    handle_timeout_ms: Option<u64>,
    ledger_mode: Option<LedgerMode>,
    ledger_retention_hours: Option<u64>,
    review_leave_types: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct ConsumerPatch {
    partitions: Option<u32>,
    channel_capacity: Option<u32>,
    replay_path: Option<PathBuf>,
    transient_retry_limit: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct PublisherPatch {
    webhook_url: Option<String>,
    webhook_secret: Option<String>,
    max_retries: Option<u32>,
    base_delay_ms: Option<u64>,
    timeout_secs: Option<u64>,
    relay_interval_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
