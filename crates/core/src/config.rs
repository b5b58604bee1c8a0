use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::EngineSettings;
use crate::worker::WorkerSettings;

pub const DEFAULT_CONFIG_FILE: &str = "stepledger.toml";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub engine: EngineConfig,
    pub worker: WorkerConfig,
    pub results: ResultsConfig,
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
pub struct EngineConfig {
    pub lease_duration_secs: u64,
    pub stale_threshold_secs: u64,
    pub reaper_interval_secs: u64,
    pub explicit_failure_retries: u32,
    pub conflict_retry_limit: u32,
}

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub heartbeat_interval_ms: u64,
    pub poll_interval_min_ms: u64,
    pub poll_interval_max_ms: u64,
    pub id_prefix: String,
}

#[derive(Clone, Debug)]
pub struct ResultsConfig {
    pub root: PathBuf,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub metrics_port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
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
    pub results_root: Option<PathBuf>,
    pub worker_concurrency: Option<usize>,
    pub stale_threshold_secs: Option<u64>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("`{path}` is not valid config TOML: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("config file `{0}` does not exist")]
    MissingConfigFile(PathBuf),
    #[error("`${{{var}}}` is referenced in the config file but not set")]
    MissingEnvInterpolation { var: String },
    #[error("`${{` without a closing `}}` in the config file")]
    UnterminatedInterpolation,
    #[error("{key}={value} cannot be parsed")]
    InvalidEnvOverride { key: String, value: String },
    #[error("invalid configuration: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://stepledger.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            engine: EngineConfig {
                lease_duration_secs: 30,
                stale_threshold_secs: 30,
                reaper_interval_secs: 5,
                explicit_failure_retries: 0,
                conflict_retry_limit: 32,
            },
            worker: WorkerConfig {
                concurrency: 4,
                heartbeat_interval_ms: 5_000,
                poll_interval_min_ms: 50,
                poll_interval_max_ms: 2_000,
                id_prefix: "worker".to_string(),
            },
            results: ResultsConfig { root: PathBuf::from("stepledger-results") },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                metrics_port: 9464,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl FromStr for LogFormat {
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
            let expected =
                options.config_path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.engine.lease_duration_secs)
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.engine.stale_threshold_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.engine.reaper_interval_secs)
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            default_lease: self.lease_duration(),
            explicit_failure_retries: self.engine.explicit_failure_retries,
            conflict_retry_limit: self.engine.conflict_retry_limit,
            ..EngineSettings::default()
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            lease_duration: self.lease_duration(),
            heartbeat_interval: Duration::from_millis(self.worker.heartbeat_interval_ms),
            poll_interval_min: Duration::from_millis(self.worker.poll_interval_min_ms),
            poll_interval_max: Duration::from_millis(self.worker.poll_interval_max_ms),
        }
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        let ConfigPatch { database, engine, worker, results, server, logging } = patch;

        if let Some(patch) = database {
            merge(&mut self.database.url, patch.url);
            merge(&mut self.database.max_connections, patch.max_connections);
            merge(&mut self.database.timeout_secs, patch.timeout_secs);
        }
        if let Some(patch) = engine {
            merge(&mut self.engine.lease_duration_secs, patch.lease_duration_secs);
            merge(&mut self.engine.stale_threshold_secs, patch.stale_threshold_secs);
            merge(&mut self.engine.reaper_interval_secs, patch.reaper_interval_secs);
            merge(&mut self.engine.explicit_failure_retries, patch.explicit_failure_retries);
            merge(&mut self.engine.conflict_retry_limit, patch.conflict_retry_limit);
        }
        if let Some(patch) = worker {
            merge(&mut self.worker.concurrency, patch.concurrency);
            merge(&mut self.worker.heartbeat_interval_ms, patch.heartbeat_interval_ms);
            merge(&mut self.worker.poll_interval_min_ms, patch.poll_interval_min_ms);
            merge(&mut self.worker.poll_interval_max_ms, patch.poll_interval_max_ms);
            merge(&mut self.worker.id_prefix, patch.id_prefix);
        }
        if let Some(patch) = results {
            merge(&mut self.results.root, patch.root);
        }
        if let Some(patch) = server {
            merge(&mut self.server.bind_address, patch.bind_address);
            merge(&mut self.server.metrics_port, patch.metrics_port);
            merge(&mut self.server.graceful_shutdown_secs, patch.graceful_shutdown_secs);
        }
        if let Some(patch) = logging {
            merge(&mut self.logging.level, patch.level);
            merge(&mut self.logging.format, patch.format);
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        env_override("STEPLEDGER_DATABASE_URL", &mut self.database.url)?;
        env_override("STEPLEDGER_DATABASE_MAX_CONNECTIONS", &mut self.database.max_connections)?;
        env_override("STEPLEDGER_DATABASE_TIMEOUT_SECS", &mut self.database.timeout_secs)?;

        env_override("STEPLEDGER_ENGINE_LEASE_DURATION_SECS", &mut self.engine.lease_duration_secs)?;
        env_override(
            "STEPLEDGER_ENGINE_STALE_THRESHOLD_SECS",
            &mut self.engine.stale_threshold_secs,
        )?;
        env_override(
            "STEPLEDGER_ENGINE_REAPER_INTERVAL_SECS",
            &mut self.engine.reaper_interval_secs,
        )?;
        env_override(
            "STEPLEDGER_ENGINE_EXPLICIT_FAILURE_RETRIES",
            &mut self.engine.explicit_failure_retries,
        )?;
        env_override(
            "STEPLEDGER_ENGINE_CONFLICT_RETRY_LIMIT",
            &mut self.engine.conflict_retry_limit,
        )?;

        env_override("STEPLEDGER_WORKER_CONCURRENCY", &mut self.worker.concurrency)?;
        env_override(
            "STEPLEDGER_WORKER_HEARTBEAT_INTERVAL_MS",
            &mut self.worker.heartbeat_interval_ms,
        )?;
        env_override(
            "STEPLEDGER_WORKER_POLL_INTERVAL_MIN_MS",
            &mut self.worker.poll_interval_min_ms,
        )?;
        env_override(
            "STEPLEDGER_WORKER_POLL_INTERVAL_MAX_MS",
            &mut self.worker.poll_interval_max_ms,
        )?;
        env_override("STEPLEDGER_WORKER_ID_PREFIX", &mut self.worker.id_prefix)?;

        env_override("STEPLEDGER_RESULTS_ROOT", &mut self.results.root)?;

        env_override("STEPLEDGER_SERVER_BIND_ADDRESS", &mut self.server.bind_address)?;
        env_override("STEPLEDGER_SERVER_METRICS_PORT", &mut self.server.metrics_port)?;
        env_override(
            "STEPLEDGER_SERVER_GRACEFUL_SHUTDOWN_SECS",
            &mut self.server.graceful_shutdown_secs,
        )?;

        // The short LOG_* spellings are accepted as fallbacks.
        if !env_override("STEPLEDGER_LOGGING_LEVEL", &mut self.logging.level)? {
            env_override("STEPLEDGER_LOG_LEVEL", &mut self.logging.level)?;
        }
        if !env_override("STEPLEDGER_LOGGING_FORMAT", &mut self.logging.format)? {
            env_override("STEPLEDGER_LOG_FORMAT", &mut self.logging.format)?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        merge(&mut self.database.url, overrides.database_url);
        merge(&mut self.logging.level, overrides.log_level);
        merge(&mut self.results.root, overrides.results_root);
        merge(&mut self.worker.concurrency, overrides.worker_concurrency);
        merge(&mut self.engine.stale_threshold_secs, overrides.stale_threshold_secs);
    }

    /// Reject combinations the engine cannot run with. The heartbeat must
    /// fit three times into both the lease and the reclaim threshold.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let Self { database, engine, worker, results, server, logging } = self;
        let url = database.url.trim();
        let heartbeat_window_ms = worker.heartbeat_interval_ms.saturating_mul(3);

        let rules: [(bool, &str); 16] = [
            (
                url.starts_with("sqlite:") || url == ":memory:",
                "database.url: only sqlite URLs are supported",
            ),
            (database.max_connections > 0, "database.max_connections: must be positive"),
            ((1..=300).contains(&database.timeout_secs), "database.timeout_secs: expected 1..=300"),
            (engine.lease_duration_secs > 0, "engine.lease_duration_secs: must be positive"),
            (engine.stale_threshold_secs > 0, "engine.stale_threshold_secs: must be positive"),
            (engine.reaper_interval_secs > 0, "engine.reaper_interval_secs: must be positive"),
            ((1..=256).contains(&worker.concurrency), "worker.concurrency: expected 1..=256"),
            (worker.heartbeat_interval_ms > 0, "worker.heartbeat_interval_ms: must be positive"),
            (
                heartbeat_window_ms <= engine.lease_duration_secs.saturating_mul(1_000),
                "worker.heartbeat_interval_ms: more than a third of engine.lease_duration_secs",
            ),
            (
                heartbeat_window_ms <= engine.stale_threshold_secs.saturating_mul(1_000),
                "worker.heartbeat_interval_ms: more than a third of engine.stale_threshold_secs",
            ),
            (worker.poll_interval_min_ms > 0, "worker.poll_interval_min_ms: must be positive"),
            (
                worker.poll_interval_min_ms <= worker.poll_interval_max_ms,
                "worker.poll_interval_min_ms: above worker.poll_interval_max_ms",
            ),
            (!worker.id_prefix.trim().is_empty(), "worker.id_prefix: must not be blank"),
            (!results.root.as_os_str().is_empty(), "results.root: must not be empty"),
            (
                server.metrics_port > 0 && server.graceful_shutdown_secs > 0,
                "server: metrics_port and graceful_shutdown_secs must be positive",
            ),
            (
                matches!(
                    logging.level.trim().to_ascii_lowercase().as_str(),
                    "trace" | "debug" | "info" | "warn" | "error"
                ),
                "logging.level: expected trace, debug, info, warn or error",
            ),
        ];

        match rules.into_iter().find(|(ok, _)| !ok) {
            Some((_, message)) => Err(ConfigError::Validation(message.to_string())),
            None => Ok(()),
        }
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from(DEFAULT_CONFIG_FILE), Path::new("config").join(DEFAULT_CONFIG_FILE)]
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

/// Expand `${VAR}` references from the process environment.
fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(open) = rest.find("${") {
        output.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];
        let close = after_open.find('}').ok_or(ConfigError::UnterminatedInterpolation)?;
        let var = &after_open[..close];
        let value = env::var(var)
            .map_err(|_| ConfigError::MissingEnvInterpolation { var: var.to_string() })?;
        output.push_str(&value);
        rest = &after_open[close + 1..];
    }
    output.push_str(rest);

    Ok(output)
}

fn merge<T>(target: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *target = value;
    }
}

/// Overwrite `target` from `key` when the variable is set and non-blank.
/// Returns whether an override was applied.
fn env_override<T>(key: &str, target: &mut T) -> Result<bool, ConfigError>
where
    T: FromStr,
{
    let Some(raw) = env::var(key).ok().filter(|value| !value.trim().is_empty()) else {
        return Ok(false);
    };
    *target = raw
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnvOverride { key: key.to_string(), value: raw.clone() })?;
    Ok(true)
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    engine: Option<EnginePatch>,
    worker: Option<WorkerPatch>,
    results: Option<ResultsPatch>,
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
struct EnginePatch {
    lease_duration_secs: Option<u64>,
    stale_threshold_secs: Option<u64>,
    reaper_interval_secs: Option<u64>,
    explicit_failure_retries: Option<u32>,
    conflict_retry_limit: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct WorkerPatch {
    concurrency: Option<usize>,
    heartbeat_interval_ms: Option<u64>,
    poll_interval_min_ms: Option<u64>,
    poll_interval_max_ms: Option<u64>,
    id_prefix: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ResultsPatch {
    root: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    metrics_port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
