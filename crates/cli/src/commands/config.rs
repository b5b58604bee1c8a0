use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use stepledger_core::config::{AppConfig, LoadOptions, DEFAULT_CONFIG_FILE};
use toml::Value;

/// Effective configuration, one line per field with where its value came from.
pub fn run(options: LoadOptions) -> String {
    let config_file_path = detect_config_path(options.config_path.as_deref());
    let overridden = overridden_keys(&options);
    let config = match AppConfig::load(options) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_doc = load_config_file_doc(config_file_path.as_deref());
    let source = |key_path: &str, env_key: &str| {
        if overridden.iter().any(|key| *key == key_path) {
            return "override (command line)".to_string();
        }
        field_source(key_path, Some(env_key), config_file_doc.as_ref(), config_file_path.as_deref())
    };

    let fields: Vec<(&str, String, &str)> = vec![
        ("database.url", config.database.url.clone(), "STEPLEDGER_DATABASE_URL"),
        (
            "database.max_connections",
            config.database.max_connections.to_string(),
            "STEPLEDGER_DATABASE_MAX_CONNECTIONS",
        ),
        (
            "database.timeout_secs",
            config.database.timeout_secs.to_string(),
            "STEPLEDGER_DATABASE_TIMEOUT_SECS",
        ),
        (
            "engine.lease_duration_secs",
            config.engine.lease_duration_secs.to_string(),
            "STEPLEDGER_ENGINE_LEASE_DURATION_SECS",
        ),
        (
            "engine.stale_threshold_secs",
            config.engine.stale_threshold_secs.to_string(),
            "STEPLEDGER_ENGINE_STALE_THRESHOLD_SECS",
        ),
        (
            "engine.reaper_interval_secs",
            config.engine.reaper_interval_secs.to_string(),
            "STEPLEDGER_ENGINE_REAPER_INTERVAL_SECS",
        ),
        (
            "engine.explicit_failure_retries",
            config.engine.explicit_failure_retries.to_string(),
            "STEPLEDGER_ENGINE_EXPLICIT_FAILURE_RETRIES",
        ),
        (
            "engine.conflict_retry_limit",
            config.engine.conflict_retry_limit.to_string(),
            "STEPLEDGER_ENGINE_CONFLICT_RETRY_LIMIT",
        ),
        (
            "worker.concurrency",
            config.worker.concurrency.to_string(),
            "STEPLEDGER_WORKER_CONCURRENCY",
        ),
        (
            "worker.heartbeat_interval_ms",
            config.worker.heartbeat_interval_ms.to_string(),
            "STEPLEDGER_WORKER_HEARTBEAT_INTERVAL_MS",
        ),
        (
            "worker.poll_interval_min_ms",
            config.worker.poll_interval_min_ms.to_string(),
            "STEPLEDGER_WORKER_POLL_INTERVAL_MIN_MS",
        ),
        (
            "worker.poll_interval_max_ms",
            config.worker.poll_interval_max_ms.to_string(),
            "STEPLEDGER_WORKER_POLL_INTERVAL_MAX_MS",
        ),
        ("worker.id_prefix", config.worker.id_prefix.clone(), "STEPLEDGER_WORKER_ID_PREFIX"),
        ("results.root", config.results.root.display().to_string(), "STEPLEDGER_RESULTS_ROOT"),
        (
            "server.bind_address",
            config.server.bind_address.clone(),
            "STEPLEDGER_SERVER_BIND_ADDRESS",
        ),
        (
            "server.metrics_port",
            config.server.metrics_port.to_string(),
            "STEPLEDGER_SERVER_METRICS_PORT",
        ),
        (
            "server.graceful_shutdown_secs",
            config.server.graceful_shutdown_secs.to_string(),
            "STEPLEDGER_SERVER_GRACEFUL_SHUTDOWN_SECS",
        ),
        ("logging.level", config.logging.level.clone(), "STEPLEDGER_LOGGING_LEVEL"),
        ("logging.format", format!("{:?}", config.logging.format), "STEPLEDGER_LOGGING_FORMAT"),
    ];

    let mut lines =
        vec!["effective config (source precedence: override > env > file > default):".to_string()];
    for (key, value, env_key) in fields {
        lines.push(render_line(key, &value, source(key, env_key)));
    }

    lines.join("\n")
}

fn overridden_keys(options: &LoadOptions) -> Vec<&'static str> {
    let overrides = &options.overrides;
    [
        ("database.url", overrides.database_url.is_some()),
        ("logging.level", overrides.log_level.is_some()),
        ("results.root", overrides.results_root.is_some()),
        ("worker.concurrency", overrides.worker_concurrency.is_some()),
        ("engine.stale_threshold_secs", overrides.stale_threshold_secs.is_some()),
    ]
    .into_iter()
    .filter_map(|(key, set)| set.then_some(key))
    .collect()
}

fn detect_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return path.exists().then(|| path.to_path_buf());
    }

    let root = PathBuf::from(DEFAULT_CONFIG_FILE);
    if root.exists() {
        return Some(root);
    }

    let nested = Path::new("config").join(DEFAULT_CONFIG_FILE);
    if nested.exists() {
        return Some(nested);
    }

    None
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: Option<&str>,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_key {
        if env::var_os(env_key).is_some() {
            return format!("env ({env_key})");
        }
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
