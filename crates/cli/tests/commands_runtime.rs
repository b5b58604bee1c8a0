use std::env;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use serde_json::Value;
use stepledger_cli::commands::enqueue::EnqueueArgs;
use stepledger_cli::commands::{config, dump, enqueue, migrate, reap, requeue};
use stepledger_core::config::{ConfigOverrides, LoadOptions};
use tempfile::TempDir;

fn options_for(dir: &Path) -> LoadOptions {
    LoadOptions {
        config_path: Some(dir.join("absent.toml")),
        require_file: false,
        overrides: ConfigOverrides {
            database_url: Some(format!("sqlite://{}", dir.join("cli.db").display())),
            results_root: Some(dir.join("results")),
            log_level: Some("info".to_string()),
            ..ConfigOverrides::default()
        },
    }
}

fn enqueue_args(handler: &str, input: &str) -> EnqueueArgs {
    EnqueueArgs {
        name: "cli-task".to_string(),
        handler: handler.to_string(),
        input: input.to_string(),
        priority: None,
    }
}

#[test]
fn migrate_returns_success_for_a_fresh_database() {
    let dir = TempDir::new().expect("tempdir");
    let result = migrate::run(options_for(dir.path()));
    assert_eq!(result.exit_code, 0, "expected successful migrate run: {}", result.output);

    let payload = parse_payload(&result.output);
    assert_eq!(payload["command"], "migrate");
    assert_eq!(payload["status"], "ok");
}

#[test]
fn migrate_rejects_a_non_sqlite_url() {
    let dir = TempDir::new().expect("tempdir");
    let mut options = options_for(dir.path());
    options.overrides.database_url = Some("postgres://localhost/stepledger".to_string());

    let result = migrate::run(options);
    assert_eq!(result.exit_code, 2, "expected config validation failure code");

    let payload = parse_payload(&result.output);
    assert_eq!(payload["status"], "error");
    assert_eq!(payload["error_class"], "config_validation");
}

#[test]
fn enqueue_then_dump_shows_the_pending_step() {
    let dir = TempDir::new().expect("tempdir");
    let result = enqueue::run(options_for(dir.path()), enqueue_args("noop", r#"{"n":1}"#));
    assert_eq!(result.exit_code, 0, "{}", result.output);

    let payload = parse_payload(&result.output);
    assert_eq!(payload["command"], "enqueue");
    let task_id = payload["data"]["task_id"].as_str().expect("task id").to_string();
    assert_eq!(payload["data"]["step_idx"], 0);

    let dumped = dump::run(options_for(dir.path()), Some(task_id.clone()));
    assert_eq!(dumped.exit_code, 0, "{}", dumped.output);

    let snapshot = parse_payload(&dumped.output);
    assert_eq!(snapshot["task"]["task_id"], task_id.as_str());
    assert_eq!(snapshot["task"]["status"], "pending");
    assert_eq!(snapshot["steps"][0]["handler_name"], "noop");
    assert_eq!(snapshot["steps"][0]["status"], "pending");

    let everything = dump::run(options_for(dir.path()), None);
    let all = parse_payload(&everything.output);
    assert_eq!(all.as_array().map(Vec::len), Some(1));
}

#[test]
fn enqueue_rejects_malformed_input_json() {
    let dir = TempDir::new().expect("tempdir");
    let result = enqueue::run(options_for(dir.path()), enqueue_args("noop", "{not json"));
    assert_eq!(result.exit_code, 2);

    let payload = parse_payload(&result.output);
    assert_eq!(payload["error_class"], "invalid_input");
}

#[test]
fn requeue_of_a_pending_step_is_an_invalid_transition() {
    let dir = TempDir::new().expect("tempdir");
    let created = enqueue::run(options_for(dir.path()), enqueue_args("noop", "{}"));
    let task_id =
        parse_payload(&created.output)["data"]["task_id"].as_str().expect("task id").to_string();

    let result = requeue::run(options_for(dir.path()), task_id, 0);
    assert_eq!(result.exit_code, 6);

    let payload = parse_payload(&result.output);
    assert_eq!(payload["command"], "requeue");
    assert_eq!(payload["error_class"], "invalid_transition");
}

#[test]
fn requeue_of_an_unknown_step_is_not_found() {
    let dir = TempDir::new().expect("tempdir");
    let result = requeue::run(options_for(dir.path()), "missing".to_string(), 0);
    assert_eq!(result.exit_code, 6);
    assert_eq!(parse_payload(&result.output)["error_class"], "not_found");
}

#[test]
fn dump_of_an_unknown_task_is_not_found() {
    let dir = TempDir::new().expect("tempdir");
    let result = dump::run(options_for(dir.path()), Some("missing".to_string()));
    assert_eq!(result.exit_code, 6);
    assert_eq!(parse_payload(&result.output)["error_class"], "not_found");
}

#[test]
fn reap_on_an_idle_queue_reclaims_nothing() {
    let dir = TempDir::new().expect("tempdir");
    enqueue::run(options_for(dir.path()), enqueue_args("noop", "{}"));

    let result = reap::run(options_for(dir.path()), Some(1));
    assert_eq!(result.exit_code, 0, "{}", result.output);

    let payload = parse_payload(&result.output);
    assert_eq!(payload["command"], "reap");
    assert_eq!(payload["data"]["threshold_secs"], 1);
    assert_eq!(payload["data"]["steps"].as_array().map(Vec::len), Some(0));
}

#[test]
fn config_attributes_env_and_override_sources() {
    with_env(&[("STEPLEDGER_WORKER_CONCURRENCY", "7")], || {
        let dir = TempDir::new().expect("tempdir");
        let output = config::run(options_for(dir.path()));

        assert!(output.contains(
            "- worker.concurrency = 7 (source: env (STEPLEDGER_WORKER_CONCURRENCY))"
        ));
        assert!(output.contains("database.url = sqlite://"));
        assert!(output.contains("(source: override (command line))"));
        assert!(output.contains("- engine.lease_duration_secs = 30 (source: default)"));
    });
}

#[test]
fn config_reports_validation_failures() {
    with_env(&[("STEPLEDGER_LOGGING_LEVEL", "chatty")], || {
        let dir = TempDir::new().expect("tempdir");
        let mut options = options_for(dir.path());
        options.overrides.log_level = None;
        let output = config::run(options);
        assert!(output.starts_with("config validation failed"), "{output}");
    });
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid json")
}

fn with_env(vars: &[(&str, &str)], test: impl FnOnce()) {
    let _guard = env_lock().lock().expect("lock env");

    let keys = [
        "STEPLEDGER_WORKER_CONCURRENCY",
        "STEPLEDGER_LOGGING_LEVEL",
        "STEPLEDGER_LOG_LEVEL",
        "STEPLEDGER_DATABASE_URL",
    ];

    let snapshot: Vec<(String, Option<String>)> =
        keys.iter().map(|key| ((*key).to_string(), env::var(key).ok())).collect();

    for key in keys {
        env::remove_var(key);
    }
    for (key, value) in vars {
        env::set_var(key, value);
    }

    test();

    for (key, value) in snapshot {
        if let Some(value) = value {
            env::set_var(&key, value);
        } else {
            env::remove_var(&key);
        }
    }
}

fn env_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}
