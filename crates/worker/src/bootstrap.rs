use std::sync::Arc;

use stepledger_core::config::{AppConfig, ConfigError};
use stepledger_core::errors::RegistryError;
use stepledger_core::{FsResultStore, HandlerRegistry, QueueEngine, Reaper, ResultStore, Worker};
use stepledger_db::{connect_with_settings, migrations, DbPool, SqliteKvStore};
use thiserror::Error;
use tracing::info;

use crate::handlers;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub engine: QueueEngine,
    pub registry: Arc<HandlerRegistry>,
    pub results: Arc<dyn ResultStore>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("handler registration failed: {0}")]
    Registry(#[from] RegistryError),
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(event_name = "system.bootstrap.start", "starting worker bootstrap");

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(event_name = "system.bootstrap.database_connected", "database connection established");

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(event_name = "system.bootstrap.migrations_applied", "database migrations applied");

    let mut registry = HandlerRegistry::new();
    handlers::register_builtin(&mut registry)?;
    info!(
        event_name = "system.bootstrap.handlers_registered",
        handlers = ?registry.names(),
        "step handlers registered"
    );

    let engine = QueueEngine::new(Arc::new(SqliteKvStore::new(db_pool.clone())))
        .with_settings(config.engine_settings());
    let results: Arc<dyn ResultStore> = Arc::new(FsResultStore::new(config.results.root.clone()));

    Ok(Application { config, db_pool, engine, registry: Arc::new(registry), results })
}

impl Application {
    /// One worker per configured concurrency slot, ids unique to this process.
    pub fn workers(&self) -> Vec<Worker> {
        let pid = std::process::id();
        (0..self.config.worker.concurrency)
            .map(|slot| {
                Worker::new(
                    format!("{}-{pid}-{slot}", self.config.worker.id_prefix),
                    self.engine.clone(),
                    Arc::clone(&self.registry),
                    Arc::clone(&self.results),
                    self.config.worker_settings(),
                )
            })
            .collect()
    }

    pub fn reaper(&self) -> Reaper {
        Reaper::new(self.engine.clone(), self.config.stale_threshold())
    }
}

#[cfg(test)]
mod tests {
    use stepledger_core::config::{AppConfig, ConfigOverrides, LoadOptions};
    use tempfile::TempDir;

    use crate::bootstrap::{bootstrap_with_config, Application, BootstrapError};

    async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
        bootstrap_with_config(AppConfig::load(options)?).await
    }

    fn options(dir: &TempDir, database_url: Option<String>) -> LoadOptions {
        LoadOptions {
            config_path: Some(dir.path().join("absent.toml")),
            overrides: ConfigOverrides {
                database_url: Some(database_url.unwrap_or_else(|| {
                    format!("sqlite://{}", dir.path().join("worker.db").display())
                })),
                results_root: Some(dir.path().join("results")),
                worker_concurrency: Some(3),
                log_level: Some("info".to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        }
    }

    #[tokio::test]
    async fn bootstrap_prepares_database_handlers_and_workers() {
        let dir = TempDir::new().expect("tempdir");
        let app = bootstrap(options(&dir, None)).await.expect("bootstrap should succeed");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'kv'",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("kv table lookup");
        assert_eq!(table_count, 1);

        for name in ["git.list_commits", "git.commit_meta", "shell.exec", "noop"] {
            assert!(app.registry.contains(name), "missing handler {name}");
        }

        let workers = app.workers();
        assert_eq!(workers.len(), 3);
        let ids: std::collections::HashSet<_> = workers.iter().map(|w| w.id().to_owned()).collect();
        assert_eq!(ids.len(), 3, "worker ids must be unique");

        app.db_pool.close().await;
    }

    #[tokio::test]
    async fn bootstrap_rejects_invalid_config() {
        let dir = TempDir::new().expect("tempdir");
        let result = bootstrap(options(&dir, Some("mysql://nope".to_string()))).await;
        assert!(matches!(result, Err(BootstrapError::Config(_))));
    }
}
