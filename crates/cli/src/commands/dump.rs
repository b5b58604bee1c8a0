use serde::Serialize;
use stepledger_core::config::LoadOptions;
use stepledger_core::TaskId;

use crate::commands::{
    engine_failure, open_engine, run_with_runtime, CommandFailure, CommandResult, EXIT_ENGINE,
};

/// Pretty JSON of every task and its steps, or of a single task.
pub fn run(options: LoadOptions, task_id: Option<String>) -> CommandResult {
    run_with_runtime("dump", options, |config| async move {
        let (pool, engine) = open_engine(&config).await?;
        let rendered = match task_id {
            Some(task_id) => engine
                .task_snapshot(&TaskId(task_id))
                .await
                .map_err(engine_failure)
                .and_then(|snapshot| to_pretty(&snapshot)),
            None => engine
                .snapshot()
                .await
                .map_err(engine_failure)
                .and_then(|snapshots| to_pretty(&snapshots)),
        };
        pool.close().await;

        Ok(CommandResult { exit_code: 0, output: rendered? })
    })
}

fn to_pretty<T: Serialize>(value: &T) -> Result<String, CommandFailure> {
    serde_json::to_string_pretty(value)
        .map_err(|error| ("serialization", error.to_string(), EXIT_ENGINE))
}
