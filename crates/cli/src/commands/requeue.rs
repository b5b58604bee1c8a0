use serde_json::json;
use stepledger_core::config::LoadOptions;
use stepledger_core::{StepKey, TaskId};

use crate::commands::{engine_failure, open_engine, run_with_runtime, CommandResult};

/// Send a failed step back to the queue.
pub fn run(options: LoadOptions, task_id: String, step_idx: u32) -> CommandResult {
    let key = StepKey::new(TaskId(task_id), step_idx);

    run_with_runtime("requeue", options, |config| async move {
        let (pool, engine) = open_engine(&config).await?;
        let requeued = engine.requeue(&key).await;
        pool.close().await;

        let step = requeued.map_err(engine_failure)?;
        Ok(CommandResult::success_with_data(
            "requeue",
            format!("step {} returned to the queue", step.key()),
            Some(json!({
                "task_id": step.task_id,
                "step_idx": step.step_idx,
                "retry_count": step.retry_count,
            })),
        ))
    })
}
