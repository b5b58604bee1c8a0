use serde_json::{json, Value};
use stepledger_core::config::LoadOptions;
use stepledger_core::Priority;

use crate::commands::{engine_failure, open_engine, run_with_runtime, CommandResult, EXIT_CONFIG};

#[derive(Debug, Clone)]
pub struct EnqueueArgs {
    pub name: String,
    pub handler: String,
    pub input: String,
    pub priority: Option<u32>,
}

/// Create a task holding one root step.
pub fn run(options: LoadOptions, args: EnqueueArgs) -> CommandResult {
    let input = match serde_json::from_str::<Value>(&args.input) {
        Ok(input) => input,
        Err(error) => {
            return CommandResult::failure(
                "enqueue",
                "invalid_input",
                format!("--input is not valid JSON: {error}"),
                EXIT_CONFIG,
            );
        }
    };

    run_with_runtime("enqueue", options, |config| async move {
        let (pool, engine) = open_engine(&config).await?;
        let created = async {
            let mut builder = engine.create_task(args.name).await?;
            if let Some(priority) = args.priority {
                builder = builder.with_priority(Priority(priority));
            }
            let builder = builder.add_step(args.handler, input).await?;
            let steps = builder.steps().to_vec();
            let task = builder.build().await?;
            Ok::<_, stepledger_core::EngineError>((task, steps))
        }
        .await;
        pool.close().await;

        let (task, steps) = created.map_err(engine_failure)?;
        let step_idx = steps.first().map(|key| key.step_idx).unwrap_or_default();
        Ok(CommandResult::success_with_data(
            "enqueue",
            format!("task {} enqueued", task.task_id),
            Some(json!({ "task_id": task.task_id, "step_idx": step_idx })),
        ))
    })
}
