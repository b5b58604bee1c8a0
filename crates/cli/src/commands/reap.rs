use std::time::Duration;

use serde_json::json;
use stepledger_core::config::LoadOptions;

use crate::commands::{engine_failure, open_engine, run_with_runtime, CommandResult};

/// One stale-lease sweep. `threshold_secs` falls back to
/// `engine.stale_threshold_secs`.
pub fn run(options: LoadOptions, threshold_secs: Option<u64>) -> CommandResult {
    run_with_runtime("reap", options, |config| async move {
        let threshold =
            threshold_secs.map(Duration::from_secs).unwrap_or_else(|| config.stale_threshold());
        let (pool, engine) = open_engine(&config).await?;
        let reclaimed = engine.reset_stale(threshold).await;
        pool.close().await;

        let reclaimed = reclaimed.map_err(engine_failure)?;
        let steps: Vec<String> = reclaimed.iter().map(ToString::to_string).collect();
        Ok(CommandResult::success_with_data(
            "reap",
            format!("reclaimed {} stale step(s)", reclaimed.len()),
            Some(json!({ "threshold_secs": threshold.as_secs(), "steps": steps })),
        ))
    })
}
