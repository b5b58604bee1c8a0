use stepledger_core::config::LoadOptions;

use crate::commands::{open_pool, run_with_runtime, CommandResult};

pub fn run(options: LoadOptions) -> CommandResult {
    run_with_runtime("migrate", options, |config| async move {
        let pool = open_pool(&config).await?;
        pool.close().await;
        Ok(CommandResult::success("migrate", "applied pending migrations"))
    })
}
