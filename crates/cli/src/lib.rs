pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use stepledger_core::config::{ConfigOverrides, LoadOptions};

use commands::enqueue::EnqueueArgs;

#[derive(Debug, Parser)]
#[command(
    name = "stepledger",
    about = "Stepledger operator CLI",
    long_about = "Apply migrations, enqueue tasks, inspect and repair the durable step queue.",
    after_help = "Examples:\n  stepledger migrate\n  stepledger enqueue --name ingest --handler git.list_commits --input '{\"repo\":\".\"}'\n  stepledger dump --task <TASK_ID>\n  stepledger requeue --task <TASK_ID> --step 3"
)]
pub struct Cli {
    #[arg(long, global = true, help = "Path to a stepledger.toml config file")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Override database.url")]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Create a task with a single root step")]
    Enqueue {
        #[arg(long, help = "Task name")]
        name: String,
        #[arg(long, help = "Registered handler name for the root step")]
        handler: String,
        #[arg(long, default_value = "{}", help = "Step input as JSON")]
        input: String,
        #[arg(long, help = "Queue priority, lower runs first (default 100)")]
        priority: Option<u32>,
    },
    #[command(about = "Print tasks and their steps as pretty JSON")]
    Dump {
        #[arg(long, help = "Only dump this task")]
        task: Option<String>,
    },
    #[command(about = "Return a failed step to the queue")]
    Requeue {
        #[arg(long, help = "Task id")]
        task: String,
        #[arg(long, help = "Step index within the task")]
        step: u32,
    },
    #[command(about = "Reclaim running steps whose worker stopped heartbeating")]
    Reap {
        #[arg(long, help = "Heartbeat age that counts as stale (defaults to engine.stale_threshold_secs)")]
        threshold_secs: Option<u64>,
    },
    #[command(about = "Inspect effective configuration values with source attribution")]
    Config,
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    let options = LoadOptions {
        require_file: cli.config.is_some(),
        config_path: cli.config,
        overrides: ConfigOverrides { database_url: cli.database_url, ..ConfigOverrides::default() },
    };

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(options),
        Command::Enqueue { name, handler, input, priority } => {
            commands::enqueue::run(options, EnqueueArgs { name, handler, input, priority })
        }
        Command::Dump { task } => commands::dump::run(options, task),
        Command::Requeue { task, step } => commands::requeue::run(options, task, step),
        Command::Reap { threshold_secs } => commands::reap::run(options, threshold_secs),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run(options) }
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
