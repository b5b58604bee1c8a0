use std::process::ExitCode;

fn main() -> ExitCode {
    stepledger_cli::run()
}
