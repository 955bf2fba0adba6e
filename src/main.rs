use colored::Colorize;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match fuzzyflow::run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {}", "Error:".bright_red().bold(), e);
            ExitCode::FAILURE
        }
    }
}
