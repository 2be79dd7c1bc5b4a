//! ADW ingest - Main entry point

use adw_common::logging::{init_logging, LogConfig, LogOutput};
use adw_ingest::cli::{execute, exit_code_for, Cli};
use clap::Parser;
use std::process;
use tracing::{error, Level};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_config = LogConfig::for_binary("adw-ingest")
        .with_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .with_output(LogOutput::Console);

    // Environment variables take precedence over flags
    let log_config = match log_config.clone().with_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Warning: ignoring invalid logging environment: {}", e);
            log_config
        },
    };

    let guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: logging disabled: {:#}", e);
            None
        },
    };

    let code = match execute(&cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {}", e);
            exit_code_for(&e)
        },
    };

    // process::exit skips destructors; flush file output first
    drop(guard);
    process::exit(code);
}
