//! OTA Tool CLI entry point

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ota_tool::{Cli, ExitCode};
use ota_updater::UpdateConfig;

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    let config = match cli.config.as_deref() {
        Some(path) => match UpdateConfig::load_from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error: {e}");
                return ExitCode::InvalidInput.to_exit_code();
            }
        },
        None => UpdateConfig::default(),
    };

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else if cli.verbose {
        EnvFilter::new("info")
    } else {
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.execute_with_config(config).await {
        Ok(code) => code.to_exit_code(),
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::GeneralError.to_exit_code()
        }
    }
}
