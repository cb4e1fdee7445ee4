//! WISE-4050 sensor command line entry point

use anyhow::Context;
use clap::Parser;
use tracing::error;

use common::{init_logging, LogConfig, LogFormat};
use wisesrv::cli::{run, Cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let format: LogFormat = cli
        .log_format
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;
    let log_config = LogConfig {
        service_name: "wisesrv".to_string(),
        level: cli.log_level.clone(),
        file: cli.log_file.clone(),
        format,
        ansi: !cli.no_color,
        ..LogConfig::default()
    };
    // must live until exit for file logging
    let _log_guard = init_logging(&log_config).context("Failed to initialize logging")?;

    if let Err(e) = run(cli.command).await {
        error!("{}", e);
        return Err(e.into());
    }
    Ok(())
}
