use clap::Parser;
use log::{error, info};
use esp32_companion::cli::Cli;
use esp32_companion::error::{AppRunError, ConfigError};
use esp32_companion::{init_logging, run};

fn main() -> Result<(), AppRunError> {
    let cli = Cli::parse();
    init_logging(cli.log_level())?;
    info!(concat!("ESP32 Companion ", env!("CARGO_PKG_VERSION")));

    match run(cli) {
        Err(AppRunError::ConfigError { source: ConfigError::CanNotLock { .. } }) => {
            error!("This application has already been started");
            Ok(())
        },
        Err(err) => {
            error!("Unexpected error: {}", err);
            Err(err)
        },
        Ok(_) => Ok(()),
    }
}
