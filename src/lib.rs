use std::env;
use time::UtcOffset;

use crate::cli::Cli;
use crate::error::AppRunError;

pub mod auth;
pub mod cli;
pub mod config;
pub mod device;
pub mod error;

pub fn init_logging(level: log::LevelFilter) -> Result<(), AppRunError> {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339(std::time::SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(log::LevelFilter::Warn)
        .level_for("esp32_companion", level)
        .chain(std::io::stderr());

    if let Ok(log_file) = env::var("LOG_FILE") {
        dispatch = dispatch.chain(
            fern::log_file(log_file).map_err(|source| AppRunError::LogFile { source })?
        );
    }

    dispatch.apply()?;
    Ok(())
}

pub fn run(cli: Cli) -> Result<(), AppRunError> {
    // must be queried before the runtime starts its worker threads
    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|source| AppRunError::Runtime { source })?;

    runtime.block_on(cli::execute(cli, offset))
}
