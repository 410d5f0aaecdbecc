use std::{env, path::PathBuf, time::SystemTime};

use catalog_models::errors::SendableError;
use fern::colors::{Color, ColoredLevelConfig};
use log::{LevelFilter, info};

#[derive(Debug, Clone)]
pub struct LogSettings {
    pub level: LevelFilter,
    /// Optional file sink in addition to stdout.
    pub file: Option<PathBuf>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: LevelFilter::Info,
            file: None,
        }
    }
}

pub fn setup_logger(settings: &LogSettings) -> Result<(), SendableError> {
    let colors = ColoredLevelConfig::new()
        .info(Color::Green)
        .warn(Color::Yellow)
        .error(Color::Red)
        .debug(Color::Cyan);

    let stdout = fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339_seconds(SystemTime::now()),
                colors.color(record.level()),
                record.target(),
                message
            ))
        })
        .chain(std::io::stdout());

    let mut dispatch = fern::Dispatch::new()
        .level(settings.level)
        .level_for("rdkafka", LevelFilter::Warn)
        .level_for("sqlx", LevelFilter::Warn)
        .chain(stdout);

    if let Some(path) = &settings.file {
        let file = fern::Dispatch::new()
            .format(|out, message, record| {
                out.finish(format_args!(
                    "[{} {} {}] {}",
                    humantime::format_rfc3339_seconds(SystemTime::now()),
                    record.level(),
                    record.target(),
                    message
                ))
            })
            .chain(fern::log_file(path)?);
        dispatch = dispatch.chain(file);
    }

    dispatch.apply()?;
    Ok(())
}

pub fn print_env() -> std::io::Result<()> {
    let path = env::current_dir()?;
    info!("The current directory is {}", path.display());
    Ok(())
}
