use catalog_models::errors::SendableError;
use log::info;

use crate::logger::{self, LogSettings, print_env};

pub fn startup(name: &str, settings: &LogSettings) -> Result<(), SendableError> {
    logger::setup_logger(settings)?;
    log_panics::init();

    info!("--- {} ---", name);
    print_env()?;

    Ok(())
}
