use tracing_subscriber::{EnvFilter, fmt};

use crate::app::AppError;

const DEFAULT_FILTER: &str = "info,actix_server=warn";

pub fn init() -> Result<(), AppError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    // Requests run on several workers; thread names tell them apart.
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true)
        .try_init()
        .map_err(AppError::logging_init)
}
