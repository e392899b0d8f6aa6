mod config;
mod error;
mod logging;
mod runtime;
pub mod services;

pub use config::AppConfig;
pub use error::AppError;

pub fn run() -> Result<(), AppError> {
    dotenvy::dotenv().ok();
    logging::init()?;

    let config = AppConfig::from_env()?;

    tracing::info!(
        db_path = %config.db_path,
        http_bind = %config.http_bind,
        http_workers = config.http_workers,
        db_busy_timeout_ms = config.db_busy_timeout_ms,
        event_source = %config.event_source,
        "application bootstrap initialized"
    );

    runtime::run(config)
}
