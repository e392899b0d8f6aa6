use std::sync::Arc;

use actix_web::{App, HttpServer, web};

use crate::adapters::api::{ApiState, configure_routes};
use crate::adapters::db::SqliteStore;
use crate::app::config::AppConfig;
use crate::app::error::AppError;
use crate::app::services::{
    BillingService, CommandOrchestrator, EventIngestor, SessionTracker, SharedClock,
};
use crate::domain::session_state::SystemClock;

pub fn build_state(store: SqliteStore, clock: SharedClock, event_source: &str) -> ApiState {
    ApiState {
        events: EventIngestor::new(store.clone(), Arc::clone(&clock), event_source),
        commands: CommandOrchestrator::new(store.clone(), Arc::clone(&clock)),
        sessions: SessionTracker::new(store.clone(), Arc::clone(&clock)),
        billing: BillingService::new(store, clock),
    }
}

pub fn run(config: AppConfig) -> Result<(), AppError> {
    let store = SqliteStore::open(&config.db_path, config.db_busy_timeout())
        .map_err(AppError::database_init)?;
    let schema_version = store.schema_version().map_err(AppError::database_init)?;
    tracing::info!(db_path = %config.db_path, schema_version, "database ready");

    let clock: SharedClock = Arc::new(SystemClock);
    let api_state = build_state(store, clock, &config.event_source);

    tracing::info!(
        bind = %config.http_bind,
        workers = config.http_workers,
        "http server starting"
    );

    let server_result = actix_web::rt::System::new().block_on(async move {
        HttpServer::new(move || {
            App::new()
                .app_data(web::Data::new(api_state.clone()))
                .configure(configure_routes)
        })
        .workers(config.http_workers)
        .bind(&config.http_bind)?
        .run()
        .await
    });

    tracing::info!("http server stopped");
    server_result.map_err(AppError::runtime)
}
