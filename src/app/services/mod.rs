use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::adapters::db::DbError;
use crate::domain::models::ChargingMode;
use crate::domain::session_state::Clock;

pub mod billing;
pub mod commands;
pub mod ingest;
pub mod sessions;

pub use billing::BillingService;
pub use commands::CommandOrchestrator;
pub use ingest::EventIngestor;
pub use sessions::SessionTracker;

pub type SharedClock = Arc<dyn Clock + Send + Sync>;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),
    #[error("{entity} {key} not found")]
    NotFound { entity: &'static str, key: String },
    #[error("{0}")]
    Conflict(String),
    #[error("no tariff applies to {scope} ({mode}) at {at}")]
    TariffNotFound {
        scope: String,
        mode: ChargingMode,
        at: DateTime<Utc>,
    },
    #[error("storage temporarily unavailable: {0}")]
    TransientStorage(#[source] DbError),
    #[error("database operation failed: {0}")]
    Storage(#[source] DbError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(entity: &'static str, key: impl ToString) -> Self {
        Self::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    /// Stable machine-readable code for API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::NotFound { .. } => "not_found",
            Self::Conflict(_) => "conflict",
            Self::TariffNotFound { .. } => "tariff_not_found",
            Self::TransientStorage(_) => "transient_storage_error",
            Self::Storage(_) | Self::Internal(_) => "internal_error",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientStorage(_))
    }
}

impl From<DbError> for ServiceError {
    fn from(error: DbError) -> Self {
        if error.is_transient() {
            Self::TransientStorage(error)
        } else {
            Self::Storage(error)
        }
    }
}

/// Applies the default for a missing limit and caps it at `max`.
pub(crate) fn clamp_limit(requested: Option<u32>, default: u32, max: u32) -> u32 {
    requested.unwrap_or(default).clamp(1, max)
}

pub(crate) fn require_text(field: &str, value: &str) -> Result<String, ServiceError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ServiceError::validation(format!("{field} must not be empty")));
    }
    Ok(trimmed.to_string())
}

pub(crate) fn require_positive(
    field: &str,
    value: Option<i64>,
) -> Result<Option<i64>, ServiceError> {
    match value {
        Some(value) if value <= 0 => Err(ServiceError::validation(format!(
            "{field} must be a positive integer"
        ))),
        other => Ok(other),
    }
}

pub(crate) fn optional_text(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}
