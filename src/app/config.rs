use std::time::Duration;

use crate::app::AppError;

pub const DEFAULT_DB_PATH: &str = "/var/lib/charge-orchestrator/orchestrator.db";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: String,
    pub http_bind: String,
    pub http_workers: usize,
    pub db_busy_timeout_ms: u64,
    pub event_source: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let http_workers = parse_or_default(&lookup, "HTTP_WORKERS", 4_usize)?;
        if http_workers == 0 {
            return Err(AppError::config("HTTP_WORKERS must be at least 1"));
        }

        Ok(Self {
            db_path: text_or_default(&lookup, "DB_PATH", DEFAULT_DB_PATH),
            http_bind: text_or_default(&lookup, "HTTP_BIND", "0.0.0.0:8080"),
            http_workers,
            db_busy_timeout_ms: parse_or_default(&lookup, "DB_BUSY_TIMEOUT_MS", 5000_u64)?,
            event_source: text_or_default(&lookup, "EVENT_SOURCE", "ocpp"),
        })
    }

    pub fn db_busy_timeout(&self) -> Duration {
        Duration::from_millis(self.db_busy_timeout_ms)
    }
}

fn text_or_default<F>(lookup: &F, key: &str, default: &str) -> String
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_or_default<T, F>(lookup: &F, key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr + Copy,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| AppError::config(format!("{key} must be a valid number"))),
        None => Ok(default),
    }
}
