use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, ErrorCode, Row, Transaction, TransactionBehavior};
use rust_decimal::Decimal;
use serde_json::Value;
use thiserror::Error;

pub mod commands;
pub mod events;
pub mod invoices;
pub mod sessions;
pub mod tariffs;

pub const LATEST_SCHEMA_VERSION: u32 = 3;

const MIGRATIONS: &[(u32, &str)] = &[
    (
        1,
        r#"
CREATE TABLE IF NOT EXISTS events (
    id TEXT PRIMARY KEY,
    source TEXT NOT NULL,
    event_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    charge_box_id TEXT,
    connector_ref INTEGER,
    transaction_ref INTEGER,
    id_tag TEXT,
    dedup_key TEXT NOT NULL UNIQUE,
    occurred_at TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_transaction_type
ON events (transaction_ref, event_type);

CREATE INDEX IF NOT EXISTS idx_events_charge_box_occurred_at
ON events (charge_box_id, occurred_at);

CREATE INDEX IF NOT EXISTS idx_events_created_at
ON events (created_at);

CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    transaction_id INTEGER NOT NULL UNIQUE,
    charge_box_id TEXT,
    id_tag TEXT,
    connector_id INTEGER,
    mode TEXT NOT NULL DEFAULT 'AC' CHECK (mode IN ('AC', 'DC')),
    started_at TEXT NOT NULL,
    start_observed INTEGER NOT NULL DEFAULT 1,
    stopped_at TEXT,
    stop_reason TEXT,
    meter_start INTEGER,
    pricing_snapshot TEXT,
    energy_kwh TEXT,
    revenue TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_started_at
ON sessions (started_at);
"#,
    ),
    (
        2,
        r#"
CREATE TABLE IF NOT EXISTS commands (
    id TEXT PRIMARY KEY,
    command_type TEXT NOT NULL CHECK (command_type IN ('RemoteStart', 'RemoteStop')),
    charge_box_id TEXT,
    id_tag TEXT,
    connector_id INTEGER,
    transaction_id INTEGER,
    idempotency_key TEXT NOT NULL,
    status TEXT NOT NULL,
    payload TEXT NOT NULL,
    response TEXT,
    session_id TEXT REFERENCES sessions (id),
    requested_by TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_commands_open_idempotency_key
ON commands (idempotency_key)
WHERE status IN ('pending', 'sent', 'accepted');

CREATE INDEX IF NOT EXISTS idx_commands_transaction_type
ON commands (transaction_id, command_type);

CREATE INDEX IF NOT EXISTS idx_commands_charge_box_type
ON commands (charge_box_id, command_type);

CREATE TABLE IF NOT EXISTS command_status_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    command_id TEXT NOT NULL REFERENCES commands (id),
    from_status TEXT,
    to_status TEXT NOT NULL,
    changed_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_command_status_history_command
ON command_status_history (command_id, id);
"#,
    ),
    (
        3,
        r#"
CREATE TABLE IF NOT EXISTS tariffs (
    id TEXT PRIMARY KEY,
    scope_type TEXT NOT NULL CHECK (scope_type IN ('global', 'charge_box')),
    charge_box_id TEXT,
    applies_mode TEXT NOT NULL CHECK (applies_mode IN ('AC', 'DC', 'ANY')),
    valid_from TEXT NOT NULL,
    valid_to TEXT,
    price_ac_kwh TEXT NOT NULL,
    price_dc_kwh TEXT NOT NULL,
    connection_fee TEXT NOT NULL,
    idle_fee_per_minute TEXT NOT NULL,
    idle_grace_minutes TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tariffs_scope_validity
ON tariffs (scope_type, charge_box_id, valid_from);

CREATE TABLE IF NOT EXISTS invoices (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL UNIQUE REFERENCES sessions (id),
    transaction_id INTEGER NOT NULL,
    charge_box_id TEXT,
    id_tag TEXT,
    started_at TEXT NOT NULL,
    stopped_at TEXT NOT NULL,
    energy_kwh TEXT NOT NULL,
    idle_minutes TEXT NOT NULL,
    total TEXT NOT NULL,
    breakdown TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_invoices_started_at
ON invoices (started_at DESC);
"#,
    ),
];

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database operation failed: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("unsupported schema version {current}; latest supported is {latest}")]
    UnsupportedSchemaVersion { current: u32, latest: u32 },
    #[error("database lock poisoned")]
    LockPoisoned,
    #[error("failed to encode {column}: {source}")]
    Encode {
        column: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl DbError {
    /// Busy/locked stores clear up on their own; the caller may retry.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Sqlite(error) => matches!(
                error.sqlite_error_code(),
                Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
            ),
            _ => false,
        }
    }
}

pub fn open_connection(path: &str, busy_timeout: Duration) -> Result<Connection, DbError> {
    let connection = Connection::open(path)?;
    configure_connection(&connection, busy_timeout)?;
    Ok(connection)
}

pub fn open_in_memory() -> Result<Connection, DbError> {
    let connection = Connection::open_in_memory()?;
    configure_connection(&connection, Duration::from_millis(0))?;
    Ok(connection)
}

fn configure_connection(connection: &Connection, busy_timeout: Duration) -> Result<(), DbError> {
    connection.busy_timeout(busy_timeout)?;
    connection.pragma_update(None, "foreign_keys", true)?;
    let journal_mode: String =
        connection.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    tracing::debug!(journal_mode = %journal_mode, "sqlite connection configured");
    Ok(())
}

pub fn run_migrations(connection: &mut Connection) -> Result<(), DbError> {
    let current_version = schema_version(connection)?;

    if current_version > LATEST_SCHEMA_VERSION {
        return Err(DbError::UnsupportedSchemaVersion {
            current: current_version,
            latest: LATEST_SCHEMA_VERSION,
        });
    }

    let transaction = connection.transaction()?;

    for (version, sql) in MIGRATIONS {
        if *version > current_version {
            transaction.execute_batch(sql)?;
            transaction.pragma_update(None, "user_version", version)?;
        }
    }

    transaction.commit()?;

    Ok(())
}

pub fn schema_version(connection: &Connection) -> Result<u32, DbError> {
    let version = connection.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

/// User tables of the database, sorted by name.
pub fn table_names(connection: &Connection) -> Result<Vec<String>, DbError> {
    let mut statement = connection.prepare(
        "SELECT name FROM sqlite_master
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
         ORDER BY name",
    )?;
    let names = statement
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(names)
}

/// Storage handle injected into every service. Each handle owns one
/// connection; separate handles on the same file behave like separate
/// service instances and coordinate only through SQLite locking.
#[derive(Clone)]
pub struct SqliteStore {
    connection: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn new(connection: Connection) -> Self {
        Self {
            connection: Arc::new(Mutex::new(connection)),
        }
    }

    pub fn open(path: &str, busy_timeout: Duration) -> Result<Self, DbError> {
        let mut connection = open_connection(path, busy_timeout)?;
        run_migrations(&mut connection)?;
        Ok(Self::new(connection))
    }

    pub fn open_in_memory() -> Result<Self, DbError> {
        let mut connection = open_in_memory()?;
        run_migrations(&mut connection)?;
        Ok(Self::new(connection))
    }

    pub fn read<T, E>(&self, op: impl FnOnce(&Connection) -> Result<T, E>) -> Result<T, E>
    where
        E: From<DbError>,
    {
        let connection = self
            .connection
            .lock()
            .map_err(|_| DbError::LockPoisoned)?;
        op(&connection)
    }

    /// Runs `op` inside a `BEGIN IMMEDIATE` transaction: the write lock is held
    /// from the first read, so check-then-insert sequences are serializable
    /// across every handle on the database. Dropping an uncommitted
    /// transaction rolls it back.
    pub fn write<T, E>(&self, op: impl FnOnce(&Transaction<'_>) -> Result<T, E>) -> Result<T, E>
    where
        E: From<DbError>,
    {
        let mut connection = self
            .connection
            .lock()
            .map_err(|_| DbError::LockPoisoned)?;
        let transaction = connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(DbError::from)?;
        let value = op(&transaction)?;
        transaction.commit().map_err(DbError::from)?;
        Ok(value)
    }

    pub fn schema_version(&self) -> Result<u32, DbError> {
        self.read(schema_version)
    }
}

pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn encode_json(column: &'static str, value: &Value) -> Result<String, DbError> {
    serde_json::to_string(value).map_err(|source| DbError::Encode { column, source })
}

pub(crate) fn conversion_error(
    index: usize,
    error: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, Type::Text, error.into())
}

pub(crate) fn parse_stored_timestamp(index: usize, text: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|error| conversion_error(index, error))
}

pub(crate) fn timestamp_at(row: &Row<'_>, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(index)?;
    parse_stored_timestamp(index, &text)
}

pub(crate) fn optional_timestamp_at(
    row: &Row<'_>,
    index: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let text: Option<String> = row.get(index)?;
    text.map(|text| parse_stored_timestamp(index, &text))
        .transpose()
}

pub(crate) fn decimal_at(row: &Row<'_>, index: usize) -> rusqlite::Result<Decimal> {
    let text: String = row.get(index)?;
    text.parse::<Decimal>()
        .map_err(|error| conversion_error(index, error))
}

pub(crate) fn optional_decimal_at(
    row: &Row<'_>,
    index: usize,
) -> rusqlite::Result<Option<Decimal>> {
    let text: Option<String> = row.get(index)?;
    text.map(|text| {
        text.parse::<Decimal>()
            .map_err(|error| conversion_error(index, error))
    })
    .transpose()
}

pub(crate) fn json_at(row: &Row<'_>, index: usize) -> rusqlite::Result<Value> {
    let text: String = row.get(index)?;
    serde_json::from_str(&text).map_err(|error| conversion_error(index, error))
}

pub(crate) fn optional_json_at(row: &Row<'_>, index: usize) -> rusqlite::Result<Option<Value>> {
    let text: Option<String> = row.get(index)?;
    text.map(|text| serde_json::from_str(&text).map_err(|error| conversion_error(index, error)))
        .transpose()
}
