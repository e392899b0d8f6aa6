use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use rust_decimal::Decimal;
use serde_json::Value;
use uuid::Uuid;

use crate::adapters::db::{
    DbError, conversion_error, format_timestamp, optional_decimal_at,
    optional_json_at, optional_timestamp_at, timestamp_at,
};
use crate::domain::models::{
    ChargingMode, PricingSnapshot, SessionFilter, SessionRecord, SessionStatus,
};
use crate::domain::session_state::SessionState;

const SESSION_COLUMNS: &str = "id, transaction_id, charge_box_id, id_tag, connector_id, mode, started_at, start_observed, stopped_at, stop_reason, meter_start, pricing_snapshot, energy_kwh, revenue, created_at, updated_at";

pub fn find_session(
    connection: &Connection,
    transaction_id: i64,
) -> Result<Option<SessionRecord>, DbError> {
    let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE transaction_id = ?1");
    connection
        .query_row(&sql, [transaction_id], map_session)
        .optional()
        .map_err(DbError::from)
}

pub fn insert_session(
    connection: &Connection,
    transaction_id: i64,
    state: &SessionState,
    now: DateTime<Utc>,
) -> Result<String, DbError> {
    let id = Uuid::new_v4().to_string();
    let now = format_timestamp(now);
    connection.execute(
        "INSERT INTO sessions (id, transaction_id, charge_box_id, id_tag, connector_id, mode, started_at, start_observed, stopped_at, stop_reason, meter_start, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)",
        params![
            id,
            transaction_id,
            state.charge_box_id,
            state.id_tag,
            state.connector_id,
            state.mode.as_str(),
            format_timestamp(state.started_at),
            state.start_observed,
            state.stopped_at.map(format_timestamp),
            state.stop_reason,
            state.meter_start,
            now,
        ],
    )?;

    Ok(id)
}

pub fn update_session_state(
    connection: &Connection,
    session_id: &str,
    state: &SessionState,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    connection.execute(
        "UPDATE sessions
         SET charge_box_id = ?2, id_tag = ?3, connector_id = ?4, mode = ?5, started_at = ?6,
             start_observed = ?7, stopped_at = ?8, stop_reason = ?9, meter_start = ?10, updated_at = ?11
         WHERE id = ?1",
        params![
            session_id,
            state.charge_box_id,
            state.id_tag,
            state.connector_id,
            state.mode.as_str(),
            format_timestamp(state.started_at),
            state.start_observed,
            state.stopped_at.map(format_timestamp),
            state.stop_reason,
            state.meter_start,
            format_timestamp(now),
        ],
    )?;

    Ok(())
}

/// Freezes the pricing snapshot unless one is already stored. Returns
/// whether this call wrote it.
pub fn set_pricing_snapshot_if_absent(
    connection: &Connection,
    session_id: &str,
    snapshot: &PricingSnapshot,
    now: DateTime<Utc>,
) -> Result<bool, DbError> {
    let encoded = serde_json::to_string(snapshot).map_err(|source| DbError::Encode {
        column: "pricing_snapshot",
        source,
    })?;

    let updated = connection.execute(
        "UPDATE sessions SET pricing_snapshot = ?2, updated_at = ?3
         WHERE id = ?1 AND pricing_snapshot IS NULL",
        params![session_id, encoded, format_timestamp(now)],
    )?;

    Ok(updated == 1)
}

pub fn record_totals(
    connection: &Connection,
    session_id: &str,
    energy_kwh: Decimal,
    revenue: Decimal,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    connection.execute(
        "UPDATE sessions SET energy_kwh = ?2, revenue = ?3, updated_at = ?4 WHERE id = ?1",
        params![
            session_id,
            energy_kwh.to_string(),
            revenue.to_string(),
            format_timestamp(now)
        ],
    )?;

    Ok(())
}

pub fn list_sessions(
    connection: &Connection,
    filter: &SessionFilter,
) -> Result<Vec<SessionRecord>, DbError> {
    let mut clauses: Vec<&str> = Vec::new();
    let mut values: Vec<SqlValue> = Vec::new();

    if let Some(charge_box_id) = &filter.charge_box_id {
        clauses.push("charge_box_id = ?");
        values.push(SqlValue::Text(charge_box_id.clone()));
    }
    if let Some(id_tag) = &filter.id_tag {
        clauses.push("id_tag = ?");
        values.push(SqlValue::Text(id_tag.clone()));
    }
    if let Some(transaction_id) = filter.transaction_id {
        clauses.push("transaction_id = ?");
        values.push(SqlValue::Integer(transaction_id));
    }
    match filter.status {
        Some(SessionStatus::Active) => clauses.push("stopped_at IS NULL"),
        Some(SessionStatus::Completed) => clauses.push("stopped_at IS NOT NULL"),
        None => {}
    }
    if let Some(from) = filter.from {
        clauses.push("started_at >= ?");
        values.push(SqlValue::Text(format_timestamp(from)));
    }
    if let Some(to) = filter.to {
        clauses.push("started_at < ?");
        values.push(SqlValue::Text(format_timestamp(to)));
    }

    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    let order = filter.sort.as_sql();
    let sql = format!(
        "SELECT {SESSION_COLUMNS} FROM sessions {where_sql}
         ORDER BY started_at {order}, rowid {order}
         LIMIT ? OFFSET ?"
    );
    values.push(SqlValue::Integer(i64::from(filter.limit)));
    values.push(SqlValue::Integer(i64::from(filter.offset)));

    let mut statement = connection.prepare(&sql)?;
    let rows = statement.query_map(params_from_iter(values.iter()), map_session)?;

    let mut sessions = Vec::new();
    for row in rows {
        sessions.push(row?);
    }

    Ok(sessions)
}

fn map_session(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
    let mode: String = row.get(5)?;
    let mode = ChargingMode::parse(&mode)
        .ok_or_else(|| conversion_error(5, format!("unknown charging mode '{mode}'")))?;

    Ok(SessionRecord {
        id: row.get(0)?,
        transaction_id: row.get(1)?,
        charge_box_id: row.get(2)?,
        id_tag: row.get(3)?,
        connector_id: row.get(4)?,
        mode,
        started_at: timestamp_at(row, 6)?,
        start_observed: row.get(7)?,
        stopped_at: optional_timestamp_at(row, 8)?,
        stop_reason: row.get(9)?,
        meter_start: row.get(10)?,
        pricing_snapshot: optional_json_at(row, 11)?
            .map(decode_snapshot)
            .transpose()?,
        energy_kwh: optional_decimal_at(row, 12)?,
        revenue: optional_decimal_at(row, 13)?,
        created_at: timestamp_at(row, 14)?,
        updated_at: timestamp_at(row, 15)?,
    })
}

fn decode_snapshot(value: Value) -> rusqlite::Result<PricingSnapshot> {
    serde_json::from_value(value).map_err(|error| conversion_error(11, error))
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};
    use rust_decimal::Decimal;

    use crate::adapters::db::{DbError, SqliteStore};
    use crate::domain::models::{
        ChargingMode, PricingSnapshot, SessionFilter, SessionStatus, SortOrder,
    };
    use crate::domain::session_state::SessionState;

    use super::{
        find_session, insert_session, list_sessions, record_totals,
        set_pricing_snapshot_if_absent, update_session_state,
    };

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 8, 14, 15, minute, 0).unwrap()
    }

    fn state(minute: u32, stopped: Option<u32>) -> SessionState {
        SessionState {
            charge_box_id: Some("CB-01".to_string()),
            id_tag: Some("TAG-1".to_string()),
            connector_id: Some(1),
            mode: ChargingMode::Dc,
            started_at: at(minute),
            start_observed: true,
            stopped_at: stopped.map(at),
            stop_reason: stopped.map(|_| "Local".to_string()),
            meter_start: Some(1000),
        }
    }

    fn snapshot(tariff_id: &str) -> PricingSnapshot {
        PricingSnapshot {
            tariff_id: tariff_id.to_string(),
            mode: ChargingMode::Dc,
            price_kwh: Decimal::new(250, 2),
            connection_fee: Decimal::new(100, 2),
            idle_fee_per_minute: Decimal::ZERO,
            idle_grace_minutes: Decimal::from(10),
        }
    }

    #[test]
    fn stores_and_updates_session_state() {
        let store = SqliteStore::open_in_memory().expect("store should open");

        let session = store
            .write(|transaction| {
                let id = insert_session(transaction, 42, &state(0, None), at(0))?;
                update_session_state(transaction, &id, &state(0, Some(30)), at(30))?;
                find_session(transaction, 42)
            })
            .expect("write should succeed")
            .expect("session should exist");

        assert_eq!(session.transaction_id, 42);
        assert_eq!(session.mode, ChargingMode::Dc);
        assert_eq!(session.stopped_at, Some(at(30)));
        assert_eq!(session.status(), SessionStatus::Completed);
        assert_eq!(session.duration_seconds(at(59)), 1800);
        assert_eq!(session.updated_at, at(30));
    }

    #[test]
    fn first_pricing_snapshot_is_kept() {
        let store = SqliteStore::open_in_memory().expect("store should open");

        let (first, second, session) = store
            .write(|transaction| {
                let id = insert_session(transaction, 7, &state(0, None), at(0))?;
                let first =
                    set_pricing_snapshot_if_absent(transaction, &id, &snapshot("t-1"), at(1))?;
                let second =
                    set_pricing_snapshot_if_absent(transaction, &id, &snapshot("t-2"), at(2))?;
                record_totals(
                    transaction,
                    &id,
                    Decimal::new(2000, 2),
                    Decimal::new(5100, 2),
                    at(3),
                )?;
                Ok::<_, DbError>((first, second, find_session(transaction, 7)?))
            })
            .expect("write should succeed");

        assert!(first);
        assert!(!second);
        let session = session.expect("session should exist");
        assert_eq!(
            session.pricing_snapshot.map(|snapshot| snapshot.tariff_id),
            Some("t-1".to_string())
        );
        assert_eq!(session.energy_kwh, Some(Decimal::new(2000, 2)));
        assert_eq!(session.revenue, Some(Decimal::new(5100, 2)));
    }

    #[test]
    fn lists_sessions_by_status() {
        let store = SqliteStore::open_in_memory().expect("store should open");

        store
            .write(|transaction| {
                insert_session(transaction, 1, &state(0, None), at(0))?;
                insert_session(transaction, 2, &state(5, Some(10)), at(5))?;
                insert_session(transaction, 3, &state(8, None), at(8))?;
                Ok::<_, DbError>(())
            })
            .expect("write should succeed");

        let active = store
            .read(|connection| {
                list_sessions(
                    connection,
                    &SessionFilter {
                        status: Some(SessionStatus::Active),
                        limit: 50,
                        sort: SortOrder::Asc,
                        ..SessionFilter::default()
                    },
                )
            })
            .expect("list should succeed");

        let ids: Vec<i64> = active.iter().map(|session| session.transaction_id).collect();
        assert_eq!(ids, vec![1, 3]);
    }
}
