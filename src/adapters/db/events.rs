use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use uuid::Uuid;

use crate::adapters::db::{DbError, encode_json, format_timestamp, json_at, timestamp_at};
use crate::domain::event_payload::STATUS_NOTIFICATION;
use crate::domain::models::{EventFilter, EventRecord, NewEventRecord};

const EVENT_COLUMNS: &str = "id, source, event_type, payload, charge_box_id, connector_ref, transaction_ref, id_tag, dedup_key, occurred_at, created_at";

/// Returns the new event id, or `None` when the dedup key is already stored.
pub fn insert_event_if_absent(
    connection: &Connection,
    new_event: &NewEventRecord,
) -> Result<Option<String>, DbError> {
    let id = Uuid::new_v4().to_string();
    let inserted = connection.execute(
        "INSERT INTO events (id, source, event_type, payload, charge_box_id, connector_ref, transaction_ref, id_tag, dedup_key, occurred_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT (dedup_key) DO NOTHING",
        params![
            id,
            new_event.source,
            new_event.event_type,
            encode_json("payload", &new_event.payload)?,
            new_event.charge_box_id,
            new_event.connector_ref,
            new_event.transaction_ref,
            new_event.id_tag,
            new_event.dedup_key,
            format_timestamp(new_event.occurred_at),
            format_timestamp(new_event.created_at),
        ],
    )?;

    Ok((inserted == 1).then_some(id))
}

pub fn get_event(connection: &Connection, id: &str) -> Result<Option<EventRecord>, DbError> {
    let sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1");
    connection
        .query_row(&sql, [id], map_event)
        .optional()
        .map_err(DbError::from)
}

pub fn get_event_by_dedup_key(
    connection: &Connection,
    dedup_key: &str,
) -> Result<Option<EventRecord>, DbError> {
    let sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE dedup_key = ?1");
    connection
        .query_row(&sql, [dedup_key], map_event)
        .optional()
        .map_err(DbError::from)
}

pub fn list_events(
    connection: &Connection,
    filter: &EventFilter,
) -> Result<Vec<EventRecord>, DbError> {
    let mut clauses: Vec<&str> = Vec::new();
    let mut values: Vec<SqlValue> = Vec::new();

    if let Some(event_type) = &filter.event_type {
        clauses.push("event_type = ?");
        values.push(SqlValue::Text(event_type.clone()));
    }
    if let Some(charge_box_id) = &filter.charge_box_id {
        clauses.push("charge_box_id = ?");
        values.push(SqlValue::Text(charge_box_id.clone()));
    }
    if let Some(connector_ref) = filter.connector_ref {
        clauses.push("connector_ref = ?");
        values.push(SqlValue::Integer(connector_ref));
    }
    if let Some(transaction_ref) = filter.transaction_ref {
        clauses.push("transaction_ref = ?");
        values.push(SqlValue::Integer(transaction_ref));
    }
    if let Some(id_tag) = &filter.id_tag {
        clauses.push("id_tag = ?");
        values.push(SqlValue::Text(id_tag.clone()));
    }
    if let Some(from) = filter.from {
        clauses.push("created_at >= ?");
        values.push(SqlValue::Text(format_timestamp(from)));
    }
    if let Some(to) = filter.to {
        clauses.push("created_at < ?");
        values.push(SqlValue::Text(format_timestamp(to)));
    }

    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    let order = filter.sort.as_sql();
    let sql = format!(
        "SELECT {EVENT_COLUMNS} FROM events {where_sql}
         ORDER BY created_at {order}, rowid {order}
         LIMIT ? OFFSET ?"
    );
    values.push(SqlValue::Integer(i64::from(filter.limit)));
    values.push(SqlValue::Integer(i64::from(filter.offset)));

    let mut statement = connection.prepare(&sql)?;
    let rows = statement.query_map(params_from_iter(values.iter()), map_event)?;

    let mut events = Vec::new();
    for row in rows {
        events.push(row?);
    }

    Ok(events)
}

/// Status notifications for a charge box inside `[from, to)`, plus the last
/// one reported before `from` so the status in force at the window start is
/// known. Events without a connector apply to every connector.
pub fn list_status_events(
    connection: &Connection,
    charge_box_id: &str,
    connector_id: Option<i64>,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<EventRecord>, DbError> {
    let from = format_timestamp(from);
    let to = format_timestamp(to);

    let preceding_sql = format!(
        "SELECT {EVENT_COLUMNS} FROM events
         WHERE event_type = ?1 AND charge_box_id = ?2
           AND (?3 IS NULL OR connector_ref IS NULL OR connector_ref = ?3)
           AND occurred_at < ?4
         ORDER BY occurred_at DESC, rowid DESC
         LIMIT 1"
    );
    let preceding = connection
        .query_row(
            &preceding_sql,
            params![STATUS_NOTIFICATION, charge_box_id, connector_id, from],
            map_event,
        )
        .optional()?;

    let window_sql = format!(
        "SELECT {EVENT_COLUMNS} FROM events
         WHERE event_type = ?1 AND charge_box_id = ?2
           AND (?3 IS NULL OR connector_ref IS NULL OR connector_ref = ?3)
           AND occurred_at >= ?4 AND occurred_at < ?5
         ORDER BY occurred_at ASC, rowid ASC"
    );
    let mut statement = connection.prepare(&window_sql)?;
    let rows = statement.query_map(
        params![STATUS_NOTIFICATION, charge_box_id, connector_id, from, to],
        map_event,
    )?;

    let mut events: Vec<EventRecord> = preceding.into_iter().collect();
    for row in rows {
        events.push(row?);
    }

    Ok(events)
}

fn map_event(row: &Row<'_>) -> rusqlite::Result<EventRecord> {
    Ok(EventRecord {
        id: row.get(0)?,
        source: row.get(1)?,
        event_type: row.get(2)?,
        payload: json_at(row, 3)?,
        charge_box_id: row.get(4)?,
        connector_ref: row.get(5)?,
        transaction_ref: row.get(6)?,
        id_tag: row.get(7)?,
        dedup_key: row.get(8)?,
        occurred_at: timestamp_at(row, 9)?,
        created_at: timestamp_at(row, 10)?,
    })
}
