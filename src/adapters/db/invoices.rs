use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use uuid::Uuid;

use crate::adapters::db::{
    DbError, conversion_error, decimal_at, format_timestamp, json_at, timestamp_at,
};
use crate::domain::models::{InvoiceFilter, InvoiceRecord, InvoiceUpsert};

const INVOICE_COLUMNS: &str = "id, session_id, transaction_id, charge_box_id, id_tag, started_at, stopped_at, energy_kwh, idle_minutes, total, breakdown, created_at, updated_at";

/// One invoice per session: a repeated close replaces the figures and keeps
/// the invoice id and creation time.
pub fn upsert_invoice(connection: &Connection, invoice: &InvoiceUpsert) -> Result<String, DbError> {
    let breakdown = serde_json::to_string(&invoice.breakdown).map_err(|source| DbError::Encode {
        column: "breakdown",
        source,
    })?;

    let id = connection.query_row(
        "INSERT INTO invoices (id, session_id, transaction_id, charge_box_id, id_tag, started_at, stopped_at, energy_kwh, idle_minutes, total, breakdown, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)
         ON CONFLICT (session_id) DO UPDATE SET
             transaction_id = excluded.transaction_id,
             charge_box_id = excluded.charge_box_id,
             id_tag = excluded.id_tag,
             started_at = excluded.started_at,
             stopped_at = excluded.stopped_at,
             energy_kwh = excluded.energy_kwh,
             idle_minutes = excluded.idle_minutes,
             total = excluded.total,
             breakdown = excluded.breakdown,
             updated_at = excluded.updated_at
         RETURNING id",
        params![
            Uuid::new_v4().to_string(),
            invoice.session_id,
            invoice.transaction_id,
            invoice.charge_box_id,
            invoice.id_tag,
            format_timestamp(invoice.started_at),
            format_timestamp(invoice.stopped_at),
            invoice.energy_kwh.to_string(),
            invoice.idle_minutes.to_string(),
            invoice.total.to_string(),
            breakdown,
            format_timestamp(invoice.now),
        ],
        |row| row.get(0),
    )?;

    Ok(id)
}

pub fn get_invoice(connection: &Connection, id: &str) -> Result<Option<InvoiceRecord>, DbError> {
    let sql = format!("SELECT {INVOICE_COLUMNS} FROM invoices WHERE id = ?1");
    connection
        .query_row(&sql, [id], map_invoice)
        .optional()
        .map_err(DbError::from)
}

pub fn list_invoices(
    connection: &Connection,
    filter: &InvoiceFilter,
) -> Result<Vec<InvoiceRecord>, DbError> {
    let mut clauses = vec!["started_at >= ?", "started_at < ?"];
    let mut values = vec![
        SqlValue::Text(format_timestamp(filter.from)),
        SqlValue::Text(format_timestamp(filter.to)),
    ];

    if let Some(charge_box_id) = &filter.charge_box_id {
        clauses.push("charge_box_id = ?");
        values.push(SqlValue::Text(charge_box_id.clone()));
    }
    if let Some(id_tag) = &filter.id_tag {
        clauses.push("id_tag = ?");
        values.push(SqlValue::Text(id_tag.clone()));
    }

    let sql = format!(
        "SELECT {INVOICE_COLUMNS} FROM invoices
         WHERE {}
         ORDER BY started_at DESC, rowid DESC
         LIMIT ?",
        clauses.join(" AND ")
    );
    values.push(SqlValue::Integer(i64::from(filter.limit)));

    let mut statement = connection.prepare(&sql)?;
    let rows = statement.query_map(params_from_iter(values.iter()), map_invoice)?;

    let mut invoices = Vec::new();
    for row in rows {
        invoices.push(row?);
    }

    Ok(invoices)
}

fn map_invoice(row: &Row<'_>) -> rusqlite::Result<InvoiceRecord> {
    let breakdown = json_at(row, 10)?;

    Ok(InvoiceRecord {
        id: row.get(0)?,
        session_id: row.get(1)?,
        transaction_id: row.get(2)?,
        charge_box_id: row.get(3)?,
        id_tag: row.get(4)?,
        started_at: timestamp_at(row, 5)?,
        stopped_at: timestamp_at(row, 6)?,
        energy_kwh: decimal_at(row, 7)?,
        idle_minutes: decimal_at(row, 8)?,
        total: decimal_at(row, 9)?,
        breakdown: serde_json::from_value(breakdown).map_err(|error| conversion_error(10, error))?,
        created_at: timestamp_at(row, 11)?,
        updated_at: timestamp_at(row, 12)?,
    })
}
