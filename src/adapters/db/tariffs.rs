use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row, params};
use uuid::Uuid;

use crate::adapters::db::{
    DbError, conversion_error, decimal_at, format_timestamp, optional_timestamp_at, timestamp_at,
};
use crate::domain::models::{ChargingMode, NewTariffRecord, TariffMode, TariffRecord, TariffScope};

const TARIFF_COLUMNS: &str = "rowid, id, scope_type, charge_box_id, applies_mode, valid_from, valid_to, price_ac_kwh, price_dc_kwh, connection_fee, idle_fee_per_minute, idle_grace_minutes, created_at";

pub fn insert_tariff(
    connection: &Connection,
    tariff: &NewTariffRecord,
) -> Result<TariffRecord, DbError> {
    let id = Uuid::new_v4().to_string();
    connection.execute(
        "INSERT INTO tariffs (id, scope_type, charge_box_id, applies_mode, valid_from, valid_to, price_ac_kwh, price_dc_kwh, connection_fee, idle_fee_per_minute, idle_grace_minutes, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            id,
            tariff.scope.as_str(),
            tariff.charge_box_id,
            tariff.applies_mode.as_str(),
            format_timestamp(tariff.valid_from),
            tariff.valid_to.map(format_timestamp),
            tariff.price_ac_kwh.to_string(),
            tariff.price_dc_kwh.to_string(),
            tariff.connection_fee.to_string(),
            tariff.idle_fee_per_minute.to_string(),
            tariff.idle_grace_minutes.to_string(),
            format_timestamp(tariff.created_at),
        ],
    )?;

    Ok(TariffRecord {
        id,
        revision: connection.last_insert_rowid(),
        scope: tariff.scope,
        charge_box_id: tariff.charge_box_id.clone(),
        applies_mode: tariff.applies_mode,
        valid_from: tariff.valid_from,
        valid_to: tariff.valid_to,
        price_ac_kwh: tariff.price_ac_kwh,
        price_dc_kwh: tariff.price_dc_kwh,
        connection_fee: tariff.connection_fee,
        idle_fee_per_minute: tariff.idle_fee_per_minute,
        idle_grace_minutes: tariff.idle_grace_minutes,
        created_at: tariff.created_at,
    })
}

/// Tariffs valid at `at` (`valid_from <= at < valid_to`) for the mode, either
/// global or scoped to the charge box. Ranking is left to the caller.
pub fn list_candidates(
    connection: &Connection,
    charge_box_id: Option<&str>,
    mode: ChargingMode,
    at: DateTime<Utc>,
) -> Result<Vec<TariffRecord>, DbError> {
    let sql = format!(
        "SELECT {TARIFF_COLUMNS} FROM tariffs
         WHERE valid_from <= ?1
           AND (valid_to IS NULL OR valid_to > ?1)
           AND applies_mode IN (?2, 'ANY')
           AND (scope_type = 'global' OR (scope_type = 'charge_box' AND charge_box_id = ?3))
         ORDER BY created_at DESC, rowid DESC"
    );
    let mut statement = connection.prepare(&sql)?;
    let rows = statement.query_map(
        params![format_timestamp(at), mode.as_str(), charge_box_id],
        map_tariff,
    )?;

    let mut tariffs = Vec::new();
    for row in rows {
        tariffs.push(row?);
    }

    Ok(tariffs)
}

#[cfg(test)]
pub(crate) fn get_tariff(
    connection: &Connection,
    id: &str,
) -> Result<Option<TariffRecord>, DbError> {
    use rusqlite::OptionalExtension;

    let sql = format!("SELECT {TARIFF_COLUMNS} FROM tariffs WHERE id = ?1");
    connection
        .query_row(&sql, [id], map_tariff)
        .optional()
        .map_err(DbError::from)
}

fn map_tariff(row: &Row<'_>) -> rusqlite::Result<TariffRecord> {
    let scope: String = row.get(2)?;
    let scope = TariffScope::parse(&scope)
        .ok_or_else(|| conversion_error(2, format!("unknown tariff scope '{scope}'")))?;
    let applies_mode: String = row.get(4)?;
    let applies_mode = TariffMode::parse(&applies_mode)
        .ok_or_else(|| conversion_error(4, format!("unknown tariff mode '{applies_mode}'")))?;

    Ok(TariffRecord {
        revision: row.get(0)?,
        id: row.get(1)?,
        scope,
        charge_box_id: row.get(3)?,
        applies_mode,
        valid_from: timestamp_at(row, 5)?,
        valid_to: optional_timestamp_at(row, 6)?,
        price_ac_kwh: decimal_at(row, 7)?,
        price_dc_kwh: decimal_at(row, 8)?,
        connection_fee: decimal_at(row, 9)?,
        idle_fee_per_minute: decimal_at(row, 10)?,
        idle_grace_minutes: decimal_at(row, 11)?,
        created_at: timestamp_at(row, 12)?,
    })
}
