use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use serde_json::Value;
use uuid::Uuid;

use crate::adapters::db::{
    DbError, conversion_error, encode_json, format_timestamp, json_at, optional_json_at,
    timestamp_at,
};
use crate::domain::command_state::{ClaimOutcome, CommandStatus, CommandType};
use crate::domain::models::{CommandFilter, CommandRecord, CommandStatusChange, NewCommandRecord};

const COMMAND_COLUMNS: &str = "id, command_type, charge_box_id, id_tag, connector_id, transaction_id, idempotency_key, status, payload, response, session_id, requested_by, created_at, updated_at";

pub fn find_open_command_by_key(
    connection: &Connection,
    idempotency_key: &str,
) -> Result<Option<CommandRecord>, DbError> {
    let sql = format!(
        "SELECT {COMMAND_COLUMNS} FROM commands
         WHERE idempotency_key = ?1 AND status IN {}
         ORDER BY created_at DESC, rowid DESC
         LIMIT 1",
        CommandStatus::open_sql_list()
    );
    connection
        .query_row(&sql, [idempotency_key], map_command)
        .optional()
        .map_err(DbError::from)
}

/// Inserts a command in `pending` and records the initial history row.
pub fn insert_command(
    connection: &Connection,
    command: &NewCommandRecord,
) -> Result<String, DbError> {
    let id = Uuid::new_v4().to_string();
    let created_at = format_timestamp(command.created_at);

    connection.execute(
        "INSERT INTO commands (id, command_type, charge_box_id, id_tag, connector_id, transaction_id, idempotency_key, status, payload, session_id, requested_by, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)",
        params![
            id,
            command.command_type.as_str(),
            command.charge_box_id,
            command.id_tag,
            command.connector_id,
            command.transaction_id,
            command.idempotency_key,
            CommandStatus::Pending.as_str(),
            encode_json("payload", &command.payload)?,
            command.session_id,
            command.requested_by,
            created_at,
        ],
    )?;
    append_history(connection, &id, None, CommandStatus::Pending, &created_at)?;

    Ok(id)
}

/// Compare-and-set status change: succeeds only while the row still holds
/// `from`. A row that moved on, or a store held by another writer, means
/// someone else handled it.
pub fn transition_status(
    connection: &Connection,
    command_id: &str,
    from: CommandStatus,
    to: CommandStatus,
    response: Option<&Value>,
    now: DateTime<Utc>,
) -> Result<ClaimOutcome, DbError> {
    let response = response
        .map(|value| encode_json("response", value))
        .transpose()?;
    let now = format_timestamp(now);

    let updated = connection.execute(
        "UPDATE commands
         SET status = ?3, response = COALESCE(?4, response), updated_at = ?5
         WHERE id = ?1 AND status = ?2",
        params![command_id, from.as_str(), to.as_str(), response, now],
    );

    let updated = match updated {
        Ok(updated) => updated,
        Err(error) => {
            let error = DbError::from(error);
            if error.is_transient() {
                return Ok(ClaimOutcome::AlreadyHandled);
            }
            return Err(error);
        }
    };

    if updated == 0 {
        return Ok(ClaimOutcome::AlreadyHandled);
    }

    append_history(connection, command_id, Some(from), to, &now)?;
    Ok(ClaimOutcome::Acquired)
}

pub fn find_latest_open_remote_stop(
    connection: &Connection,
    transaction_id: i64,
) -> Result<Option<CommandRecord>, DbError> {
    let sql = format!(
        "SELECT {COMMAND_COLUMNS} FROM commands
         WHERE command_type = ?1 AND transaction_id = ?2 AND status IN {}
         ORDER BY created_at DESC, rowid DESC
         LIMIT 1",
        CommandStatus::open_sql_list()
    );
    connection
        .query_row(
            &sql,
            params![CommandType::RemoteStop.as_str(), transaction_id],
            map_command,
        )
        .optional()
        .map_err(DbError::from)
}

/// A command issued without a connector (stored as NULL or 0) matches a start
/// on any connector.
pub fn find_latest_open_remote_start(
    connection: &Connection,
    charge_box_id: &str,
    id_tag: &str,
    connector_id: Option<i64>,
) -> Result<Option<CommandRecord>, DbError> {
    let sql = format!(
        "SELECT {COMMAND_COLUMNS} FROM commands
         WHERE command_type = ?1 AND charge_box_id = ?2 AND id_tag = ?3
           AND (?4 IS NULL OR COALESCE(connector_id, 0) IN (0, ?4))
           AND status IN {}
         ORDER BY created_at DESC, rowid DESC
         LIMIT 1",
        CommandStatus::open_sql_list()
    );
    connection
        .query_row(
            &sql,
            params![
                CommandType::RemoteStart.as_str(),
                charge_box_id,
                id_tag,
                connector_id
            ],
            map_command,
        )
        .optional()
        .map_err(DbError::from)
}

pub fn get_command(connection: &Connection, id: &str) -> Result<Option<CommandRecord>, DbError> {
    let sql = format!("SELECT {COMMAND_COLUMNS} FROM commands WHERE id = ?1");
    connection
        .query_row(&sql, [id], map_command)
        .optional()
        .map_err(DbError::from)
}

pub fn list_commands(
    connection: &Connection,
    filter: &CommandFilter,
) -> Result<Vec<CommandRecord>, DbError> {
    let mut clauses: Vec<&str> = Vec::new();
    let mut values: Vec<SqlValue> = Vec::new();

    if let Some(transaction_id) = filter.transaction_id {
        clauses.push("transaction_id = ?");
        values.push(SqlValue::Integer(transaction_id));
    }
    if let Some(charge_box_id) = &filter.charge_box_id {
        clauses.push("charge_box_id = ?");
        values.push(SqlValue::Text(charge_box_id.clone()));
    }
    if let Some(status) = filter.status {
        clauses.push("status = ?");
        values.push(SqlValue::Text(status.as_str().to_string()));
    }

    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    let sql = format!(
        "SELECT {COMMAND_COLUMNS} FROM commands {where_sql}
         ORDER BY created_at DESC, rowid DESC
         LIMIT ?"
    );
    values.push(SqlValue::Integer(i64::from(filter.limit)));

    let mut statement = connection.prepare(&sql)?;
    let rows = statement.query_map(params_from_iter(values.iter()), map_command)?;

    let mut commands = Vec::new();
    for row in rows {
        commands.push(row?);
    }

    Ok(commands)
}

pub fn list_status_history(
    connection: &Connection,
    command_id: &str,
) -> Result<Vec<CommandStatusChange>, DbError> {
    let mut statement = connection.prepare(
        "SELECT command_id, from_status, to_status, changed_at
         FROM command_status_history
         WHERE command_id = ?1
         ORDER BY id ASC",
    )?;
    let rows = statement.query_map([command_id], |row| {
        let from_status: Option<String> = row.get(1)?;
        let to_status: String = row.get(2)?;
        Ok(CommandStatusChange {
            command_id: row.get(0)?,
            from_status: from_status
                .map(|value| parse_status(1, &value))
                .transpose()?,
            to_status: parse_status(2, &to_status)?,
            changed_at: timestamp_at(row, 3)?,
        })
    })?;

    let mut history = Vec::new();
    for row in rows {
        history.push(row?);
    }

    Ok(history)
}

fn append_history(
    connection: &Connection,
    command_id: &str,
    from: Option<CommandStatus>,
    to: CommandStatus,
    changed_at: &str,
) -> Result<(), DbError> {
    connection.execute(
        "INSERT INTO command_status_history (command_id, from_status, to_status, changed_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![command_id, from.map(CommandStatus::as_str), to.as_str(), changed_at],
    )?;
    Ok(())
}

fn parse_status(index: usize, value: &str) -> rusqlite::Result<CommandStatus> {
    CommandStatus::parse(value)
        .ok_or_else(|| conversion_error(index, format!("unknown command status '{value}'")))
}

fn map_command(row: &Row<'_>) -> rusqlite::Result<CommandRecord> {
    let command_type: String = row.get(1)?;
    let command_type = CommandType::parse(&command_type)
        .ok_or_else(|| conversion_error(1, format!("unknown command type '{command_type}'")))?;
    let status: String = row.get(7)?;

    Ok(CommandRecord {
        id: row.get(0)?,
        command_type,
        charge_box_id: row.get(2)?,
        id_tag: row.get(3)?,
        connector_id: row.get(4)?,
        transaction_id: row.get(5)?,
        idempotency_key: row.get(6)?,
        status: parse_status(7, &status)?,
        payload: json_at(row, 8)?,
        response: optional_json_at(row, 9)?,
        session_id: row.get(10)?,
        requested_by: row.get(11)?,
        created_at: timestamp_at(row, 12)?,
        updated_at: timestamp_at(row, 13)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::json;

    use crate::adapters::db::{DbError, SqliteStore};
    use crate::domain::command_state::{
        ClaimOutcome, CommandStatus, CommandType, remote_start_key, remote_stop_key,
    };
    use crate::domain::models::{CommandFilter, NewCommandRecord};

    use super::{
        find_latest_open_remote_start, find_latest_open_remote_stop, find_open_command_by_key,
        get_command, insert_command, list_commands, list_status_history, transition_status,
    };

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 8, 14, 15, minute, 0).unwrap()
    }

    fn remote_start(connector_id: Option<i64>, minute: u32) -> NewCommandRecord {
        NewCommandRecord {
            command_type: CommandType::RemoteStart,
            charge_box_id: Some("CB-01".to_string()),
            id_tag: Some("TAG-1".to_string()),
            connector_id,
            transaction_id: None,
            idempotency_key: remote_start_key("CB-01", "TAG-1", connector_id),
            payload: json!({"chargeBoxId": "CB-01", "idTag": "TAG-1"}),
            session_id: None,
            requested_by: "api".to_string(),
            created_at: at(minute),
        }
    }

    fn remote_stop(transaction_id: i64) -> NewCommandRecord {
        NewCommandRecord {
            command_type: CommandType::RemoteStop,
            charge_box_id: None,
            id_tag: None,
            connector_id: None,
            transaction_id: Some(transaction_id),
            idempotency_key: remote_stop_key(transaction_id),
            payload: json!({"transactionId": transaction_id}),
            session_id: None,
            requested_by: "api".to_string(),
            created_at: at(0),
        }
    }

    #[test]
    fn open_key_index_rejects_second_open_command() {
        let store = SqliteStore::open_in_memory().expect("store should open");

        let result = store.write(|transaction| {
            insert_command(transaction, &remote_stop(9))?;
            insert_command(transaction, &remote_stop(9))
        });

        assert!(result.is_err());
    }

    #[test]
    fn terminal_commands_free_the_idempotency_key() {
        let store = SqliteStore::open_in_memory().expect("store should open");

        store
            .write(|transaction| {
                let first = insert_command(transaction, &remote_stop(9))?;
                transition_status(
                    transaction,
                    &first,
                    CommandStatus::Pending,
                    CommandStatus::Completed,
                    None,
                    at(1),
                )?;
                assert!(find_open_command_by_key(transaction, &remote_stop_key(9))?.is_none());
                insert_command(transaction, &remote_stop(9))?;
                assert!(find_open_command_by_key(transaction, &remote_stop_key(9))?.is_some());
                Ok::<_, DbError>(())
            })
            .expect("write should succeed");
    }

    #[test]
    fn transition_is_compare_and_set() {
        let store = SqliteStore::open_in_memory().expect("store should open");
        let response = json!({"reason": "Remote"});

        let (first, second, command, history) = store
            .write(|transaction| {
                let id = insert_command(transaction, &remote_stop(11))?;
                transition_status(
                    transaction,
                    &id,
                    CommandStatus::Pending,
                    CommandStatus::Sent,
                    None,
                    at(1),
                )?;
                let complete = |minute| {
                    transition_status(
                        transaction,
                        &id,
                        CommandStatus::Sent,
                        CommandStatus::Completed,
                        Some(&response),
                        at(minute),
                    )
                };
                let first = complete(2)?;
                let second = complete(3)?;
                Ok::<_, DbError>((
                    first,
                    second,
                    get_command(transaction, &id)?,
                    list_status_history(transaction, &id)?,
                ))
            })
            .expect("write should succeed");

        assert_eq!(first, ClaimOutcome::Acquired);
        assert_eq!(second, ClaimOutcome::AlreadyHandled);

        let command = command.expect("command should exist");
        assert_eq!(command.status, CommandStatus::Completed);
        assert_eq!(command.response, Some(response));
        assert_eq!(command.updated_at, at(2));

        let statuses: Vec<CommandStatus> = history.iter().map(|change| change.to_status).collect();
        assert_eq!(
            statuses,
            vec![CommandStatus::Pending, CommandStatus::Sent, CommandStatus::Completed]
        );
        assert_eq!(history[0].from_status, None);
    }

    #[test]
    fn finds_open_commands_for_completion() {
        let store = SqliteStore::open_in_memory().expect("store should open");

        store
            .write(|transaction| {
                insert_command(transaction, &remote_stop(5))?;
                let any_connector = insert_command(transaction, &remote_start(None, 1))?;

                let stop = find_latest_open_remote_stop(transaction, 5)?;
                assert_eq!(stop.map(|command| command.transaction_id), Some(Some(5)));
                assert!(find_latest_open_remote_stop(transaction, 6)?.is_none());

                let start = find_latest_open_remote_start(transaction, "CB-01", "TAG-1", Some(2))?;
                assert_eq!(start.map(|command| command.id), Some(any_connector));
                assert!(
                    find_latest_open_remote_start(transaction, "CB-01", "OTHER", None)?.is_none()
                );
                Ok::<_, DbError>(())
            })
            .expect("write should succeed");
    }

    #[test]
    fn connector_specific_start_does_not_match_other_connector() {
        let store = SqliteStore::open_in_memory().expect("store should open");

        store
            .write(|transaction| {
                insert_command(transaction, &remote_start(Some(1), 1))?;
                let open_start = |connector| {
                    find_latest_open_remote_start(transaction, "CB-01", "TAG-1", connector)
                };
                assert!(open_start(Some(2))?.is_none());
                assert!(open_start(Some(1))?.is_some());
                assert!(open_start(None)?.is_some());
                Ok::<_, DbError>(())
            })
            .expect("write should succeed");
    }

    #[test]
    fn lists_newest_first_with_filters() {
        let store = SqliteStore::open_in_memory().expect("store should open");

        store
            .write(|transaction| {
                insert_command(transaction, &remote_start(Some(1), 1))?;
                insert_command(transaction, &remote_start(Some(2), 3))?;
                insert_command(transaction, &remote_stop(5))?;
                Ok::<_, DbError>(())
            })
            .expect("write should succeed");

        let commands = store
            .read(|connection| {
                list_commands(
                    connection,
                    &CommandFilter {
                        charge_box_id: Some("CB-01".to_string()),
                        status: Some(CommandStatus::Pending),
                        limit: 10,
                        ..CommandFilter::default()
                    },
                )
            })
            .expect("list should succeed");

        let connectors: Vec<Option<i64>> =
            commands.iter().map(|command| command.connector_id).collect();
        assert_eq!(connectors, vec![Some(2), Some(1)]);
    }
}
