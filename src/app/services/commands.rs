use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde_json::{Value, json};

use crate::adapters::db::{
    DbError, SqliteStore, commands as command_store, sessions as session_store,
};
use crate::app::services::{
    ServiceError, SharedClock, clamp_limit, optional_text, require_positive, require_text,
};
use crate::domain::command_state::{
    ClaimOutcome, CommandStatus, CommandType, remote_start_key, remote_stop_key,
};
use crate::domain::models::{CommandFilter, CommandRecord, CommandStatusChange, NewCommandRecord};

pub const DEFAULT_COMMAND_LIMIT: u32 = 100;
pub const MAX_COMMAND_LIMIT: u32 = 500;
const DEFAULT_REQUESTER: &str = "api";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateCommandResult {
    pub command_id: String,
    pub status: CommandStatus,
    pub idempotent_duplicate: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RemoteStartRequest {
    pub charge_box_id: String,
    pub id_tag: String,
    pub connector_id: Option<i64>,
    pub reservation_id: Option<i64>,
    pub requested_by: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RemoteStopRequest {
    pub transaction_id: i64,
    pub requested_by: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgement {
    Accepted,
    Rejected,
}

impl Acknowledgement {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "accepted" => Some(Self::Accepted),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }

    fn status(self) -> CommandStatus {
        match self {
            Self::Accepted => CommandStatus::Accepted,
            Self::Rejected => CommandStatus::Rejected,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandQuery {
    pub transaction_id: Option<i64>,
    pub charge_box_id: Option<String>,
    pub status: Option<CommandStatus>,
    pub limit: Option<u32>,
}

/// Result of an automatic completion attempt triggered by an ingested event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    Completed { command_id: String },
    AlreadyHandled { command_id: String },
    NoOpenCommand,
}

/// Completes the newest open RemoteStop of a transaction inside the caller's
/// transaction. A command another caller already claimed is left alone.
pub(crate) fn complete_remote_stop_in(
    connection: &Connection,
    transaction_id: i64,
    response: &Value,
    now: DateTime<Utc>,
) -> Result<CompletionOutcome, DbError> {
    let Some(command) = command_store::find_latest_open_remote_stop(connection, transaction_id)?
    else {
        tracing::debug!(transaction_id, "no open remote stop to complete");
        return Ok(CompletionOutcome::NoOpenCommand);
    };

    claim_completion(connection, command, response, now)
}

/// Start-event counterpart of [`complete_remote_stop_in`], matched on charge
/// box, id tag and connector.
pub(crate) fn complete_remote_start_in(
    connection: &Connection,
    charge_box_id: &str,
    id_tag: &str,
    connector_id: Option<i64>,
    response: &Value,
    now: DateTime<Utc>,
) -> Result<CompletionOutcome, DbError> {
    let Some(command) = command_store::find_latest_open_remote_start(
        connection,
        charge_box_id,
        id_tag,
        connector_id,
    )?
    else {
        tracing::debug!(charge_box_id, id_tag, "no open remote start to complete");
        return Ok(CompletionOutcome::NoOpenCommand);
    };

    claim_completion(connection, command, response, now)
}

fn claim_completion(
    connection: &Connection,
    command: CommandRecord,
    response: &Value,
    now: DateTime<Utc>,
) -> Result<CompletionOutcome, DbError> {
    let outcome = command_store::transition_status(
        connection,
        &command.id,
        command.status,
        CommandStatus::Completed,
        Some(response),
        now,
    )?;

    match outcome {
        ClaimOutcome::Acquired => {
            tracing::info!(
                command_id = %command.id,
                command_type = %command.command_type,
                from_status = %command.status,
                "command completed"
            );
            Ok(CompletionOutcome::Completed {
                command_id: command.id,
            })
        }
        ClaimOutcome::AlreadyHandled => {
            tracing::warn!(command_id = %command.id, "command already claimed; completion skipped");
            Ok(CompletionOutcome::AlreadyHandled {
                command_id: command.id,
            })
        }
    }
}

/// Find-or-create under the store's write lock: either the open command for
/// the key is returned unchanged, or a new one is inserted and handed off to
/// dispatch (`pending -> sent`) before the transaction commits.
fn find_or_create(
    connection: &Connection,
    new_command: &NewCommandRecord,
) -> Result<CreateCommandResult, DbError> {
    if let Some(existing) =
        command_store::find_open_command_by_key(connection, &new_command.idempotency_key)?
    {
        tracing::info!(
            command_id = %existing.id,
            idempotency_key = %new_command.idempotency_key,
            status = %existing.status,
            "open command exists; returning it"
        );
        return Ok(CreateCommandResult {
            command_id: existing.id,
            status: existing.status,
            idempotent_duplicate: true,
        });
    }

    let command_id = command_store::insert_command(connection, new_command)?;
    command_store::transition_status(
        connection,
        &command_id,
        CommandStatus::Pending,
        CommandStatus::Sent,
        None,
        new_command.created_at,
    )?;

    tracing::info!(
        command_id = %command_id,
        command_type = %new_command.command_type,
        idempotency_key = %new_command.idempotency_key,
        "command created and handed off"
    );

    Ok(CreateCommandResult {
        command_id,
        status: CommandStatus::Sent,
        idempotent_duplicate: false,
    })
}

#[derive(Clone)]
pub struct CommandOrchestrator {
    store: SqliteStore,
    clock: SharedClock,
}

impl CommandOrchestrator {
    pub fn new(store: SqliteStore, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    pub fn issue_remote_start(
        &self,
        request: &RemoteStartRequest,
    ) -> Result<CreateCommandResult, ServiceError> {
        let charge_box_id = require_text("chargeBoxId", &request.charge_box_id)?;
        let id_tag = require_text("idTag", &request.id_tag)?;
        let connector_id = require_positive("connectorId", request.connector_id)?;
        let reservation_id = require_positive("reservationId", request.reservation_id)?;

        let new_command = NewCommandRecord {
            command_type: CommandType::RemoteStart,
            idempotency_key: remote_start_key(&charge_box_id, &id_tag, connector_id),
            payload: json!({
                "chargeBoxId": charge_box_id,
                "idTag": id_tag,
                "connectorId": connector_id,
                "reservationId": reservation_id,
            }),
            charge_box_id: Some(charge_box_id),
            id_tag: Some(id_tag),
            connector_id,
            transaction_id: None,
            session_id: None,
            requested_by: requester(request.requested_by.as_deref()),
            created_at: self.clock.now(),
        };

        self.store.write(|transaction| {
            find_or_create(transaction, &new_command).map_err(ServiceError::from)
        })
    }

    pub fn issue_remote_stop(
        &self,
        request: &RemoteStopRequest,
    ) -> Result<CreateCommandResult, ServiceError> {
        let transaction_id = request.transaction_id;
        require_positive("transactionId", Some(transaction_id))?;
        let requested_by = requester(request.requested_by.as_deref());
        let now = self.clock.now();

        self.store.write(|transaction| {
            let session = session_store::find_session(transaction, transaction_id)?
                .ok_or_else(|| ServiceError::not_found("session", transaction_id))?;
            if session.stopped_at.is_some() {
                return Err(ServiceError::Conflict(format!(
                    "session for transaction {transaction_id} is already stopped"
                )));
            }

            let new_command = NewCommandRecord {
                command_type: CommandType::RemoteStop,
                charge_box_id: session.charge_box_id.clone(),
                id_tag: None,
                connector_id: session.connector_id,
                transaction_id: Some(transaction_id),
                idempotency_key: remote_stop_key(transaction_id),
                payload: json!({
                    "transactionId": transaction_id,
                    "chargeBoxId": session.charge_box_id,
                }),
                session_id: Some(session.id),
                requested_by,
                created_at: now,
            };

            find_or_create(transaction, &new_command).map_err(ServiceError::from)
        })
    }

    pub fn complete_remote_stop(
        &self,
        transaction_id: i64,
        response: &Value,
    ) -> Result<CompletionOutcome, ServiceError> {
        let now = self.clock.now();
        self.store.write(|transaction| {
            complete_remote_stop_in(transaction, transaction_id, response, now)
                .map_err(ServiceError::from)
        })
    }

    pub fn complete_remote_start(
        &self,
        charge_box_id: &str,
        id_tag: &str,
        connector_id: Option<i64>,
        response: &Value,
    ) -> Result<CompletionOutcome, ServiceError> {
        let now = self.clock.now();
        self.store.write(|transaction| {
            complete_remote_start_in(
                transaction,
                charge_box_id,
                id_tag,
                connector_id,
                response,
                now,
            )
            .map_err(ServiceError::from)
        })
    }

    /// Records the dispatch channel's answer. Only a `sent` command can be
    /// acknowledged.
    pub fn acknowledge(
        &self,
        command_id: &str,
        acknowledgement: Acknowledgement,
        response: Option<&Value>,
    ) -> Result<CommandRecord, ServiceError> {
        let now = self.clock.now();
        let next = acknowledgement.status();

        self.store.write(|transaction| {
            let command = command_store::get_command(transaction, command_id)?
                .ok_or_else(|| ServiceError::not_found("command", command_id))?;

            if command.status != CommandStatus::Sent || !command.status.can_transition_to(next) {
                return Err(ServiceError::Conflict(format!(
                    "command {command_id} is {} and cannot become {next}",
                    command.status
                )));
            }

            match command_store::transition_status(
                transaction,
                command_id,
                command.status,
                next,
                response,
                now,
            )? {
                ClaimOutcome::Acquired => {
                    tracing::info!(command_id, status = %next, "command acknowledged");
                }
                ClaimOutcome::AlreadyHandled => {
                    return Err(ServiceError::Conflict(format!(
                        "command {command_id} changed concurrently"
                    )));
                }
            }

            command_store::get_command(transaction, command_id)?
                .ok_or_else(|| ServiceError::not_found("command", command_id))
        })
    }

    pub fn get(&self, command_id: &str) -> Result<CommandRecord, ServiceError> {
        self.store
            .read(|connection| {
                command_store::get_command(connection, command_id).map_err(ServiceError::from)
            })?
            .ok_or_else(|| ServiceError::not_found("command", command_id))
    }

    pub fn history(&self, command_id: &str) -> Result<Vec<CommandStatusChange>, ServiceError> {
        self.store.read(|connection| {
            command_store::list_status_history(connection, command_id).map_err(ServiceError::from)
        })
    }

    pub fn list(&self, query: &CommandQuery) -> Result<Vec<CommandRecord>, ServiceError> {
        let filter = CommandFilter {
            transaction_id: query.transaction_id,
            charge_box_id: query.charge_box_id.clone(),
            status: query.status,
            limit: clamp_limit(query.limit, DEFAULT_COMMAND_LIMIT, MAX_COMMAND_LIMIT),
        };

        self.store.read(|connection| {
            command_store::list_commands(connection, &filter).map_err(ServiceError::from)
        })
    }
}

fn requester(value: Option<&str>) -> String {
    optional_text(value).unwrap_or_else(|| DEFAULT_REQUESTER.to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};
    use std::thread;

    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::json;

    use crate::app::services::ServiceError;
    use crate::app::services::sessions::SessionTracker;
    use crate::domain::command_state::CommandStatus;
    use crate::domain::session_state::{StartObservation, StopObservation};
    use crate::test_support::{FixedClock, file_store, in_memory_store};

    use super::{
        Acknowledgement, CommandOrchestrator, CommandQuery, CompletionOutcome, RemoteStartRequest,
        RemoteStopRequest,
    };

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 8, 14, 15, minute, 0).unwrap()
    }

    fn start_request(connector_id: Option<i64>) -> RemoteStartRequest {
        RemoteStartRequest {
            charge_box_id: "CB-01".to_string(),
            id_tag: "TAG-1".to_string(),
            connector_id,
            ..RemoteStartRequest::default()
        }
    }

    fn open_session(tracker: &SessionTracker, transaction_id: i64) {
        tracker
            .open(
                transaction_id,
                &StartObservation {
                    charge_box_id: Some("CB-01".to_string()),
                    id_tag: Some("TAG-1".to_string()),
                    connector_id: Some(1),
                    mode: None,
                    started_at: at(0),
                    meter_start: Some(0),
                },
            )
            .expect("session should open");
    }

    #[test]
    fn remote_start_is_idempotent_while_open() {
        let orchestrator = CommandOrchestrator::new(in_memory_store(), FixedClock::shared(at(1)));

        let first = orchestrator
            .issue_remote_start(&start_request(Some(1)))
            .expect("first start should be created");
        let second = orchestrator
            .issue_remote_start(&start_request(Some(1)))
            .expect("second start should be deduplicated");
        let other_connector = orchestrator
            .issue_remote_start(&start_request(Some(2)))
            .expect("other connector gets its own command");

        assert_eq!(first.status, CommandStatus::Sent);
        assert!(!first.idempotent_duplicate);
        assert_eq!(second.command_id, first.command_id);
        assert!(second.idempotent_duplicate);
        assert_ne!(other_connector.command_id, first.command_id);

        let history = orchestrator
            .history(&first.command_id)
            .expect("history should load");
        let statuses: Vec<CommandStatus> = history.iter().map(|change| change.to_status).collect();
        assert_eq!(statuses, vec![CommandStatus::Pending, CommandStatus::Sent]);
    }

    #[test]
    fn concurrent_remote_starts_create_one_command() {
        let db_path = crate::test_support::temp_db_path("concurrent-start.sqlite");
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let store = file_store(&db_path);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let orchestrator = CommandOrchestrator::new(store, FixedClock::shared(at(1)));
                    barrier.wait();
                    orchestrator
                        .issue_remote_start(&start_request(None))
                        .expect("start should succeed")
                })
            })
            .collect();

        let results: Vec<_> = handles
            .into_iter()
            .map(|handle| handle.join().expect("thread should finish"))
            .collect();

        assert_eq!(results[0].command_id, results[1].command_id);
        assert_eq!(
            results.iter().filter(|result| result.idempotent_duplicate).count(),
            1
        );

        let orchestrator =
            CommandOrchestrator::new(file_store(&db_path), FixedClock::shared(at(2)));
        let rows = orchestrator
            .list(&CommandQuery::default())
            .expect("list should succeed");
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn remote_stop_requires_an_open_session() {
        let store = in_memory_store();
        let clock = FixedClock::shared(at(5));
        let tracker = SessionTracker::new(store.clone(), clock.clone());
        let orchestrator = CommandOrchestrator::new(store, clock);

        let missing = orchestrator
            .issue_remote_stop(&RemoteStopRequest {
                transaction_id: 404,
                requested_by: None,
            })
            .expect_err("missing session must fail");
        assert!(matches!(missing, ServiceError::NotFound { entity: "session", .. }));

        open_session(&tracker, 9);
        tracker
            .stop(
                9,
                &StopObservation {
                    charge_box_id: None,
                    stopped_at: at(4),
                    reason: Some("Local".to_string()),
                },
            )
            .expect("stop should apply");

        let stopped = orchestrator
            .issue_remote_stop(&RemoteStopRequest {
                transaction_id: 9,
                requested_by: None,
            })
            .expect_err("stopped session must conflict");
        assert!(matches!(stopped, ServiceError::Conflict(_)));
    }

    #[test]
    fn completion_happens_once() {
        let store = in_memory_store();
        let clock = FixedClock::shared(at(5));
        let tracker = SessionTracker::new(store.clone(), clock.clone());
        let orchestrator = CommandOrchestrator::new(store, clock);
        open_session(&tracker, 12);

        let created = orchestrator
            .issue_remote_stop(&RemoteStopRequest {
                transaction_id: 12,
                requested_by: Some("operator".to_string()),
            })
            .expect("stop command should be created");

        let response = json!({"reason": "Remote"});
        let first = orchestrator
            .complete_remote_stop(12, &response)
            .expect("completion should succeed");
        let second = orchestrator
            .complete_remote_stop(12, &response)
            .expect("second completion should be a no-op");

        assert_eq!(
            first,
            CompletionOutcome::Completed {
                command_id: created.command_id.clone()
            }
        );
        assert_eq!(second, CompletionOutcome::NoOpenCommand);

        let command = orchestrator
            .get(&created.command_id)
            .expect("command should load");
        assert_eq!(command.status, CommandStatus::Completed);
        assert_eq!(command.response, Some(response));
        assert_eq!(command.requested_by, "operator");
        assert!(command.session_id.is_some());
    }

    #[test]
    fn acknowledge_only_from_sent() {
        let orchestrator = CommandOrchestrator::new(in_memory_store(), FixedClock::shared(at(1)));
        let created = orchestrator
            .issue_remote_start(&start_request(Some(1)))
            .expect("start should be created");

        let accepted = orchestrator
            .acknowledge(
                &created.command_id,
                Acknowledgement::Accepted,
                Some(&json!({"status": "Accepted"})),
            )
            .expect("sent command can be accepted");
        assert_eq!(accepted.status, CommandStatus::Accepted);

        let again = orchestrator
            .acknowledge(&created.command_id, Acknowledgement::Rejected, None)
            .expect_err("accepted command cannot be acknowledged again");
        assert!(matches!(again, ServiceError::Conflict(_)));

        let unknown = orchestrator
            .acknowledge("missing", Acknowledgement::Accepted, None)
            .expect_err("unknown command must fail");
        assert!(matches!(unknown, ServiceError::NotFound { .. }));
    }

    #[test]
    fn accepted_remote_start_completes_on_matching_start() {
        let orchestrator = CommandOrchestrator::new(in_memory_store(), FixedClock::shared(at(1)));
        let created = orchestrator
            .issue_remote_start(&start_request(None))
            .expect("start should be created");
        orchestrator
            .acknowledge(&created.command_id, Acknowledgement::Accepted, None)
            .expect("accept should succeed");

        let outcome = orchestrator
            .complete_remote_start("CB-01", "TAG-1", Some(2), &json!({"transactionId": 55}))
            .expect("completion should succeed");

        assert_eq!(
            outcome,
            CompletionOutcome::Completed {
                command_id: created.command_id
            }
        );
    }

    #[test]
    fn validates_remote_start_input() {
        let orchestrator = CommandOrchestrator::new(in_memory_store(), FixedClock::shared(at(1)));

        let blank = orchestrator
            .issue_remote_start(&RemoteStartRequest {
                charge_box_id: " ".to_string(),
                id_tag: "TAG".to_string(),
                ..RemoteStartRequest::default()
            })
            .expect_err("blank charge box must fail");
        assert!(matches!(blank, ServiceError::Validation(_)));

        let negative = orchestrator
            .issue_remote_start(&start_request(Some(-1)))
            .expect_err("negative connector must fail");
        assert!(matches!(negative, ServiceError::Validation(_)));
    }
}
