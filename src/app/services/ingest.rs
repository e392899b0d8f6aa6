use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde_json::{Map, Value};

use crate::adapters::db::{DbError, SqliteStore, events as event_store};
use crate::app::services::commands::{complete_remote_start_in, complete_remote_stop_in};
use crate::app::services::sessions::{open_from_event, stop_from_event};
use crate::app::services::{ServiceError, SharedClock, clamp_limit};
use crate::domain::event_payload::{
    EventKind, NormalizedEvent, derive_dedup_key, parse_timestamp, scalar_to_string, value_to_i64,
};
use crate::domain::models::{EventFilter, EventRecord, NewEventRecord, SortOrder};
use crate::domain::session_state::{StartObservation, StopBeforeStartPolicy, StopObservation};

pub const DEFAULT_EVENT_LIMIT: u32 = 100;
pub const MAX_EVENT_LIMIT: u32 = 500;

/// Ingest request after shape validation. Numeric references may arrive as
/// numbers or numeric strings.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestRequest {
    pub event: NormalizedEvent,
}

impl IngestRequest {
    pub fn from_json(body: Value) -> Result<Self, ServiceError> {
        let Value::Object(object) = &body else {
            return Err(ServiceError::validation("event body must be a JSON object"));
        };

        let event_type = object
            .get("type")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| ServiceError::validation("type is required"))?
            .to_string();

        let timestamp = match object.get("timestamp") {
            None | Some(Value::Null) => None,
            Some(Value::String(text)) => Some(parse_timestamp(text).ok_or_else(|| {
                ServiceError::validation("timestamp must be an RFC 3339 date-time")
            })?),
            Some(_) => {
                return Err(ServiceError::validation(
                    "timestamp must be an RFC 3339 date-time",
                ));
            }
        };

        let payload = match object.get("payload") {
            None | Some(Value::Null) => body.clone(),
            Some(Value::Object(payload)) => Value::Object(payload.clone()),
            Some(_) => return Err(ServiceError::validation("payload must be a JSON object")),
        };

        Ok(Self {
            event: NormalizedEvent {
                event_type,
                transaction_ref: integer_field(
                    object,
                    &["transactionId", "transaction_ref"],
                    "transactionId",
                )?,
                charge_box_id: text_field(object, &["chargeBoxId", "charge_box_id"]),
                connector_ref: integer_field(
                    object,
                    &["connectorId", "connector_ref"],
                    "connectorId",
                )?,
                id_tag: text_field(object, &["idTag", "id_tag"]),
                reason: text_field(object, &["reason"]),
                explicit_event_id: object
                    .get("eventId")
                    .or_else(|| object.get("event_id"))
                    .and_then(scalar_to_string),
                timestamp,
                payload,
            },
        })
    }
}

fn text_field(object: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| object.get(*key))
        .and_then(scalar_to_string)
}

fn integer_field(
    object: &Map<String, Value>,
    keys: &[&str],
    name: &str,
) -> Result<Option<i64>, ServiceError> {
    match keys.iter().find_map(|key| object.get(*key)) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value_to_i64(value)
            .map(Some)
            .ok_or_else(|| ServiceError::validation(format!("{name} must be an integer"))),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOutcome {
    pub event_id: String,
    pub duplicate: bool,
}

#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub event_type: Option<String>,
    pub charge_box_id: Option<String>,
    pub connector_ref: Option<i64>,
    pub transaction_ref: Option<i64>,
    pub id_tag: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub sort: SortOrder,
}

#[derive(Clone)]
pub struct EventIngestor {
    store: SqliteStore,
    clock: SharedClock,
    source: String,
    policy: StopBeforeStartPolicy,
}

impl EventIngestor {
    pub fn new(store: SqliteStore, clock: SharedClock, source: impl Into<String>) -> Self {
        Self {
            store,
            clock,
            source: source.into(),
            policy: StopBeforeStartPolicy::default(),
        }
    }

    /// Stores the event at most once and, when it is new, applies it to the
    /// session and command state in the same transaction.
    pub fn ingest(&self, request: &IngestRequest) -> Result<IngestOutcome, ServiceError> {
        let received_at = self.clock.now();
        let event = &request.event;
        let kind = event.kind();
        let dedup_key = derive_dedup_key(event, received_at);
        let occurred_at = event.occurred_at(received_at);

        let new_event = NewEventRecord {
            source: self.source.clone(),
            event_type: event.event_type.clone(),
            payload: event.payload.clone(),
            charge_box_id: event.charge_box_id.clone(),
            connector_ref: event.connector_ref.or(kind_connector(&kind)),
            transaction_ref: event.transaction_ref,
            id_tag: event.id_tag.clone(),
            dedup_key: dedup_key.as_str().to_string(),
            occurred_at,
            created_at: received_at,
        };
        tracing::debug!(
            dedup_key = dedup_key.as_str(),
            event_type = %event.event_type,
            "ingesting event"
        );

        self.store.write(|transaction| {
            let Some(event_id) = event_store::insert_event_if_absent(transaction, &new_event)?
            else {
                let existing = event_store::get_event_by_dedup_key(transaction, dedup_key.as_str())?
                    .ok_or_else(|| ServiceError::Internal("duplicate event vanished".to_string()))?;
                tracing::info!(
                    event_id = %existing.id,
                    event_type = %event.event_type,
                    "duplicate event ignored"
                );
                return Ok(IngestOutcome {
                    event_id: existing.id,
                    duplicate: true,
                });
            };

            apply_event(transaction, event, &kind, occurred_at, received_at, self.policy)?;
            tracing::info!(event_id = %event_id, event_type = %event.event_type, "event accepted");

            Ok(IngestOutcome {
                event_id,
                duplicate: false,
            })
        })
    }

    pub fn get(&self, event_id: &str) -> Result<EventRecord, ServiceError> {
        self.store
            .read(|connection| {
                event_store::get_event(connection, event_id).map_err(ServiceError::from)
            })?
            .ok_or_else(|| ServiceError::not_found("event", event_id))
    }

    pub fn list(&self, query: &EventQuery) -> Result<Vec<EventRecord>, ServiceError> {
        let filter = EventFilter {
            event_type: query.event_type.clone(),
            charge_box_id: query.charge_box_id.clone(),
            connector_ref: query.connector_ref,
            transaction_ref: query.transaction_ref,
            id_tag: query.id_tag.clone(),
            from: query.from,
            to: query.to,
            limit: clamp_limit(query.limit, DEFAULT_EVENT_LIMIT, MAX_EVENT_LIMIT),
            offset: query.offset.unwrap_or(0),
            sort: query.sort,
        };

        self.store.read(|connection| {
            event_store::list_events(connection, &filter).map_err(ServiceError::from)
        })
    }
}

fn kind_connector(kind: &EventKind) -> Option<i64> {
    match kind {
        EventKind::StartTransaction { connector_id, .. }
        | EventKind::StatusNotification { connector_id, .. }
        | EventKind::MeterValues { connector_id } => *connector_id,
        _ => None,
    }
}

fn apply_event(
    connection: &Connection,
    event: &NormalizedEvent,
    kind: &EventKind,
    occurred_at: DateTime<Utc>,
    now: DateTime<Utc>,
    policy: StopBeforeStartPolicy,
) -> Result<(), DbError> {
    match kind {
        EventKind::StartTransaction {
            meter_start,
            connector_id,
            mode,
        } => {
            if let Some(transaction_id) = event.transaction_ref {
                let start = StartObservation {
                    charge_box_id: event.charge_box_id.clone(),
                    id_tag: event.id_tag.clone(),
                    connector_id: *connector_id,
                    mode: *mode,
                    started_at: occurred_at,
                    meter_start: *meter_start,
                };
                open_from_event(connection, transaction_id, &start, now)?;
            } else {
                tracing::warn!("start event without transaction reference; no session opened");
            }

            if let (Some(charge_box_id), Some(id_tag)) = (&event.charge_box_id, &event.id_tag) {
                complete_remote_start_in(
                    connection,
                    charge_box_id,
                    id_tag,
                    *connector_id,
                    &event.payload,
                    now,
                )?;
            }
        }
        EventKind::StopTransaction { reason, .. } => {
            let Some(transaction_id) = event.transaction_ref else {
                tracing::warn!("stop event without transaction reference; no session changed");
                return Ok(());
            };

            let stop = StopObservation {
                charge_box_id: event.charge_box_id.clone(),
                stopped_at: occurred_at,
                reason: reason.clone(),
            };
            stop_from_event(connection, transaction_id, &stop, policy, now)?;
            complete_remote_stop_in(connection, transaction_id, &event.payload, now)?;
        }
        EventKind::Unrecognized { event_type } => {
            tracing::debug!(event_type = %event_type, "stored event of unrecognized type");
        }
        EventKind::StatusNotification { .. }
        | EventKind::MeterValues { .. }
        | EventKind::Heartbeat => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::json;

    use crate::app::services::ServiceError;
    use crate::app::services::commands::{CommandOrchestrator, RemoteStopRequest};
    use crate::app::services::sessions::SessionTracker;
    use crate::domain::command_state::CommandStatus;
    use crate::test_support::{FixedClock, in_memory_store};

    use super::{EventIngestor, EventQuery, IngestRequest};

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 8, 14, 15, minute, 0).unwrap()
    }

    fn request(body: serde_json::Value) -> IngestRequest {
        IngestRequest::from_json(body).expect("request should be valid")
    }

    fn start_event(transaction_id: i64, timestamp: &str) -> IngestRequest {
        request(json!({
            "type": "StartTransaction",
            "transactionId": transaction_id,
            "chargeBoxId": "CB-01",
            "idTag": "TAG-1",
            "timestamp": timestamp,
            "payload": {"meterStart": 1000, "connectorId": 1}
        }))
    }

    fn stop_event(transaction_id: i64, timestamp: &str) -> IngestRequest {
        request(json!({
            "type": "StopTransaction",
            "transactionId": transaction_id,
            "chargeBoxId": "CB-01",
            "reason": "EVDisconnected",
            "timestamp": timestamp,
            "payload": {"meterStop": 21000}
        }))
    }

    #[test]
    fn duplicate_stop_is_stored_once() {
        let ingestor = EventIngestor::new(in_memory_store(), FixedClock::shared(at(30)), "ocpp");

        let first = ingestor
            .ingest(&stop_event(9101, "2025-08-14T15:20:00Z"))
            .expect("first stop should be accepted");
        let second = ingestor
            .ingest(&stop_event(9101, "2025-08-14T15:21:00Z"))
            .expect("retransmitted stop should be accepted");

        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(first.event_id, second.event_id);

        let events = ingestor
            .list(&EventQuery {
                transaction_ref: Some(9101),
                ..EventQuery::default()
            })
            .expect("list should succeed");
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn out_of_order_lifecycle_converges() {
        let store = in_memory_store();
        let clock = FixedClock::shared(at(50));
        let ingestor = EventIngestor::new(store.clone(), clock.clone(), "ocpp");
        let tracker = SessionTracker::new(store, clock);

        ingestor
            .ingest(&stop_event(42, "2025-08-14T15:40:00Z"))
            .expect("stop should be accepted");
        ingestor
            .ingest(&start_event(42, "2025-08-14T15:10:00Z"))
            .expect("start should be accepted");

        let view = tracker.get(42).expect("session should exist");
        assert_eq!(view.session.started_at, at(10));
        assert_eq!(view.session.stopped_at, Some(at(40)));
        assert_eq!(view.session.meter_start, Some(1000));
        assert_eq!(view.session.connector_id, Some(1));
        assert_eq!(view.session.id_tag.as_deref(), Some("TAG-1"));
    }

    #[test]
    fn stop_event_completes_remote_stop_exactly_once() {
        let store = in_memory_store();
        let clock = FixedClock::shared(at(20));
        let ingestor = EventIngestor::new(store.clone(), clock.clone(), "ocpp");
        let orchestrator = CommandOrchestrator::new(store, clock);

        ingestor
            .ingest(&start_event(7, "2025-08-14T15:00:00Z"))
            .expect("start should be accepted");
        let command = orchestrator
            .issue_remote_stop(&RemoteStopRequest {
                transaction_id: 7,
                requested_by: None,
            })
            .expect("remote stop should be created");

        ingestor
            .ingest(&stop_event(7, "2025-08-14T15:15:00Z"))
            .expect("stop should be accepted");
        ingestor
            .ingest(&stop_event(7, "2025-08-14T15:15:00Z"))
            .expect("duplicate stop should be accepted");

        let stored = orchestrator
            .get(&command.command_id)
            .expect("command should load");
        assert_eq!(stored.status, CommandStatus::Completed);
        assert_eq!(stored.response, Some(json!({"meterStop": 21000})));

        let history = orchestrator
            .history(&command.command_id)
            .expect("history should load");
        let completions = history
            .iter()
            .filter(|change| change.to_status == CommandStatus::Completed)
            .count();
        assert_eq!(completions, 1);
    }

    #[test]
    fn body_becomes_payload_when_payload_is_missing() {
        let ingestor = EventIngestor::new(in_memory_store(), FixedClock::shared(at(1)), "ocpp");
        let body = json!({"type": "Heartbeat", "chargeBoxId": "CB-09", "transactionId": "15"});

        let outcome = ingestor
            .ingest(&request(body.clone()))
            .expect("heartbeat should be accepted");
        let stored = ingestor.get(&outcome.event_id).expect("event should load");

        assert_eq!(stored.payload, body);
        assert_eq!(stored.transaction_ref, Some(15));
        assert_eq!(stored.occurred_at, at(1));
    }

    #[test]
    fn rejects_malformed_requests() {
        for body in [
            json!({"type": "  "}),
            json!({"type": "Heartbeat", "timestamp": "yesterday"}),
            json!({"type": "Heartbeat", "payload": [1, 2]}),
            json!({"type": "Heartbeat", "transactionId": "abc"}),
            json!(["not", "an", "object"]),
        ] {
            let error = IngestRequest::from_json(body).expect_err("request must be rejected");
            assert!(matches!(error, ServiceError::Validation(_)));
        }
    }
}
