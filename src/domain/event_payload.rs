use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde_json::{Map, Value};

use crate::domain::models::ChargingMode;

pub const START_TRANSACTION: &str = "StartTransaction";
pub const STOP_TRANSACTION: &str = "StopTransaction";
pub const STATUS_NOTIFICATION: &str = "StatusNotification";
pub const METER_VALUES: &str = "MeterValues";
pub const HEARTBEAT: &str = "Heartbeat";

const PLACEHOLDER: &str = "-";

const EVENT_ID_KEYS: &[&str] = &["eventId", "id"];
const TIMESTAMP_KEYS: &[&str] = &["timestamp"];
const METER_START_KEYS: &[&str] = &["meterStart", "meter_start"];
const METER_STOP_KEYS: &[&str] = &["meterStop", "meter_stop"];
const CONNECTOR_KEYS: &[&str] = &["connectorId", "connector_id"];
const STATUS_KEYS: &[&str] = &["status", "connectorStatus"];
const REASON_KEYS: &[&str] = &["reason", "stopReason"];
const MODE_KEYS: &[&str] = &["mode", "currentType"];

/// Telemetry event after boundary validation, before it is stored.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEvent {
    pub event_type: String,
    pub transaction_ref: Option<i64>,
    pub charge_box_id: Option<String>,
    pub connector_ref: Option<i64>,
    pub id_tag: Option<String>,
    pub reason: Option<String>,
    pub explicit_event_id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub payload: Value,
}

impl NormalizedEvent {
    pub fn is_transaction_lifecycle(&self) -> bool {
        self.event_type == START_TRANSACTION || self.event_type == STOP_TRANSACTION
    }

    /// Input timestamp, else `payload.timestamp`, else the time it was received.
    pub fn occurred_at(&self, received_at: DateTime<Utc>) -> DateTime<Utc> {
        self.timestamp
            .or_else(|| payload_timestamp(&self.payload))
            .unwrap_or(received_at)
    }

    pub fn kind(&self) -> EventKind {
        let object = self.payload.as_object();
        let connector_id = self
            .connector_ref
            .or_else(|| object.and_then(|object| find_i64(object, CONNECTOR_KEYS)));

        match self.event_type.as_str() {
            START_TRANSACTION => EventKind::StartTransaction {
                meter_start: object.and_then(|object| find_i64(object, METER_START_KEYS)),
                connector_id,
                mode: object
                    .and_then(|object| find_text(object, MODE_KEYS))
                    .and_then(|value| ChargingMode::parse(&value)),
            },
            STOP_TRANSACTION => EventKind::StopTransaction {
                meter_stop: object.and_then(|object| find_i64(object, METER_STOP_KEYS)),
                reason: self
                    .reason
                    .clone()
                    .or_else(|| object.and_then(|object| find_text(object, REASON_KEYS))),
            },
            STATUS_NOTIFICATION => match object.and_then(|object| find_text(object, STATUS_KEYS)) {
                Some(status) => EventKind::StatusNotification {
                    connector_id,
                    status: ConnectorStatus::parse(&status),
                },
                None => EventKind::Unrecognized {
                    event_type: self.event_type.clone(),
                },
            },
            METER_VALUES => EventKind::MeterValues { connector_id },
            HEARTBEAT => EventKind::Heartbeat,
            other => EventKind::Unrecognized {
                event_type: other.to_string(),
            },
        }
    }
}

/// Typed view over the known event kinds. The stored payload stays opaque.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    StartTransaction {
        meter_start: Option<i64>,
        connector_id: Option<i64>,
        mode: Option<ChargingMode>,
    },
    StopTransaction {
        meter_stop: Option<i64>,
        reason: Option<String>,
    },
    StatusNotification {
        connector_id: Option<i64>,
        status: ConnectorStatus,
    },
    MeterValues {
        connector_id: Option<i64>,
    },
    Heartbeat,
    Unrecognized {
        event_type: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectorStatus {
    Available,
    Preparing,
    Charging,
    SuspendedEv,
    SuspendedEvse,
    Finishing,
    Reserved,
    Unavailable,
    Faulted,
    Other(String),
}

impl ConnectorStatus {
    pub fn parse(value: &str) -> Self {
        match normalize_key(value).as_str() {
            "available" => Self::Available,
            "preparing" => Self::Preparing,
            "charging" => Self::Charging,
            "suspendedev" => Self::SuspendedEv,
            "suspendedevse" => Self::SuspendedEvse,
            "finishing" => Self::Finishing,
            "reserved" => Self::Reserved,
            "unavailable" => Self::Unavailable,
            "faulted" => Self::Faulted,
            _ => Self::Other(value.to_string()),
        }
    }

    /// Plugged in but not delivering energy.
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::SuspendedEv | Self::SuspendedEvse | Self::Finishing)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupKey(pub String);

impl DedupKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Canonical key guaranteeing at-most-once storage of a logical event.
///
/// Priority: explicit event id, transaction lifecycle identity, payload id,
/// then type/transaction/charge box/second. Each rule writes its own prefix
/// (`event:`, `t:`, `id:`), so a caller-chosen id never lands on a derived
/// key. Two keyless events of the same type within one second collide on the
/// last rule.
pub fn derive_dedup_key(event: &NormalizedEvent, received_at: DateTime<Utc>) -> DedupKey {
    if let Some(explicit) = event.explicit_event_id.as_deref() {
        return DedupKey(format!("event:{explicit}"));
    }

    let charge_box = event.charge_box_id.as_deref().unwrap_or(PLACEHOLDER);

    if let (true, Some(transaction)) = (event.is_transaction_lifecycle(), event.transaction_ref) {
        return DedupKey(format!(
            "t:{}|tx:{transaction}|cb:{charge_box}",
            event.event_type
        ));
    }

    if let Some(payload_id) = payload_event_id(&event.payload) {
        return DedupKey(format!("id:{payload_id}"));
    }

    let transaction = event
        .transaction_ref
        .map(|value| value.to_string())
        .unwrap_or_else(|| PLACEHOLDER.to_string());
    let second = event
        .occurred_at(received_at)
        .trunc_subsecs(0)
        .to_rfc3339_opts(SecondsFormat::Secs, true);

    DedupKey(format!(
        "t:{}|tx:{transaction}|cb:{charge_box}|ts:{second}",
        event.event_type
    ))
}

pub fn payload_event_id(payload: &Value) -> Option<String> {
    let object = payload.as_object()?;
    EVENT_ID_KEYS
        .iter()
        .find_map(|key| object.get(*key))
        .and_then(scalar_to_string)
}

pub fn payload_timestamp(payload: &Value) -> Option<DateTime<Utc>> {
    let object = payload.as_object()?;
    find_text(object, TIMESTAMP_KEYS).and_then(|text| parse_timestamp(&text))
}

pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text.trim())
        .ok()
        .map(|value| value.with_timezone(&Utc))
}

pub fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

/// Integer from a JSON number or a numeric string.
pub fn value_to_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64().or_else(|| {
            number
                .as_f64()
                .filter(|float| float.fract() == 0.0 && float.is_finite())
                .map(|float| float as i64)
        }),
        Value::String(text) => text.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn find_i64(object: &Map<String, Value>, aliases: &[&str]) -> Option<i64> {
    find_value(object, aliases).and_then(value_to_i64)
}

fn find_text(object: &Map<String, Value>, aliases: &[&str]) -> Option<String> {
    find_value(object, aliases).and_then(scalar_to_string)
}

fn find_value<'a>(object: &'a Map<String, Value>, aliases: &[&str]) -> Option<&'a Value> {
    for alias in aliases {
        if let Some(value) = object.get(*alias) {
            return Some(value);
        }
    }

    let normalized_aliases: Vec<String> =
        aliases.iter().map(|alias| normalize_key(alias)).collect();

    object.iter().find_map(|(key, value)| {
        let normalized_key = normalize_key(key);
        if normalized_aliases
            .iter()
            .any(|alias| alias == &normalized_key)
        {
            Some(value)
        } else {
            None
        }
    })
}

fn normalize_key(value: &str) -> String {
    value
        .chars()
        .filter(|char| char.is_ascii_alphanumeric())
        .flat_map(|char| char.to_lowercase())
        .collect()
}
