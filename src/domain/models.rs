use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::command_state::{CommandStatus, CommandType};
use crate::domain::session_state::SessionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargingMode {
    #[serde(rename = "AC")]
    Ac,
    #[serde(rename = "DC")]
    Dc,
}

impl ChargingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ac => "AC",
            Self::Dc => "DC",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "AC" => Some(Self::Ac),
            "DC" => Some(Self::Dc),
            _ => None,
        }
    }
}

impl fmt::Display for ChargingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TariffMode {
    #[serde(rename = "AC")]
    Ac,
    #[serde(rename = "DC")]
    Dc,
    #[serde(rename = "ANY")]
    Any,
}

impl TariffMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ac => "AC",
            Self::Dc => "DC",
            Self::Any => "ANY",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "AC" => Some(Self::Ac),
            "DC" => Some(Self::Dc),
            "ANY" => Some(Self::Any),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TariffScope {
    Global,
    ChargeBox,
}

impl TariffScope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::ChargeBox => "charge_box",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "global" => Some(Self::Global),
            "charge_box" => Some(Self::ChargeBox),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
}

impl SessionStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(str::to_ascii_lowercase).as_deref() {
            Some("asc") => Self::Asc,
            _ => Self::Desc,
        }
    }

    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewEventRecord {
    pub source: String,
    pub event_type: String,
    pub payload: Value,
    pub charge_box_id: Option<String>,
    pub connector_ref: Option<i64>,
    pub transaction_ref: Option<i64>,
    pub id_tag: Option<String>,
    pub dedup_key: String,
    pub occurred_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub id: String,
    pub source: String,
    pub event_type: String,
    pub payload: Value,
    pub charge_box_id: Option<String>,
    pub connector_ref: Option<i64>,
    pub transaction_ref: Option<i64>,
    pub id_tag: Option<String>,
    pub dedup_key: String,
    pub occurred_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub event_type: Option<String>,
    pub charge_box_id: Option<String>,
    pub connector_ref: Option<i64>,
    pub transaction_ref: Option<i64>,
    pub id_tag: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: u32,
    pub offset: u32,
    pub sort: SortOrder,
}

/// Tariff values frozen into a session when billing starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PricingSnapshot {
    pub tariff_id: String,
    pub mode: ChargingMode,
    pub price_kwh: Decimal,
    pub connection_fee: Decimal,
    pub idle_fee_per_minute: Decimal,
    pub idle_grace_minutes: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub id: String,
    pub transaction_id: i64,
    pub charge_box_id: Option<String>,
    pub id_tag: Option<String>,
    pub connector_id: Option<i64>,
    pub mode: ChargingMode,
    pub started_at: DateTime<Utc>,
    pub start_observed: bool,
    pub stopped_at: Option<DateTime<Utc>>,
    pub stop_reason: Option<String>,
    pub meter_start: Option<i64>,
    pub pricing_snapshot: Option<PricingSnapshot>,
    pub energy_kwh: Option<Decimal>,
    pub revenue: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn status(&self) -> SessionStatus {
        if self.stopped_at.is_some() {
            SessionStatus::Completed
        } else {
            SessionStatus::Active
        }
    }

    pub fn duration_seconds(&self, now: DateTime<Utc>) -> i64 {
        let end = self.stopped_at.unwrap_or(now);
        (end - self.started_at).num_seconds().max(0)
    }

    pub fn state(&self) -> SessionState {
        SessionState {
            charge_box_id: self.charge_box_id.clone(),
            id_tag: self.id_tag.clone(),
            connector_id: self.connector_id,
            mode: self.mode,
            started_at: self.started_at,
            start_observed: self.start_observed,
            stopped_at: self.stopped_at,
            stop_reason: self.stop_reason.clone(),
            meter_start: self.meter_start,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub charge_box_id: Option<String>,
    pub id_tag: Option<String>,
    pub transaction_id: Option<i64>,
    pub status: Option<SessionStatus>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: u32,
    pub offset: u32,
    pub sort: SortOrder,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewCommandRecord {
    pub command_type: CommandType,
    pub charge_box_id: Option<String>,
    pub id_tag: Option<String>,
    pub connector_id: Option<i64>,
    pub transaction_id: Option<i64>,
    pub idempotency_key: String,
    pub payload: Value,
    pub session_id: Option<String>,
    pub requested_by: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandRecord {
    pub id: String,
    pub command_type: CommandType,
    pub charge_box_id: Option<String>,
    pub id_tag: Option<String>,
    pub connector_id: Option<i64>,
    pub transaction_id: Option<i64>,
    pub idempotency_key: String,
    pub status: CommandStatus,
    pub payload: Value,
    pub response: Option<Value>,
    pub session_id: Option<String>,
    pub requested_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandStatusChange {
    pub command_id: String,
    pub from_status: Option<CommandStatus>,
    pub to_status: CommandStatus,
    pub changed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct CommandFilter {
    pub transaction_id: Option<i64>,
    pub charge_box_id: Option<String>,
    pub status: Option<CommandStatus>,
    pub limit: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewTariffRecord {
    pub scope: TariffScope,
    pub charge_box_id: Option<String>,
    pub applies_mode: TariffMode,
    pub valid_from: DateTime<Utc>,
    pub valid_to: Option<DateTime<Utc>>,
    pub price_ac_kwh: Decimal,
    pub price_dc_kwh: Decimal,
    pub connection_fee: Decimal,
    pub idle_fee_per_minute: Decimal,
    pub idle_grace_minutes: Decimal,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TariffRecord {
    pub id: String,
    /// Insertion order, breaks ties between rows created in the same millisecond.
    pub revision: i64,
    pub scope: TariffScope,
    pub charge_box_id: Option<String>,
    pub applies_mode: TariffMode,
    pub valid_from: DateTime<Utc>,
    pub valid_to: Option<DateTime<Utc>>,
    pub price_ac_kwh: Decimal,
    pub price_dc_kwh: Decimal,
    pub connection_fee: Decimal,
    pub idle_fee_per_minute: Decimal,
    pub idle_grace_minutes: Decimal,
    pub created_at: DateTime<Utc>,
}

impl TariffRecord {
    pub fn price_for(&self, mode: ChargingMode) -> Decimal {
        match mode {
            ChargingMode::Ac => self.price_ac_kwh,
            ChargingMode::Dc => self.price_dc_kwh,
        }
    }

    pub fn snapshot(&self, mode: ChargingMode) -> PricingSnapshot {
        PricingSnapshot {
            tariff_id: self.id.clone(),
            mode,
            price_kwh: self.price_for(mode),
            connection_fee: self.connection_fee,
            idle_fee_per_minute: self.idle_fee_per_minute,
            idle_grace_minutes: self.idle_grace_minutes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostBreakdown {
    pub price_kwh: Decimal,
    pub energy_kwh: Decimal,
    pub energy_cost: Decimal,
    pub idle_minutes: Decimal,
    pub billable_idle_minutes: Decimal,
    pub idle_cost: Decimal,
    pub connection_fee: Decimal,
    pub total: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvoiceUpsert {
    pub session_id: String,
    pub transaction_id: i64,
    pub charge_box_id: Option<String>,
    pub id_tag: Option<String>,
    pub started_at: DateTime<Utc>,
    pub stopped_at: DateTime<Utc>,
    pub energy_kwh: Decimal,
    pub idle_minutes: Decimal,
    pub total: Decimal,
    pub breakdown: CostBreakdown,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvoiceRecord {
    pub id: String,
    pub session_id: String,
    pub transaction_id: i64,
    pub charge_box_id: Option<String>,
    pub id_tag: Option<String>,
    pub started_at: DateTime<Utc>,
    pub stopped_at: DateTime<Utc>,
    pub energy_kwh: Decimal,
    pub idle_minutes: Decimal,
    pub total: Decimal,
    pub breakdown: CostBreakdown,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct InvoiceFilter {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub charge_box_id: Option<String>,
    pub id_tag: Option<String>,
    pub limit: u32,
}
