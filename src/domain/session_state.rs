use chrono::{DateTime, Utc};

use crate::domain::models::ChargingMode;

pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// What happens when a Stop arrives for a transaction with no session row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBeforeStartPolicy {
    /// Open a placeholder session bounded by the stop instant; the first
    /// Start observed later supplies the real `started_at`.
    #[default]
    CreatePlaceholder,
}

/// The transition-relevant part of a session row.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub charge_box_id: Option<String>,
    pub id_tag: Option<String>,
    pub connector_id: Option<i64>,
    pub mode: ChargingMode,
    pub started_at: DateTime<Utc>,
    pub start_observed: bool,
    pub stopped_at: Option<DateTime<Utc>>,
    pub stop_reason: Option<String>,
    pub meter_start: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StartObservation {
    pub charge_box_id: Option<String>,
    pub id_tag: Option<String>,
    pub connector_id: Option<i64>,
    pub mode: Option<ChargingMode>,
    pub started_at: DateTime<Utc>,
    pub meter_start: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StopObservation {
    pub charge_box_id: Option<String>,
    pub stopped_at: DateTime<Utc>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionTransition {
    Opened(SessionState),
    Refreshed(SessionState),
    Stopped(SessionState),
    PlaceholderStopped(SessionState),
    AlreadyStopped,
}

impl SessionTransition {
    pub fn state(&self) -> Option<&SessionState> {
        match self {
            Self::Opened(state)
            | Self::Refreshed(state)
            | Self::Stopped(state)
            | Self::PlaceholderStopped(state) => Some(state),
            Self::AlreadyStopped => None,
        }
    }
}

/// Upsert semantics of a Start: earliest observed start wins, descriptive
/// fields follow the latest non-empty value.
pub fn apply_start(current: Option<&SessionState>, start: &StartObservation) -> SessionTransition {
    let Some(current) = current else {
        return SessionTransition::Opened(SessionState {
            charge_box_id: start.charge_box_id.clone(),
            id_tag: start.id_tag.clone(),
            connector_id: start.connector_id,
            mode: start.mode.unwrap_or(ChargingMode::Ac),
            started_at: start.started_at,
            start_observed: true,
            stopped_at: None,
            stop_reason: None,
            meter_start: start.meter_start,
        });
    };

    let started_at = if current.start_observed {
        current.started_at.min(start.started_at)
    } else {
        start.started_at
    };

    SessionTransition::Refreshed(SessionState {
        charge_box_id: start
            .charge_box_id
            .clone()
            .or_else(|| current.charge_box_id.clone()),
        id_tag: start.id_tag.clone().or_else(|| current.id_tag.clone()),
        connector_id: start.connector_id.or(current.connector_id),
        mode: start.mode.unwrap_or(current.mode),
        started_at,
        start_observed: true,
        stopped_at: current.stopped_at,
        stop_reason: current.stop_reason.clone(),
        meter_start: current.meter_start.or(start.meter_start),
    })
}

/// First Stop wins; a Stop against a terminal session changes nothing.
pub fn apply_stop(
    current: Option<&SessionState>,
    stop: &StopObservation,
    policy: StopBeforeStartPolicy,
) -> SessionTransition {
    match (current, policy) {
        (Some(current), _) if current.stopped_at.is_some() => SessionTransition::AlreadyStopped,
        (Some(current), _) => SessionTransition::Stopped(SessionState {
            charge_box_id: current
                .charge_box_id
                .clone()
                .or_else(|| stop.charge_box_id.clone()),
            stopped_at: Some(stop.stopped_at),
            stop_reason: stop.reason.clone(),
            ..current.clone()
        }),
        (None, StopBeforeStartPolicy::CreatePlaceholder) => {
            SessionTransition::PlaceholderStopped(SessionState {
                charge_box_id: stop.charge_box_id.clone(),
                id_tag: None,
                connector_id: None,
                mode: ChargingMode::Ac,
                started_at: stop.stopped_at,
                start_observed: false,
                stopped_at: Some(stop.stopped_at),
                stop_reason: stop.reason.clone(),
                meter_start: None,
            })
        }
    }
}
