use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::adapters::db::{DbError, SqliteStore, sessions as session_store};
use crate::app::services::{ServiceError, SharedClock, clamp_limit};
use crate::domain::models::{SessionFilter, SessionRecord, SessionStatus, SortOrder};
use crate::domain::session_state::{
    SessionTransition, StartObservation, StopBeforeStartPolicy, StopObservation, apply_start,
    apply_stop,
};

pub const DEFAULT_SESSION_LIMIT: u32 = 50;
pub const MAX_SESSION_LIMIT: u32 = 500;

/// Session with its derived status and duration.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionView {
    pub session: SessionRecord,
    pub status: SessionStatus,
    pub duration_seconds: i64,
}

impl SessionView {
    pub fn derive(session: SessionRecord, now: DateTime<Utc>) -> Self {
        Self {
            status: session.status(),
            duration_seconds: session.duration_seconds(now),
            session,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionQuery {
    pub charge_box_id: Option<String>,
    pub id_tag: Option<String>,
    pub transaction_id: Option<i64>,
    pub status: Option<SessionStatus>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub sort: SortOrder,
}

/// Applies a Start to the session row of `transaction_id` inside the caller's
/// transaction and returns the stored row.
pub(crate) fn open_from_event(
    connection: &Connection,
    transaction_id: i64,
    start: &StartObservation,
    now: DateTime<Utc>,
) -> Result<SessionRecord, DbError> {
    let current = session_store::find_session(connection, transaction_id)?;
    let current_state = current.as_ref().map(SessionRecord::state);
    let transition = apply_start(current_state.as_ref(), start);

    persist_transition(connection, transaction_id, current.as_ref(), &transition, now)?;
    stored_session(connection, transaction_id)
}

/// Applies a Stop to the session row of `transaction_id` inside the caller's
/// transaction. A Stop against a terminal session leaves it untouched.
pub(crate) fn stop_from_event(
    connection: &Connection,
    transaction_id: i64,
    stop: &StopObservation,
    policy: StopBeforeStartPolicy,
    now: DateTime<Utc>,
) -> Result<SessionRecord, DbError> {
    let current = session_store::find_session(connection, transaction_id)?;
    let current_state = current.as_ref().map(SessionRecord::state);
    let transition = apply_stop(current_state.as_ref(), stop, policy);

    persist_transition(connection, transaction_id, current.as_ref(), &transition, now)?;
    stored_session(connection, transaction_id)
}

fn persist_transition(
    connection: &Connection,
    transaction_id: i64,
    current: Option<&SessionRecord>,
    transition: &SessionTransition,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    match (transition, current) {
        (SessionTransition::Opened(state), _) => {
            let session_id = session_store::insert_session(connection, transaction_id, state, now)?;
            tracing::info!(
                transaction_id,
                session_id = %session_id,
                started_at = %state.started_at,
                "session opened"
            );
        }
        (SessionTransition::PlaceholderStopped(state), _) => {
            let session_id = session_store::insert_session(connection, transaction_id, state, now)?;
            tracing::warn!(
                transaction_id,
                session_id = %session_id,
                "stop observed before start; placeholder session created"
            );
        }
        (SessionTransition::Refreshed(state), Some(current)) => {
            session_store::update_session_state(connection, &current.id, state, now)?;
            tracing::info!(
                transaction_id,
                session_id = %current.id,
                started_at = %state.started_at,
                "session refreshed from start"
            );
        }
        (SessionTransition::Stopped(state), Some(current)) => {
            session_store::update_session_state(connection, &current.id, state, now)?;
            tracing::info!(
                transaction_id,
                session_id = %current.id,
                stop_reason = state.stop_reason.as_deref().unwrap_or("-"),
                "session stopped"
            );
        }
        (SessionTransition::AlreadyStopped, _) => {
            tracing::warn!(transaction_id, "session already stopped; stop ignored");
        }
        (SessionTransition::Refreshed(_) | SessionTransition::Stopped(_), None) => {
            tracing::warn!(transaction_id, "session row vanished during transition");
        }
    }

    Ok(())
}

fn stored_session(connection: &Connection, transaction_id: i64) -> Result<SessionRecord, DbError> {
    session_store::find_session(connection, transaction_id)?
        .ok_or(DbError::Sqlite(rusqlite::Error::QueryReturnedNoRows))
}

/// Read side of the session aggregate, plus direct Start/Stop application
/// for callers outside the ingestion pipeline.
#[derive(Clone)]
pub struct SessionTracker {
    store: SqliteStore,
    clock: SharedClock,
    policy: StopBeforeStartPolicy,
}

impl SessionTracker {
    pub fn new(store: SqliteStore, clock: SharedClock) -> Self {
        Self {
            store,
            clock,
            policy: StopBeforeStartPolicy::default(),
        }
    }

    pub fn open(
        &self,
        transaction_id: i64,
        start: &StartObservation,
    ) -> Result<SessionView, ServiceError> {
        let now = self.clock.now();
        let session = self.store.write(|transaction| {
            open_from_event(transaction, transaction_id, start, now).map_err(ServiceError::from)
        })?;
        Ok(SessionView::derive(session, now))
    }

    pub fn stop(
        &self,
        transaction_id: i64,
        stop: &StopObservation,
    ) -> Result<SessionView, ServiceError> {
        let now = self.clock.now();
        let policy = self.policy;
        let session = self.store.write(|transaction| {
            stop_from_event(transaction, transaction_id, stop, policy, now)
                .map_err(ServiceError::from)
        })?;
        Ok(SessionView::derive(session, now))
    }

    pub fn get(&self, transaction_id: i64) -> Result<SessionView, ServiceError> {
        let session = self
            .store
            .read(|connection| {
                session_store::find_session(connection, transaction_id).map_err(ServiceError::from)
            })?
            .ok_or_else(|| ServiceError::not_found("session", transaction_id))?;

        Ok(SessionView::derive(session, self.clock.now()))
    }

    pub fn list(&self, query: &SessionQuery) -> Result<Vec<SessionView>, ServiceError> {
        let filter = SessionFilter {
            charge_box_id: query.charge_box_id.clone(),
            id_tag: query.id_tag.clone(),
            transaction_id: query.transaction_id,
            status: query.status,
            from: query.from,
            to: query.to,
            limit: clamp_limit(query.limit, DEFAULT_SESSION_LIMIT, MAX_SESSION_LIMIT),
            offset: query.offset.unwrap_or(0),
            sort: query.sort,
        };

        let sessions = self.store.read(|connection| {
            session_store::list_sessions(connection, &filter).map_err(ServiceError::from)
        })?;
        let now = self.clock.now();

        Ok(sessions
            .into_iter()
            .map(|session| SessionView::derive(session, now))
            .collect())
    }
}
