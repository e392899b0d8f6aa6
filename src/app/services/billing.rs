use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use rust_decimal::Decimal;

use crate::adapters::db::{
    DbError, SqliteStore, events as event_store, invoices as invoice_store,
    sessions as session_store, tariffs as tariff_store,
};
use crate::app::services::sessions::{open_from_event, stop_from_event};
use crate::app::services::{
    ServiceError, SharedClock, clamp_limit, optional_text, require_positive, require_text,
};
use crate::domain::event_payload::{EventKind, NormalizedEvent};
use crate::domain::idle::{StatusSample, idle_minutes};
use crate::domain::models::{
    ChargingMode, CostBreakdown, EventRecord, InvoiceFilter, InvoiceRecord, InvoiceUpsert,
    NewTariffRecord, PricingSnapshot, SessionRecord, TariffMode, TariffRecord, TariffScope,
};
use crate::domain::pricing::{compute_cost, pick_tariff};
use crate::domain::session_energy::{EnergyWarning, compute_session_kwh};
use crate::domain::session_state::{StartObservation, StopBeforeStartPolicy, StopObservation};

pub const DEFAULT_INVOICE_LIMIT: u32 = 100;
pub const MAX_INVOICE_LIMIT: u32 = 1000;
pub const DEFAULT_INVOICE_WINDOW_DAYS: i64 = 30;
/// Upper bound for every tariff price, fee and grace period.
pub const MAX_TARIFF_AMOUNT: Decimal = Decimal::from_parts(1_000_000, 0, 0, false, 0);
const REMOTE_STOP_REASON: &str = "Remote";

#[derive(Debug, Clone, PartialEq)]
pub struct CreateTariffRequest {
    pub scope: TariffScope,
    pub charge_box_id: Option<String>,
    pub applies_mode: Option<TariffMode>,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_to: Option<DateTime<Utc>>,
    pub price_ac_kwh: Decimal,
    pub price_dc_kwh: Decimal,
    pub connection_fee: Option<Decimal>,
    pub idle_fee_per_minute: Option<Decimal>,
    pub idle_grace_minutes: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTariff {
    pub at: DateTime<Utc>,
    pub charge_box_id: Option<String>,
    pub mode: ChargingMode,
    pub tariff: TariffRecord,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreviewRequest {
    pub charge_box_id: Option<String>,
    pub mode: ChargingMode,
    pub at: Option<DateTime<Utc>>,
    pub expected_kwh: Decimal,
    pub expected_minutes: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TariffPreview {
    pub at: DateTime<Utc>,
    pub charge_box_id: Option<String>,
    pub pricing: PricingSnapshot,
    pub expected_kwh: Decimal,
    pub expected_minutes: Decimal,
    pub breakdown: CostBreakdown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StartBillingRequest {
    pub transaction_id: i64,
    pub charge_box_id: String,
    pub connector_id: Option<i64>,
    pub id_tag: Option<String>,
    pub mode: Option<ChargingMode>,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StartBillingResult {
    pub transaction_id: i64,
    pub session_id: String,
    pub pricing_snapshot: PricingSnapshot,
    pub snapshot_created: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BillingEstimate {
    pub transaction_id: i64,
    pub energy_kwh: Decimal,
    pub duration_seconds: i64,
    pub pricing: PricingSnapshot,
    pub breakdown: CostBreakdown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CloseSessionRequest {
    pub transaction_id: i64,
    pub meter_start: i64,
    pub meter_stop: i64,
    pub stopped_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CloseSessionResult {
    pub transaction_id: i64,
    pub invoice_id: String,
    pub energy_kwh: Decimal,
    pub duration_seconds: i64,
    pub idle_minutes: Decimal,
    pub total: Decimal,
    pub breakdown: CostBreakdown,
}

#[derive(Debug, Clone, Default)]
pub struct InvoiceQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub charge_box_id: Option<String>,
    pub id_tag: Option<String>,
    pub limit: Option<u32>,
}

fn resolve_in(
    connection: &Connection,
    charge_box_id: Option<&str>,
    mode: ChargingMode,
    at: DateTime<Utc>,
) -> Result<TariffRecord, ServiceError> {
    let candidates = tariff_store::list_candidates(connection, charge_box_id, mode, at)?;
    pick_tariff(&candidates)
        .cloned()
        .ok_or_else(|| ServiceError::TariffNotFound {
            scope: charge_box_id.unwrap_or("global").to_string(),
            mode,
            at,
        })
}

/// Idle minutes of a session inside `[started_at, window_end)`, from the
/// status notifications of its charge box (and connector when known).
fn session_idle_minutes(
    connection: &Connection,
    session: &SessionRecord,
    window_end: DateTime<Utc>,
) -> Result<Decimal, DbError> {
    let Some(charge_box_id) = session.charge_box_id.as_deref() else {
        return Ok(Decimal::ZERO);
    };
    if window_end <= session.started_at {
        return Ok(Decimal::ZERO);
    }

    let samples: Vec<StatusSample> = event_store::list_status_events(
        connection,
        charge_box_id,
        session.connector_id,
        session.started_at,
        window_end,
    )?
    .into_iter()
    .filter_map(status_sample)
    .collect();

    Ok(idle_minutes(&samples, session.started_at, window_end))
}

fn status_sample(record: EventRecord) -> Option<StatusSample> {
    let occurred_at = record.occurred_at;
    let event = NormalizedEvent {
        event_type: record.event_type,
        transaction_ref: record.transaction_ref,
        charge_box_id: record.charge_box_id,
        connector_ref: record.connector_ref,
        id_tag: record.id_tag,
        reason: None,
        explicit_event_id: None,
        timestamp: Some(occurred_at),
        payload: record.payload,
    };

    match event.kind() {
        EventKind::StatusNotification { status, .. } => Some(StatusSample {
            occurred_at,
            status,
        }),
        _ => None,
    }
}

fn price(
    pricing: &PricingSnapshot,
    energy_kwh: Decimal,
    idle_minutes: Decimal,
) -> Result<CostBreakdown, ServiceError> {
    compute_cost(pricing, energy_kwh, idle_minutes)
        .map_err(|error| ServiceError::validation(error.to_string()))
}

fn meter_energy(
    meter_start: i64,
    meter_stop: i64,
    transaction_id: i64,
) -> Result<Decimal, ServiceError> {
    let result = compute_session_kwh(meter_start, meter_stop)
        .map_err(|error| ServiceError::validation(error.to_string()))?;
    if result.warnings.contains(&EnergyWarning::NegativeMeterDeltaClamped) {
        tracing::warn!(
            transaction_id,
            meter_start,
            meter_stop,
            "meter went backwards; energy clamped to zero"
        );
    }
    Ok(result.kwh)
}

#[derive(Clone)]
pub struct BillingService {
    store: SqliteStore,
    clock: SharedClock,
    policy: StopBeforeStartPolicy,
}

impl BillingService {
    pub fn new(store: SqliteStore, clock: SharedClock) -> Self {
        Self {
            store,
            clock,
            policy: StopBeforeStartPolicy::default(),
        }
    }

    pub fn create_tariff(
        &self,
        request: &CreateTariffRequest,
    ) -> Result<TariffRecord, ServiceError> {
        let charge_box_id = optional_text(request.charge_box_id.as_deref());
        match (request.scope, charge_box_id.as_ref()) {
            (TariffScope::ChargeBox, None) => {
                return Err(ServiceError::validation(
                    "charge_box scope requires chargeBoxId",
                ));
            }
            (TariffScope::Global, Some(_)) => {
                return Err(ServiceError::validation(
                    "global scope must not carry chargeBoxId",
                ));
            }
            _ => {}
        }

        if request.price_ac_kwh <= Decimal::ZERO || request.price_dc_kwh <= Decimal::ZERO {
            return Err(ServiceError::validation("kWh prices must be greater than zero"));
        }

        let connection_fee = request.connection_fee.unwrap_or(Decimal::ZERO);
        let idle_fee_per_minute = request.idle_fee_per_minute.unwrap_or(Decimal::ZERO);
        let idle_grace_minutes = request.idle_grace_minutes.unwrap_or(Decimal::ZERO);
        if connection_fee.is_sign_negative()
            || idle_fee_per_minute.is_sign_negative()
            || idle_grace_minutes.is_sign_negative()
        {
            return Err(ServiceError::validation("fees and grace minutes must not be negative"));
        }
        if [
            request.price_ac_kwh,
            request.price_dc_kwh,
            connection_fee,
            idle_fee_per_minute,
            idle_grace_minutes,
        ]
        .iter()
        .any(|amount| *amount > MAX_TARIFF_AMOUNT)
        {
            return Err(ServiceError::validation(format!(
                "tariff amounts must not exceed {MAX_TARIFF_AMOUNT}"
            )));
        }

        let now = self.clock.now();
        let valid_from = request.valid_from.unwrap_or(now);
        if let Some(valid_to) = request.valid_to
            && valid_to <= valid_from
        {
            return Err(ServiceError::validation("validTo must be after validFrom"));
        }

        let new_tariff = NewTariffRecord {
            scope: request.scope,
            charge_box_id,
            applies_mode: request.applies_mode.unwrap_or(TariffMode::Any),
            valid_from,
            valid_to: request.valid_to,
            price_ac_kwh: request.price_ac_kwh,
            price_dc_kwh: request.price_dc_kwh,
            connection_fee,
            idle_fee_per_minute,
            idle_grace_minutes,
            created_at: now,
        };

        let tariff = self.store.write(|transaction| {
            tariff_store::insert_tariff(transaction, &new_tariff).map_err(ServiceError::from)
        })?;
        tracing::info!(
            tariff_id = %tariff.id,
            scope = tariff.scope.as_str(),
            applies_mode = tariff.applies_mode.as_str(),
            "tariff created"
        );

        Ok(tariff)
    }

    pub fn resolve_tariff(
        &self,
        charge_box_id: Option<&str>,
        mode: ChargingMode,
        at: Option<DateTime<Utc>>,
    ) -> Result<ResolvedTariff, ServiceError> {
        let at = at.unwrap_or_else(|| self.clock.now());
        let charge_box_id = optional_text(charge_box_id);
        let tariff = self
            .store
            .read(|connection| resolve_in(connection, charge_box_id.as_deref(), mode, at))?;

        Ok(ResolvedTariff {
            at,
            charge_box_id,
            mode,
            tariff,
        })
    }

    /// Estimate for hypothetical consumption; negative inputs count as zero.
    pub fn preview(&self, request: &PreviewRequest) -> Result<TariffPreview, ServiceError> {
        let resolved =
            self.resolve_tariff(request.charge_box_id.as_deref(), request.mode, request.at)?;
        let expected_kwh = request.expected_kwh.max(Decimal::ZERO);
        let expected_minutes = request.expected_minutes.max(Decimal::ZERO);
        let pricing = resolved.tariff.snapshot(request.mode);
        let breakdown = price(&pricing, expected_kwh, expected_minutes)?;

        Ok(TariffPreview {
            at: resolved.at,
            charge_box_id: resolved.charge_box_id,
            pricing,
            expected_kwh,
            expected_minutes,
            breakdown,
        })
    }

    /// Opens or refreshes the session and freezes its pricing. A snapshot
    /// taken earlier is returned as is, so a retry never needs the tariff
    /// that produced it to still be valid.
    pub fn start(&self, request: &StartBillingRequest) -> Result<StartBillingResult, ServiceError> {
        let transaction_id = request.transaction_id;
        require_positive("transactionId", Some(transaction_id))?;
        let connector_id = require_positive("connectorId", request.connector_id)?;
        let charge_box_id = require_text("chargeBoxId", &request.charge_box_id)?;
        let now = self.clock.now();
        let started_at = request.started_at.unwrap_or(now);
        let mode = request.mode.unwrap_or(ChargingMode::Ac);

        let start = StartObservation {
            charge_box_id: Some(charge_box_id.clone()),
            id_tag: optional_text(request.id_tag.as_deref()),
            connector_id,
            mode: Some(mode),
            started_at,
            meter_start: None,
        };

        self.store.write(|transaction| {
            let existing = session_store::find_session(transaction, transaction_id)?;
            if let Some(frozen) = existing
                .as_ref()
                .and_then(|session| session.pricing_snapshot.clone())
            {
                let session = open_from_event(transaction, transaction_id, &start, now)?;
                tracing::info!(transaction_id, "pricing snapshot already frozen; kept");
                return Ok(StartBillingResult {
                    transaction_id,
                    session_id: session.id,
                    pricing_snapshot: frozen,
                    snapshot_created: false,
                });
            }

            let tariff = resolve_in(transaction, Some(charge_box_id.as_str()), mode, started_at)?;
            let session = open_from_event(transaction, transaction_id, &start, now)?;
            let snapshot = tariff.snapshot(mode);
            session_store::set_pricing_snapshot_if_absent(
                transaction,
                &session.id,
                &snapshot,
                now,
            )?;
            tracing::info!(
                transaction_id,
                tariff_id = %snapshot.tariff_id,
                "pricing snapshot frozen"
            );

            Ok(StartBillingResult {
                transaction_id,
                session_id: session.id,
                pricing_snapshot: snapshot,
                snapshot_created: true,
            })
        })
    }

    /// Running estimate; nothing is written.
    pub fn refresh(
        &self,
        transaction_id: i64,
        meter_latest: i64,
    ) -> Result<BillingEstimate, ServiceError> {
        let now = self.clock.now();

        self.store.read(|connection| {
            let session = session_store::find_session(connection, transaction_id)?
                .ok_or_else(|| ServiceError::not_found("session", transaction_id))?;
            let pricing = match session.pricing_snapshot.clone() {
                Some(snapshot) => snapshot,
                None => resolve_in(
                    connection,
                    session.charge_box_id.as_deref(),
                    session.mode,
                    session.started_at,
                )?
                .snapshot(session.mode),
            };

            let energy_kwh =
                meter_energy(session.meter_start.unwrap_or(0), meter_latest, transaction_id)?;
            let window_end = session.stopped_at.unwrap_or(now);
            let idle = session_idle_minutes(connection, &session, window_end)?;

            let breakdown = price(&pricing, energy_kwh, idle)?;

            Ok(BillingEstimate {
                transaction_id,
                energy_kwh,
                duration_seconds: session.duration_seconds(now),
                breakdown,
                pricing,
            })
        })
    }

    /// Finalizes totals and writes the session's single invoice. Closing again
    /// recomputes and replaces it.
    pub fn close(&self, request: &CloseSessionRequest) -> Result<CloseSessionResult, ServiceError> {
        let now = self.clock.now();
        let transaction_id = request.transaction_id;
        let energy_kwh = meter_energy(request.meter_start, request.meter_stop, transaction_id)?;
        let policy = self.policy;

        self.store.write(|transaction| {
            let existing = session_store::find_session(transaction, transaction_id)?
                .ok_or_else(|| ServiceError::not_found("session", transaction_id))?;

            let session = if existing.stopped_at.is_some() {
                existing
            } else {
                let stop = StopObservation {
                    charge_box_id: existing.charge_box_id.clone(),
                    stopped_at: request.stopped_at.unwrap_or(now),
                    reason: Some(REMOTE_STOP_REASON.to_string()),
                };
                stop_from_event(transaction, transaction_id, &stop, policy, now)?
            };
            let stopped_at = session.stopped_at.unwrap_or(now);

            let pricing = match session.pricing_snapshot.clone() {
                Some(snapshot) => snapshot,
                None => {
                    let snapshot = resolve_in(
                        transaction,
                        session.charge_box_id.as_deref(),
                        session.mode,
                        session.started_at,
                    )?
                    .snapshot(session.mode);
                    session_store::set_pricing_snapshot_if_absent(
                        transaction,
                        &session.id,
                        &snapshot,
                        now,
                    )?;
                    tracing::info!(
                        transaction_id,
                        tariff_id = %snapshot.tariff_id,
                        "pricing snapshot resolved at close"
                    );
                    snapshot
                }
            };

            let idle = session_idle_minutes(transaction, &session, stopped_at)?;
            let breakdown = price(&pricing, energy_kwh, idle)?;
            session_store::record_totals(
                transaction,
                &session.id,
                energy_kwh,
                breakdown.total,
                now,
            )?;

            let invoice_id = invoice_store::upsert_invoice(
                transaction,
                &InvoiceUpsert {
                    session_id: session.id.clone(),
                    transaction_id,
                    charge_box_id: session.charge_box_id.clone(),
                    id_tag: session.id_tag.clone(),
                    started_at: session.started_at,
                    stopped_at,
                    energy_kwh,
                    idle_minutes: idle,
                    total: breakdown.total,
                    breakdown: breakdown.clone(),
                    now,
                },
            )?;

            tracing::info!(
                transaction_id,
                invoice_id = %invoice_id,
                total = %breakdown.total,
                energy_kwh = %energy_kwh,
                idle_minutes = %idle,
                "session closed"
            );

            Ok(CloseSessionResult {
                transaction_id,
                invoice_id,
                energy_kwh,
                duration_seconds: session.duration_seconds(now),
                idle_minutes: idle,
                total: breakdown.total,
                breakdown,
            })
        })
    }

    pub fn get_invoice(&self, invoice_id: &str) -> Result<InvoiceRecord, ServiceError> {
        self.store
            .read(|connection| {
                invoice_store::get_invoice(connection, invoice_id).map_err(ServiceError::from)
            })?
            .ok_or_else(|| ServiceError::not_found("invoice", invoice_id))
    }

    pub fn list_invoices(&self, query: &InvoiceQuery) -> Result<Vec<InvoiceRecord>, ServiceError> {
        let now = self.clock.now();
        let filter = InvoiceFilter {
            from: query
                .from
                .unwrap_or_else(|| now - Duration::days(DEFAULT_INVOICE_WINDOW_DAYS)),
            to: query.to.unwrap_or(now),
            charge_box_id: optional_text(query.charge_box_id.as_deref()),
            id_tag: optional_text(query.id_tag.as_deref()),
            limit: clamp_limit(query.limit, DEFAULT_INVOICE_LIMIT, MAX_INVOICE_LIMIT),
        };

        self.store.read(|connection| {
            invoice_store::list_invoices(connection, &filter).map_err(ServiceError::from)
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};
    use rust_decimal::Decimal;
    use serde_json::json;

    use crate::adapters::db::SqliteStore;
    use crate::app::services::ServiceError;
    use crate::app::services::ingest::{EventIngestor, IngestRequest};
    use crate::app::services::sessions::SessionTracker;
    use crate::domain::models::{ChargingMode, TariffMode, TariffScope};
    use crate::test_support::{FixedClock, in_memory_store};

    use super::{
        BillingService, CloseSessionRequest, CreateTariffRequest, InvoiceQuery, PreviewRequest,
        StartBillingRequest,
    };

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 8, 14, hour, minute, 0).unwrap()
    }

    fn dec(value: &str) -> Decimal {
        value.parse().expect("decimal literal")
    }

    fn reference_tariff(scope: TariffScope, price: &str) -> CreateTariffRequest {
        CreateTariffRequest {
            scope,
            charge_box_id: match scope {
                TariffScope::Global => None,
                TariffScope::ChargeBox => Some("CB-01".to_string()),
            },
            applies_mode: None,
            valid_from: Some(at(0, 0)),
            valid_to: None,
            price_ac_kwh: dec(price),
            price_dc_kwh: dec("3.00"),
            connection_fee: Some(dec("5.00")),
            idle_fee_per_minute: Some(dec("0.50")),
            idle_grace_minutes: Some(dec("10")),
        }
    }

    fn start_request(transaction_id: i64) -> StartBillingRequest {
        StartBillingRequest {
            transaction_id,
            charge_box_id: "CB-01".to_string(),
            connector_id: Some(1),
            id_tag: Some("TAG-1".to_string()),
            mode: None,
            started_at: Some(at(10, 0)),
        }
    }

    fn ingest_status(store: &SqliteStore, minute: u32, status: &str) {
        let ingestor = EventIngestor::new(store.clone(), FixedClock::shared(at(12, 0)), "ocpp");
        ingestor
            .ingest(
                &IngestRequest::from_json(json!({
                    "type": "StatusNotification",
                    "chargeBoxId": "CB-01",
                    "connectorId": 1,
                    "timestamp": at(10, minute).to_rfc3339(),
                    "payload": {"status": status}
                }))
                .expect("status event should be valid"),
            )
            .expect("status event should be accepted");
    }

    #[test]
    fn charge_box_tariff_outranks_global() {
        let billing = BillingService::new(in_memory_store(), FixedClock::shared(at(9, 0)));
        billing
            .create_tariff(&reference_tariff(TariffScope::Global, "1.00"))
            .expect("global tariff should be created");
        let scoped = billing
            .create_tariff(&reference_tariff(TariffScope::ChargeBox, "2.00"))
            .expect("scoped tariff should be created");

        let resolved = billing
            .resolve_tariff(Some("CB-01"), ChargingMode::Ac, Some(at(10, 0)))
            .expect("tariff should resolve");

        assert_eq!(resolved.tariff.id, scoped.id);

        let missing = billing
            .resolve_tariff(
                Some("CB-01"),
                ChargingMode::Ac,
                Some(at(0, 0) - chrono::Duration::days(1)),
            )
            .expect_err("nothing valid before the first tariff");
        assert!(matches!(missing, ServiceError::TariffNotFound { .. }));
    }

    #[test]
    fn validates_tariff_creation() {
        let billing = BillingService::new(in_memory_store(), FixedClock::shared(at(9, 0)));

        let mut unscoped = reference_tariff(TariffScope::ChargeBox, "2.00");
        unscoped.charge_box_id = None;
        let mut free = reference_tariff(TariffScope::Global, "0");
        free.applies_mode = Some(TariffMode::Ac);
        let mut inverted = reference_tariff(TariffScope::Global, "2.00");
        inverted.valid_to = Some(at(0, 0));

        for request in [unscoped, free, inverted] {
            let error = billing.create_tariff(&request).expect_err("request must be rejected");
            assert!(matches!(error, ServiceError::Validation(_)));
        }
    }

    #[test]
    fn preview_clamps_negative_inputs() {
        let billing = BillingService::new(in_memory_store(), FixedClock::shared(at(9, 0)));
        billing
            .create_tariff(&reference_tariff(TariffScope::Global, "2.00"))
            .expect("tariff should be created");

        let preview = billing
            .preview(&PreviewRequest {
                charge_box_id: None,
                mode: ChargingMode::Ac,
                at: None,
                expected_kwh: dec("-4"),
                expected_minutes: dec("15"),
            })
            .expect("preview should succeed");

        assert_eq!(preview.expected_kwh, Decimal::ZERO);
        assert_eq!(preview.breakdown.total, dec("7.50"));
    }

    #[test]
    fn close_bills_reference_session_from_snapshot() {
        let store = in_memory_store();
        let billing = BillingService::new(store.clone(), FixedClock::shared(at(11, 0)));
        billing
            .create_tariff(&reference_tariff(TariffScope::ChargeBox, "2.00"))
            .expect("tariff should be created");

        billing
            .start(&start_request(501))
            .expect("billing should start");
        billing
            .create_tariff(&reference_tariff(TariffScope::ChargeBox, "9.00"))
            .expect("newer tariff should be created");

        ingest_status(&store, 0, "Charging");
        ingest_status(&store, 30, "SuspendedEV");
        ingest_status(&store, 45, "Charging");

        let closed = billing
            .close(&CloseSessionRequest {
                transaction_id: 501,
                meter_start: 1000,
                meter_stop: 21000,
                stopped_at: Some(at(11, 0)),
            })
            .expect("close should succeed");

        assert_eq!(closed.energy_kwh, dec("20"));
        assert_eq!(closed.idle_minutes, dec("15"));
        assert_eq!(closed.breakdown.energy_cost, dec("40.00"));
        assert_eq!(closed.breakdown.billable_idle_minutes, dec("5"));
        assert_eq!(closed.breakdown.idle_cost, dec("2.50"));
        assert_eq!(closed.total, dec("47.50"));
        assert_eq!(closed.duration_seconds, 3600);
    }

    #[test]
    fn closing_twice_keeps_one_invoice() {
        let billing = BillingService::new(in_memory_store(), FixedClock::shared(at(11, 0)));
        billing
            .create_tariff(&reference_tariff(TariffScope::Global, "2.00"))
            .expect("tariff should be created");
        billing
            .start(&start_request(502))
            .expect("billing should start");

        let close = |meter_stop| {
            billing.close(&CloseSessionRequest {
                transaction_id: 502,
                meter_start: 0,
                meter_stop,
                stopped_at: Some(at(10, 30)),
            })
        };
        let first = close(10_000).expect("first close should succeed");
        let second = close(12_000).expect("second close should succeed");

        assert_eq!(first.invoice_id, second.invoice_id);
        let invoices = billing
            .list_invoices(&InvoiceQuery::default())
            .expect("list should succeed");
        assert_eq!(invoices.len(), 1);
        assert_eq!(invoices[0].energy_kwh, dec("12"));
        assert_eq!(invoices[0].stopped_at, at(10, 30));
    }

    #[test]
    fn first_stop_wins_over_close_request() {
        let store = in_memory_store();
        let billing = BillingService::new(store.clone(), FixedClock::shared(at(11, 0)));
        billing
            .create_tariff(&reference_tariff(TariffScope::Global, "2.00"))
            .expect("tariff should be created");
        billing
            .start(&start_request(503))
            .expect("billing should start");

        let ingestor = EventIngestor::new(store, FixedClock::shared(at(10, 20)), "ocpp");
        ingestor
            .ingest(
                &IngestRequest::from_json(json!({
                    "type": "StopTransaction",
                    "transactionId": 503,
                    "chargeBoxId": "CB-01",
                    "reason": "Local",
                    "timestamp": at(10, 20).to_rfc3339()
                }))
                .expect("stop event should be valid"),
            )
            .expect("stop should be accepted");

        let closed = billing
            .close(&CloseSessionRequest {
                transaction_id: 503,
                meter_start: 0,
                meter_stop: 1000,
                stopped_at: Some(at(10, 50)),
            })
            .expect("close should succeed");
        let invoice = billing
            .get_invoice(&closed.invoice_id)
            .expect("invoice should load");

        assert_eq!(invoice.stopped_at, at(10, 20));
        assert_eq!(closed.duration_seconds, 20 * 60);
    }

    #[test]
    fn refresh_estimates_without_writing() {
        let billing = BillingService::new(in_memory_store(), FixedClock::shared(at(10, 30)));
        billing
            .create_tariff(&reference_tariff(TariffScope::Global, "2.00"))
            .expect("tariff should be created");
        billing
            .start(&start_request(504))
            .expect("billing should start");

        let estimate = billing.refresh(504, 5000).expect("refresh should succeed");

        assert_eq!(estimate.energy_kwh, dec("5"));
        assert_eq!(estimate.duration_seconds, 30 * 60);
        assert_eq!(estimate.breakdown.total, dec("15.00"));

        let missing = billing.refresh(999, 1).expect_err("unknown session must fail");
        assert!(matches!(missing, ServiceError::NotFound { .. }));
    }

    #[test]
    fn start_retry_keeps_snapshot_after_tariff_window_closes() {
        let store = in_memory_store();
        let mut expiring = reference_tariff(TariffScope::ChargeBox, "2.00");
        expiring.valid_to = Some(at(10, 30));
        let mut retry = start_request(505);
        retry.started_at = None;

        let first_billing = BillingService::new(store.clone(), FixedClock::shared(at(10, 0)));
        first_billing
            .create_tariff(&expiring)
            .expect("tariff should be created");
        let first = first_billing.start(&retry).expect("billing should start");

        let later_billing = BillingService::new(store, FixedClock::shared(at(11, 0)));
        let again = later_billing
            .start(&retry)
            .expect("retry should reuse the frozen snapshot");

        assert!(first.snapshot_created);
        assert!(!again.snapshot_created);
        assert_eq!(again.session_id, first.session_id);
        assert_eq!(again.pricing_snapshot, first.pricing_snapshot);

        let mut fresh = start_request(506);
        fresh.started_at = None;
        let missing = later_billing
            .start(&fresh)
            .expect_err("a new session still needs a valid tariff");
        assert!(matches!(missing, ServiceError::TariffNotFound { .. }));
    }

    #[test]
    fn start_rejects_non_positive_identifiers() {
        let billing = BillingService::new(in_memory_store(), FixedClock::shared(at(9, 0)));
        billing
            .create_tariff(&reference_tariff(TariffScope::Global, "2.00"))
            .expect("tariff should be created");

        let zero_transaction = start_request(0);
        let mut negative_connector = start_request(507);
        negative_connector.connector_id = Some(-1);

        for request in [zero_transaction, negative_connector] {
            let error = billing.start(&request).expect_err("request must be rejected");
            assert!(matches!(error, ServiceError::Validation(_)));
        }
    }

    #[test]
    fn rejects_tariff_amounts_above_the_bound() {
        let billing = BillingService::new(in_memory_store(), FixedClock::shared(at(9, 0)));

        let mut huge_price = reference_tariff(TariffScope::Global, "2.00");
        huge_price.price_ac_kwh = dec("10000000000000000000000");
        let mut huge_fee = reference_tariff(TariffScope::Global, "2.00");
        huge_fee.connection_fee = Some(dec("1000000.01"));

        for request in [huge_price, huge_fee] {
            let error = billing.create_tariff(&request).expect_err("request must be rejected");
            assert!(matches!(error, ServiceError::Validation(_)));
        }
    }

    #[test]
    fn out_of_range_preview_is_rejected_and_store_stays_usable() {
        let billing = BillingService::new(in_memory_store(), FixedClock::shared(at(9, 0)));
        billing
            .create_tariff(&reference_tariff(TariffScope::Global, "2.00"))
            .expect("tariff should be created");

        let error = billing
            .preview(&PreviewRequest {
                charge_box_id: None,
                mode: ChargingMode::Ac,
                at: None,
                expected_kwh: Decimal::MAX,
                expected_minutes: Decimal::ZERO,
            })
            .expect_err("overflowing estimate must be rejected");

        assert!(matches!(error, ServiceError::Validation(_)));
        billing
            .resolve_tariff(None, ChargingMode::Ac, None)
            .expect("store should still answer");
    }

    #[test]
    fn maximum_meter_reading_closes_without_poisoning_the_store() {
        let store = in_memory_store();
        let mut priciest = reference_tariff(TariffScope::Global, "1000000");
        priciest.connection_fee = Some(dec("1000000"));
        let billing = BillingService::new(store.clone(), FixedClock::shared(at(11, 0)));
        billing
            .create_tariff(&priciest)
            .expect("tariff at the bound should be created");
        billing
            .start(&start_request(508))
            .expect("billing should start");

        let closed = billing
            .close(&CloseSessionRequest {
                transaction_id: 508,
                meter_start: 0,
                meter_stop: i64::MAX,
                stopped_at: Some(at(10, 30)),
            })
            .expect("close should succeed");

        assert_eq!(closed.energy_kwh, Decimal::from(i64::MAX) / Decimal::from(1000));
        let session = SessionTracker::new(store, FixedClock::shared(at(11, 0)))
            .get(508)
            .expect("unrelated read should still succeed");
        assert_eq!(session.session.stopped_at, Some(at(10, 30)));
    }
}
