use actix_web::error::{InternalError, JsonPayloadError, PathError, QueryPayloadError};
use actix_web::http::StatusCode;
use actix_web::{HttpRequest, HttpResponse, Responder, get, post, web};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::adapters::db::format_timestamp;
use crate::app::services::billing::{
    BillingEstimate, CloseSessionRequest, CloseSessionResult, CreateTariffRequest, InvoiceQuery,
    PreviewRequest, ResolvedTariff, StartBillingRequest, StartBillingResult, TariffPreview,
};
use crate::app::services::commands::{
    Acknowledgement, CommandQuery, CreateCommandResult, RemoteStartRequest, RemoteStopRequest,
};
use crate::app::services::ingest::{EventQuery, IngestRequest};
use crate::app::services::sessions::{SessionQuery, SessionView};
use crate::app::services::{
    BillingService, CommandOrchestrator, EventIngestor, ServiceError, SessionTracker,
};
use crate::domain::command_state::CommandStatus;
use crate::domain::event_payload::parse_timestamp;
use crate::domain::models::{
    ChargingMode, CommandRecord, CommandStatusChange, CostBreakdown, EventRecord, InvoiceRecord,
    PricingSnapshot, SessionStatus, SortOrder, TariffMode, TariffRecord, TariffScope,
};

#[derive(Clone)]
pub struct ApiState {
    pub events: EventIngestor,
    pub commands: CommandOrchestrator,
    pub sessions: SessionTracker,
    pub billing: BillingService,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngestResponse {
    pub accepted: bool,
    pub duplicate: bool,
    pub event_id: String,
}

/// Stored event as exposed over HTTP. The dedup key stays internal.
#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventResponse {
    pub id: String,
    pub source: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub charge_box_id: Option<String>,
    pub connector_id: Option<i64>,
    pub transaction_id: Option<i64>,
    pub id_tag: Option<String>,
    pub occurred_at: String,
    pub received_at: String,
    pub payload: Value,
}

impl From<EventRecord> for EventResponse {
    fn from(event: EventRecord) -> Self {
        Self {
            id: event.id,
            source: event.source,
            event_type: event.event_type,
            charge_box_id: event.charge_box_id,
            connector_id: event.connector_ref,
            transaction_id: event.transaction_ref,
            id_tag: event.id_tag,
            occurred_at: format_timestamp(event.occurred_at),
            received_at: format_timestamp(event.created_at),
            payload: event.payload,
        }
    }
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreateCommandResponse {
    pub command_id: String,
    pub status: CommandStatus,
    pub idempotent_duplicate: bool,
}

impl From<CreateCommandResult> for CreateCommandResponse {
    fn from(result: CreateCommandResult) -> Self {
        Self {
            command_id: result.command_id,
            status: result.status,
            idempotent_duplicate: result.idempotent_duplicate,
        }
    }
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusChangeResponse {
    pub from_status: Option<CommandStatus>,
    pub to_status: CommandStatus,
    pub changed_at: String,
}

impl From<CommandStatusChange> for StatusChangeResponse {
    fn from(change: CommandStatusChange) -> Self {
        Self {
            from_status: change.from_status,
            to_status: change.to_status,
            changed_at: format_timestamp(change.changed_at),
        }
    }
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub command_type: String,
    pub status: CommandStatus,
    pub charge_box_id: Option<String>,
    pub id_tag: Option<String>,
    pub connector_id: Option<i64>,
    pub transaction_id: Option<i64>,
    pub session_id: Option<String>,
    pub payload: Value,
    pub response: Option<Value>,
    pub requested_by: String,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<StatusChangeResponse>>,
}

impl CommandResponse {
    fn with_history(command: CommandRecord, history: Vec<CommandStatusChange>) -> Self {
        let mut response = Self::from(command);
        response.history = Some(history.into_iter().map(StatusChangeResponse::from).collect());
        response
    }
}

impl From<CommandRecord> for CommandResponse {
    fn from(command: CommandRecord) -> Self {
        Self {
            id: command.id,
            command_type: command.command_type.as_str().to_string(),
            status: command.status,
            charge_box_id: command.charge_box_id,
            id_tag: command.id_tag,
            connector_id: command.connector_id,
            transaction_id: command.transaction_id,
            session_id: command.session_id,
            payload: command.payload,
            response: command.response,
            requested_by: command.requested_by,
            created_at: format_timestamp(command.created_at),
            updated_at: format_timestamp(command.updated_at),
            history: None,
        }
    }
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub id: String,
    pub transaction_id: i64,
    pub charge_box_id: Option<String>,
    pub id_tag: Option<String>,
    pub connector_id: Option<i64>,
    pub mode: ChargingMode,
    pub status: SessionStatus,
    pub started_at: String,
    pub stopped_at: Option<String>,
    pub stop_reason: Option<String>,
    pub duration_seconds: i64,
    pub meter_start: Option<i64>,
    pub energy_kwh: Option<Decimal>,
    pub revenue: Option<Decimal>,
    pub pricing_snapshot: Option<PricingSnapshot>,
}

impl From<SessionView> for SessionResponse {
    fn from(view: SessionView) -> Self {
        let session = view.session;
        Self {
            id: session.id,
            transaction_id: session.transaction_id,
            charge_box_id: session.charge_box_id,
            id_tag: session.id_tag,
            connector_id: session.connector_id,
            mode: session.mode,
            status: view.status,
            started_at: format_timestamp(session.started_at),
            stopped_at: session.stopped_at.map(format_timestamp),
            stop_reason: session.stop_reason,
            duration_seconds: view.duration_seconds,
            meter_start: session.meter_start,
            energy_kwh: session.energy_kwh,
            revenue: session.revenue,
            pricing_snapshot: session.pricing_snapshot,
        }
    }
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TariffResponse {
    pub id: String,
    pub revision: i64,
    pub scope: TariffScope,
    pub charge_box_id: Option<String>,
    pub applies_mode: TariffMode,
    pub valid_from: String,
    pub valid_to: Option<String>,
    pub price_ac_kwh: Decimal,
    pub price_dc_kwh: Decimal,
    pub connection_fee: Decimal,
    pub idle_fee_per_minute: Decimal,
    pub idle_grace_minutes: Decimal,
    pub created_at: String,
}

impl From<TariffRecord> for TariffResponse {
    fn from(tariff: TariffRecord) -> Self {
        Self {
            id: tariff.id,
            revision: tariff.revision,
            scope: tariff.scope,
            charge_box_id: tariff.charge_box_id,
            applies_mode: tariff.applies_mode,
            valid_from: format_timestamp(tariff.valid_from),
            valid_to: tariff.valid_to.map(format_timestamp),
            price_ac_kwh: tariff.price_ac_kwh,
            price_dc_kwh: tariff.price_dc_kwh,
            connection_fee: tariff.connection_fee,
            idle_fee_per_minute: tariff.idle_fee_per_minute,
            idle_grace_minutes: tariff.idle_grace_minutes,
            created_at: format_timestamp(tariff.created_at),
        }
    }
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedTariffResponse {
    pub at: String,
    pub charge_box_id: Option<String>,
    pub mode: ChargingMode,
    pub tariff: TariffResponse,
}

impl From<ResolvedTariff> for ResolvedTariffResponse {
    fn from(resolved: ResolvedTariff) -> Self {
        Self {
            at: format_timestamp(resolved.at),
            charge_box_id: resolved.charge_box_id,
            mode: resolved.mode,
            tariff: TariffResponse::from(resolved.tariff),
        }
    }
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PreviewResponse {
    pub at: String,
    pub charge_box_id: Option<String>,
    pub pricing: PricingSnapshot,
    pub expected_kwh: Decimal,
    pub expected_minutes: Decimal,
    pub breakdown: CostBreakdown,
}

impl From<TariffPreview> for PreviewResponse {
    fn from(preview: TariffPreview) -> Self {
        Self {
            at: format_timestamp(preview.at),
            charge_box_id: preview.charge_box_id,
            pricing: preview.pricing,
            expected_kwh: preview.expected_kwh,
            expected_minutes: preview.expected_minutes,
            breakdown: preview.breakdown,
        }
    }
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StartBillingResponse {
    pub transaction_id: i64,
    pub session_id: String,
    pub pricing_snapshot: PricingSnapshot,
    pub snapshot_created: bool,
}

impl From<StartBillingResult> for StartBillingResponse {
    fn from(result: StartBillingResult) -> Self {
        Self {
            transaction_id: result.transaction_id,
            session_id: result.session_id,
            pricing_snapshot: result.pricing_snapshot,
            snapshot_created: result.snapshot_created,
        }
    }
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EstimateResponse {
    pub transaction_id: i64,
    pub energy_kwh: Decimal,
    pub duration_seconds: i64,
    pub pricing: PricingSnapshot,
    pub breakdown: CostBreakdown,
}

impl From<BillingEstimate> for EstimateResponse {
    fn from(estimate: BillingEstimate) -> Self {
        Self {
            transaction_id: estimate.transaction_id,
            energy_kwh: estimate.energy_kwh,
            duration_seconds: estimate.duration_seconds,
            pricing: estimate.pricing,
            breakdown: estimate.breakdown,
        }
    }
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CloseSessionResponse {
    pub transaction_id: i64,
    pub invoice_id: String,
    pub energy_kwh: Decimal,
    pub duration_seconds: i64,
    pub idle_minutes: Decimal,
    pub total: Decimal,
    pub breakdown: CostBreakdown,
}

impl From<CloseSessionResult> for CloseSessionResponse {
    fn from(result: CloseSessionResult) -> Self {
        Self {
            transaction_id: result.transaction_id,
            invoice_id: result.invoice_id,
            energy_kwh: result.energy_kwh,
            duration_seconds: result.duration_seconds,
            idle_minutes: result.idle_minutes,
            total: result.total,
            breakdown: result.breakdown,
        }
    }
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceResponse {
    pub id: String,
    pub session_id: String,
    pub transaction_id: i64,
    pub charge_box_id: Option<String>,
    pub id_tag: Option<String>,
    pub started_at: String,
    pub stopped_at: String,
    pub energy_kwh: Decimal,
    pub idle_minutes: Decimal,
    pub total: Decimal,
    pub breakdown: CostBreakdown,
    pub created_at: String,
    pub updated_at: String,
}

impl From<InvoiceRecord> for InvoiceResponse {
    fn from(invoice: InvoiceRecord) -> Self {
        Self {
            id: invoice.id,
            session_id: invoice.session_id,
            transaction_id: invoice.transaction_id,
            charge_box_id: invoice.charge_box_id,
            id_tag: invoice.id_tag,
            started_at: format_timestamp(invoice.started_at),
            stopped_at: format_timestamp(invoice.stopped_at),
            energy_kwh: invoice.energy_kwh,
            idle_minutes: invoice.idle_minutes,
            total: invoice.total,
            breakdown: invoice.breakdown,
            created_at: format_timestamp(invoice.created_at),
            updated_at: format_timestamp(invoice.updated_at),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteStartBody {
    pub charge_box_id: String,
    pub id_tag: String,
    pub connector_id: Option<i64>,
    pub reservation_id: Option<i64>,
    pub requested_by: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteStopBody {
    pub transaction_id: i64,
    pub requested_by: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AckBody {
    pub result: String,
    pub response: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartBillingBody {
    pub transaction_id: i64,
    pub charge_box_id: String,
    pub connector_id: Option<i64>,
    pub id_tag: Option<String>,
    pub mode: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshBillingBody {
    pub transaction_id: i64,
    pub meter_latest: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseBillingBody {
    pub transaction_id: i64,
    pub meter_start: i64,
    pub meter_stop: i64,
    pub stopped_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTariffBody {
    pub scope: String,
    pub charge_box_id: Option<String>,
    pub applies_mode: Option<String>,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_to: Option<DateTime<Utc>>,
    pub price_ac_kwh: Decimal,
    pub price_dc_kwh: Decimal,
    pub connection_fee: Option<Decimal>,
    pub idle_fee_per_minute: Option<Decimal>,
    pub idle_grace_minutes: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewBody {
    pub charge_box_id: Option<String>,
    pub mode: Option<String>,
    pub at: Option<DateTime<Utc>>,
    pub expected_kwh: Decimal,
    pub expected_minutes: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventListQuery {
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    pub charge_box_id: Option<String>,
    pub connector_id: Option<i64>,
    pub transaction_id: Option<i64>,
    pub id_tag: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub sort: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandListQuery {
    pub transaction_id: Option<i64>,
    pub charge_box_id: Option<String>,
    pub status: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionListQuery {
    pub charge_box_id: Option<String>,
    pub id_tag: Option<String>,
    pub transaction_id: Option<i64>,
    pub status: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub sort: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceListQuery {
    pub from: Option<String>,
    pub to: Option<String>,
    pub charge_box_id: Option<String>,
    pub id_tag: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveTariffQuery {
    pub charge_box_id: Option<String>,
    pub mode: Option<String>,
    pub at: Option<String>,
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(json_error_handler))
        .app_data(web::QueryConfig::default().error_handler(query_error_handler))
        .app_data(web::PathConfig::default().error_handler(path_error_handler))
        .service(health)
        .service(ingest_event_endpoint)
        .service(list_events_endpoint)
        .service(get_event_endpoint)
        .service(remote_start_endpoint)
        .service(remote_stop_endpoint)
        .service(acknowledge_command_endpoint)
        .service(list_commands_endpoint)
        .service(get_command_endpoint)
        .service(list_sessions_endpoint)
        .service(get_session_endpoint)
        .service(start_billing_endpoint)
        .service(refresh_billing_endpoint)
        .service(close_billing_endpoint)
        .service(list_invoices_endpoint)
        .service(get_invoice_endpoint)
        .service(create_tariff_endpoint)
        .service(resolve_tariff_endpoint)
        .service(preview_tariff_endpoint);
}

#[get("/health")]
async fn health() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}

#[post("/v1/events")]
async fn ingest_event_endpoint(state: web::Data<ApiState>, body: web::Json<Value>) -> HttpResponse {
    let request = match IngestRequest::from_json(body.into_inner()) {
        Ok(request) => request,
        Err(error) => return service_error_response(error),
    };

    let events = state.events.clone();
    match run_blocking(move || events.ingest(&request)).await {
        Ok(outcome) => HttpResponse::Accepted().json(IngestResponse {
            accepted: true,
            duplicate: outcome.duplicate,
            event_id: outcome.event_id,
        }),
        Err(error) => service_error_response(error),
    }
}

#[get("/v1/events")]
async fn list_events_endpoint(
    state: web::Data<ApiState>,
    query: web::Query<EventListQuery>,
) -> HttpResponse {
    let query = query.into_inner();
    let (from, to) = match time_window(query.from.as_deref(), query.to.as_deref()) {
        Ok(window) => window,
        Err(error) => return service_error_response(error),
    };
    let event_query = EventQuery {
        event_type: query.event_type,
        charge_box_id: query.charge_box_id,
        connector_ref: query.connector_id,
        transaction_ref: query.transaction_id,
        id_tag: query.id_tag,
        from,
        to,
        limit: query.limit,
        offset: query.offset,
        sort: SortOrder::parse(query.sort.as_deref()),
    };

    let events = state.events.clone();
    match run_blocking(move || events.list(&event_query)).await {
        Ok(records) => HttpResponse::Ok().json(
            records
                .into_iter()
                .map(EventResponse::from)
                .collect::<Vec<_>>(),
        ),
        Err(error) => service_error_response(error),
    }
}

#[get("/v1/events/{id}")]
async fn get_event_endpoint(state: web::Data<ApiState>, path: web::Path<String>) -> HttpResponse {
    let event_id = path.into_inner();
    let events = state.events.clone();
    match run_blocking(move || events.get(&event_id)).await {
        Ok(event) => HttpResponse::Ok().json(EventResponse::from(event)),
        Err(error) => service_error_response(error),
    }
}

#[post("/v1/commands/remote-start")]
async fn remote_start_endpoint(
    state: web::Data<ApiState>,
    body: web::Json<RemoteStartBody>,
) -> HttpResponse {
    let body = body.into_inner();
    let request = RemoteStartRequest {
        charge_box_id: body.charge_box_id,
        id_tag: body.id_tag,
        connector_id: body.connector_id,
        reservation_id: body.reservation_id,
        requested_by: body.requested_by,
    };

    let commands = state.commands.clone();
    match run_blocking(move || commands.issue_remote_start(&request)).await {
        Ok(result) => command_created_response(result),
        Err(error) => service_error_response(error),
    }
}

#[post("/v1/commands/remote-stop")]
async fn remote_stop_endpoint(
    state: web::Data<ApiState>,
    body: web::Json<RemoteStopBody>,
) -> HttpResponse {
    let body = body.into_inner();
    let request = RemoteStopRequest {
        transaction_id: body.transaction_id,
        requested_by: body.requested_by,
    };

    let commands = state.commands.clone();
    match run_blocking(move || commands.issue_remote_stop(&request)).await {
        Ok(result) => command_created_response(result),
        Err(error) => service_error_response(error),
    }
}

#[post("/v1/commands/{id}/ack")]
async fn acknowledge_command_endpoint(
    state: web::Data<ApiState>,
    path: web::Path<String>,
    body: web::Json<AckBody>,
) -> HttpResponse {
    let command_id = path.into_inner();
    let body = body.into_inner();
    let Some(acknowledgement) = Acknowledgement::parse(&body.result) else {
        return service_error_response(ServiceError::validation(
            "result must be Accepted or Rejected",
        ));
    };

    let commands = state.commands.clone();
    match run_blocking(move || {
        commands.acknowledge(&command_id, acknowledgement, body.response.as_ref())
    })
    .await
    {
        Ok(command) => HttpResponse::Ok().json(CommandResponse::from(command)),
        Err(error) => service_error_response(error),
    }
}

#[get("/v1/commands")]
async fn list_commands_endpoint(
    state: web::Data<ApiState>,
    query: web::Query<CommandListQuery>,
) -> HttpResponse {
    let query = query.into_inner();
    let status = match query.status.as_deref().map(parse_command_status).transpose() {
        Ok(status) => status,
        Err(error) => return service_error_response(error),
    };
    let command_query = CommandQuery {
        transaction_id: query.transaction_id,
        charge_box_id: query.charge_box_id,
        status,
        limit: query.limit,
    };

    let commands = state.commands.clone();
    match run_blocking(move || commands.list(&command_query)).await {
        Ok(records) => HttpResponse::Ok().json(
            records
                .into_iter()
                .map(CommandResponse::from)
                .collect::<Vec<_>>(),
        ),
        Err(error) => service_error_response(error),
    }
}

#[get("/v1/commands/{id}")]
async fn get_command_endpoint(state: web::Data<ApiState>, path: web::Path<String>) -> HttpResponse {
    let command_id = path.into_inner();
    let commands = state.commands.clone();
    let result = run_blocking(move || {
        let command = commands.get(&command_id)?;
        let history = commands.history(&command_id)?;
        Ok((command, history))
    })
    .await;

    match result {
        Ok((command, history)) => {
            HttpResponse::Ok().json(CommandResponse::with_history(command, history))
        }
        Err(error) => service_error_response(error),
    }
}

#[get("/v1/sessions")]
async fn list_sessions_endpoint(
    state: web::Data<ApiState>,
    query: web::Query<SessionListQuery>,
) -> HttpResponse {
    let query = query.into_inner();
    let (from, to) = match time_window(query.from.as_deref(), query.to.as_deref()) {
        Ok(window) => window,
        Err(error) => return service_error_response(error),
    };
    let status = match query.status.as_deref().map(parse_session_status).transpose() {
        Ok(status) => status,
        Err(error) => return service_error_response(error),
    };
    let session_query = SessionQuery {
        charge_box_id: query.charge_box_id,
        id_tag: query.id_tag,
        transaction_id: query.transaction_id,
        status,
        from,
        to,
        limit: query.limit,
        offset: query.offset,
        sort: SortOrder::parse(query.sort.as_deref()),
    };

    let sessions = state.sessions.clone();
    match run_blocking(move || sessions.list(&session_query)).await {
        Ok(views) => HttpResponse::Ok().json(
            views
                .into_iter()
                .map(SessionResponse::from)
                .collect::<Vec<_>>(),
        ),
        Err(error) => service_error_response(error),
    }
}

#[get("/v1/sessions/{transaction_id}")]
async fn get_session_endpoint(state: web::Data<ApiState>, path: web::Path<i64>) -> HttpResponse {
    let transaction_id = path.into_inner();
    let sessions = state.sessions.clone();
    match run_blocking(move || sessions.get(transaction_id)).await {
        Ok(view) => HttpResponse::Ok().json(SessionResponse::from(view)),
        Err(error) => service_error_response(error),
    }
}

#[post("/v1/billing/start")]
async fn start_billing_endpoint(
    state: web::Data<ApiState>,
    body: web::Json<StartBillingBody>,
) -> HttpResponse {
    let body = body.into_inner();
    let mode = match body.mode.as_deref().map(parse_charging_mode).transpose() {
        Ok(mode) => mode,
        Err(error) => return service_error_response(error),
    };
    let request = StartBillingRequest {
        transaction_id: body.transaction_id,
        charge_box_id: body.charge_box_id,
        connector_id: body.connector_id,
        id_tag: body.id_tag,
        mode,
        started_at: body.started_at,
    };

    let billing = state.billing.clone();
    match run_blocking(move || billing.start(&request)).await {
        Ok(result) => HttpResponse::Ok().json(StartBillingResponse::from(result)),
        Err(error) => service_error_response(error),
    }
}

#[post("/v1/billing/refresh")]
async fn refresh_billing_endpoint(
    state: web::Data<ApiState>,
    body: web::Json<RefreshBillingBody>,
) -> HttpResponse {
    let body = body.into_inner();
    let billing = state.billing.clone();
    match run_blocking(move || billing.refresh(body.transaction_id, body.meter_latest)).await {
        Ok(estimate) => HttpResponse::Ok().json(EstimateResponse::from(estimate)),
        Err(error) => service_error_response(error),
    }
}

#[post("/v1/billing/close")]
async fn close_billing_endpoint(
    state: web::Data<ApiState>,
    body: web::Json<CloseBillingBody>,
) -> HttpResponse {
    let body = body.into_inner();
    let request = CloseSessionRequest {
        transaction_id: body.transaction_id,
        meter_start: body.meter_start,
        meter_stop: body.meter_stop,
        stopped_at: body.stopped_at,
    };

    let billing = state.billing.clone();
    match run_blocking(move || billing.close(&request)).await {
        Ok(result) => HttpResponse::Ok().json(CloseSessionResponse::from(result)),
        Err(error) => service_error_response(error),
    }
}

#[get("/v1/billing/invoices")]
async fn list_invoices_endpoint(
    state: web::Data<ApiState>,
    query: web::Query<InvoiceListQuery>,
) -> HttpResponse {
    let query = query.into_inner();
    let (from, to) = match time_window(query.from.as_deref(), query.to.as_deref()) {
        Ok(window) => window,
        Err(error) => return service_error_response(error),
    };
    let invoice_query = InvoiceQuery {
        from,
        to,
        charge_box_id: query.charge_box_id,
        id_tag: query.id_tag,
        limit: query.limit,
    };

    let billing = state.billing.clone();
    match run_blocking(move || billing.list_invoices(&invoice_query)).await {
        Ok(invoices) => HttpResponse::Ok().json(
            invoices
                .into_iter()
                .map(InvoiceResponse::from)
                .collect::<Vec<_>>(),
        ),
        Err(error) => service_error_response(error),
    }
}

#[get("/v1/billing/invoices/{id}")]
async fn get_invoice_endpoint(state: web::Data<ApiState>, path: web::Path<String>) -> HttpResponse {
    let invoice_id = path.into_inner();
    let billing = state.billing.clone();
    match run_blocking(move || billing.get_invoice(&invoice_id)).await {
        Ok(invoice) => HttpResponse::Ok().json(InvoiceResponse::from(invoice)),
        Err(error) => service_error_response(error),
    }
}

#[post("/v1/tariffs")]
async fn create_tariff_endpoint(
    state: web::Data<ApiState>,
    body: web::Json<CreateTariffBody>,
) -> HttpResponse {
    let body = body.into_inner();
    let Some(scope) = TariffScope::parse(body.scope.trim()) else {
        return service_error_response(ServiceError::validation(
            "scope must be global or charge_box",
        ));
    };
    let applies_mode = match body.applies_mode.as_deref().map(parse_tariff_mode).transpose() {
        Ok(mode) => mode,
        Err(error) => return service_error_response(error),
    };
    let request = CreateTariffRequest {
        scope,
        charge_box_id: body.charge_box_id,
        applies_mode,
        valid_from: body.valid_from,
        valid_to: body.valid_to,
        price_ac_kwh: body.price_ac_kwh,
        price_dc_kwh: body.price_dc_kwh,
        connection_fee: body.connection_fee,
        idle_fee_per_minute: body.idle_fee_per_minute,
        idle_grace_minutes: body.idle_grace_minutes,
    };

    let billing = state.billing.clone();
    match run_blocking(move || billing.create_tariff(&request)).await {
        Ok(tariff) => HttpResponse::Created().json(TariffResponse::from(tariff)),
        Err(error) => service_error_response(error),
    }
}

#[get("/v1/tariffs/resolve")]
async fn resolve_tariff_endpoint(
    state: web::Data<ApiState>,
    query: web::Query<ResolveTariffQuery>,
) -> HttpResponse {
    let query = query.into_inner();
    let mode = match query.mode.as_deref().map(parse_charging_mode).transpose() {
        Ok(mode) => mode.unwrap_or(ChargingMode::Ac),
        Err(error) => return service_error_response(error),
    };
    let at = match time_param("at", query.at.as_deref()) {
        Ok(at) => at,
        Err(error) => return service_error_response(error),
    };

    let billing = state.billing.clone();
    let charge_box_id = query.charge_box_id;
    match run_blocking(move || billing.resolve_tariff(charge_box_id.as_deref(), mode, at)).await {
        Ok(resolved) => HttpResponse::Ok().json(ResolvedTariffResponse::from(resolved)),
        Err(error) => service_error_response(error),
    }
}

#[post("/v1/tariffs/preview")]
async fn preview_tariff_endpoint(
    state: web::Data<ApiState>,
    body: web::Json<PreviewBody>,
) -> HttpResponse {
    let body = body.into_inner();
    let mode = match body.mode.as_deref().map(parse_charging_mode).transpose() {
        Ok(mode) => mode.unwrap_or(ChargingMode::Ac),
        Err(error) => return service_error_response(error),
    };
    let request = PreviewRequest {
        charge_box_id: body.charge_box_id,
        mode,
        at: body.at,
        expected_kwh: body.expected_kwh,
        expected_minutes: body.expected_minutes.unwrap_or(Decimal::ZERO),
    };

    let billing = state.billing.clone();
    match run_blocking(move || billing.preview(&request)).await {
        Ok(preview) => HttpResponse::Ok().json(PreviewResponse::from(preview)),
        Err(error) => service_error_response(error),
    }
}

/// Store calls hold a connection lock and may wait on SQLite's busy timeout,
/// so they run on the blocking pool instead of an async worker.
async fn run_blocking<T, F>(operation: F) -> Result<T, ServiceError>
where
    F: FnOnce() -> Result<T, ServiceError> + Send + 'static,
    T: Send + 'static,
{
    web::block(operation)
        .await
        .map_err(|error| ServiceError::Internal(format!("blocking task failed: {error}")))?
}

fn command_created_response(result: CreateCommandResult) -> HttpResponse {
    let status = if result.idempotent_duplicate {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    HttpResponse::build(status).json(CreateCommandResponse::from(result))
}

fn time_param(name: &str, value: Option<&str>) -> Result<Option<DateTime<Utc>>, ServiceError> {
    match value.map(str::trim).filter(|value| !value.is_empty()) {
        None => Ok(None),
        Some(text) => parse_timestamp(text).map(Some).ok_or_else(|| {
            ServiceError::validation(format!("{name} must be an RFC 3339 date-time"))
        }),
    }
}

type TimeWindow = (Option<DateTime<Utc>>, Option<DateTime<Utc>>);

fn time_window(from: Option<&str>, to: Option<&str>) -> Result<TimeWindow, ServiceError> {
    let from = time_param("from", from)?;
    let to = time_param("to", to)?;
    if let (Some(from), Some(to)) = (from, to)
        && to < from
    {
        return Err(ServiceError::validation("to must not be before from"));
    }
    Ok((from, to))
}

fn parse_charging_mode(value: &str) -> Result<ChargingMode, ServiceError> {
    ChargingMode::parse(value).ok_or_else(|| ServiceError::validation("mode must be AC or DC"))
}

fn parse_tariff_mode(value: &str) -> Result<TariffMode, ServiceError> {
    TariffMode::parse(value)
        .ok_or_else(|| ServiceError::validation("appliesMode must be AC, DC or ANY"))
}

fn parse_session_status(value: &str) -> Result<SessionStatus, ServiceError> {
    SessionStatus::parse(value.trim())
        .ok_or_else(|| ServiceError::validation("status must be active or completed"))
}

fn parse_command_status(value: &str) -> Result<CommandStatus, ServiceError> {
    CommandStatus::parse(value.trim())
        .ok_or_else(|| ServiceError::validation(format!("unknown command status {value}")))
}

fn service_error_response(error: ServiceError) -> HttpResponse {
    let status = match &error {
        ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
        ServiceError::NotFound { .. } | ServiceError::TariffNotFound { .. } => {
            StatusCode::NOT_FOUND
        }
        ServiceError::Conflict(_) => StatusCode::CONFLICT,
        ServiceError::TransientStorage(_) => StatusCode::SERVICE_UNAVAILABLE,
        ServiceError::Storage(_) | ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    if status.is_server_error() {
        tracing::error!(error = %error, code = error.code(), "request failed");
    }

    let mut response = HttpResponse::build(status);
    if error.is_retryable() {
        response.insert_header(("Retry-After", "1"));
    }
    response.json(error_body(error.code(), &error.to_string()))
}

fn error_body(code: &str, message: &str) -> Value {
    serde_json::json!({ "error": code, "message": message })
}

fn bad_request(message: String) -> HttpResponse {
    HttpResponse::BadRequest().json(error_body("validation_error", &message))
}

fn json_error_handler(error: JsonPayloadError, _request: &HttpRequest) -> actix_web::Error {
    let response = bad_request(format!("invalid JSON body: {error}"));
    InternalError::from_response(error, response).into()
}

fn query_error_handler(error: QueryPayloadError, _request: &HttpRequest) -> actix_web::Error {
    let response = bad_request(format!("invalid query string: {error}"));
    InternalError::from_response(error, response).into()
}

fn path_error_handler(error: PathError, _request: &HttpRequest) -> actix_web::Error {
    let response = bad_request(format!("invalid path parameter: {error}"));
    InternalError::from_response(error, response).into()
}
