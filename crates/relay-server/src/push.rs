use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use tracing::{info, instrument, warn};

use relay_core::envelope::{Envelope, MessageKind};
use relay_core::event::ClinicalEvent;
use relay_core::ids::RoutingKey;
use relay_fabric::DeliveryOutcome;
use relay_store::traces::SpanStatus;

use crate::server::AppState;

// Rejection codes on the HIS wire contract. 1001-1004 match the upstream
// integration document; 1005/1006 cover the gate and the queue.
const CODE_BAD_SERVICE_ID: u16 = 1001;
const CODE_BAD_SCENE_TYPE: u16 = 1002;
const CODE_MISSING_FIELD: u16 = 1003;
const CODE_UNAUTHORIZED: u16 = 1005;
const CODE_UNDELIVERABLE: u16 = 1006;

/// Accept one pushed patient-encounter event and route it to the addressed
/// terminal. Contract violations are rejected before a trace opens; from the
/// gate onward every step runs under the `his_push` trace.
#[instrument(skip_all)]
pub async fn his_push_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    let service_id = header_str(&headers, "service_id");
    if service_id != Some(state.config.his_service_id.as_str()) {
        warn!(?service_id, "push rejected: service_id mismatch");
        return rejection(
            CODE_BAD_SERVICE_ID,
            "service_id mismatch",
            &format!("expected {}", state.config.his_service_id),
        );
    }

    let event: ClinicalEvent = match serde_json::from_value(body.clone()) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "push rejected: malformed body");
            return rejection(CODE_MISSING_FIELD, "missing or malformed field", &e.to_string());
        }
    };

    if event.scene_type != state.config.his_scene_type {
        warn!(scene_type = %event.scene_type, "push rejected: sceneType mismatch");
        return rejection(
            CODE_BAD_SCENE_TYPE,
            "sceneType mismatch",
            &format!("expected {}", state.config.his_scene_type),
        );
    }

    let Some(key) = event.routing_key() else {
        warn!(pat_no = %event.pat_no, "push rejected: no routing key");
        return rejection(
            CODE_MISSING_FIELD,
            "missing or malformed field",
            "deptCode and userCode are required for routing",
        );
    };

    route_push(&state, &key, &event, body).await
}

/// The traced part of the push flow: gateway span, authorization, delivery.
/// The delivery span (and with it the trace) is resolved by the router; only
/// the pre-route failure paths close the trace here.
async fn route_push(
    state: &AppState,
    key: &RoutingKey,
    event: &ClinicalEvent,
    body: serde_json::Value,
) -> (StatusCode, Json<serde_json::Value>) {
    let trace = state.traces.open_trace("his_push");
    let destination = key.terminal_id();

    let gateway = match state.traces.open_span(
        &trace,
        None,
        "gateway",
        None,
        false,
        Some(serde_json::json!({ "patNo": event.pat_no, "routingKey": key.to_string() })),
    ) {
        Ok(span) => span,
        Err(e) => {
            // Integrity refusal on a trace we just opened: log and bail.
            warn!(error = %e, "gateway span refused");
            state.traces.close_trace(&trace);
            return internal(&e.to_string());
        }
    };

    let auth = match state
        .traces
        .open_span(&trace, Some(&gateway), "authorize", None, false, None)
    {
        Ok(span) => span,
        Err(e) => {
            warn!(error = %e, "authorize span refused");
            state.traces.close_trace(&trace);
            return internal(&e.to_string());
        }
    };
    if let Err(e) = state
        .gate
        .authorize(&destination, &state.config.fabric.push_service_id)
    {
        state
            .traces
            .close_span(&auth, SpanStatus::Failed, None, Some(&e.to_string()));
        state
            .traces
            .close_span(&gateway, SpanStatus::Failed, None, Some(&e.to_string()));
        state.traces.close_trace(&trace);
        return (
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({
                "code": CODE_UNAUTHORIZED,
                "message": "destination not authorized",
                "error": e.to_string(),
                "errorCode": e.error_code(),
            })),
        );
    }
    state.traces.close_span(&auth, SpanStatus::Success, None, None);
    // The gateway span must be resolved before the router can close the
    // trace, or it would be swept as a timeout.
    state
        .traces
        .close_span(&gateway, SpanStatus::Success, None, None);

    let envelope = Envelope::new(MessageKind::PatientData, body);
    let message_id = envelope.id.clone();
    match state.router.route(key, envelope, &trace, Some(&gateway)) {
        Ok(DeliveryOutcome::Delivered(terminal)) => {
            info!(terminal_id = %terminal, trace_id = %trace, "push delivered");
            accepted(&trace, &message_id, serde_json::json!({ "outcome": "delivered" }))
        }
        Ok(DeliveryOutcome::Queued { position }) => {
            info!(routing_key = %key, position, trace_id = %trace, "push queued");
            accepted(
                &trace,
                &message_id,
                serde_json::json!({ "outcome": "queued", "queuePosition": position }),
            )
        }
        Err(e) => {
            // Router already resolved the delivery span and the trace.
            warn!(routing_key = %key, error = %e, "push undeliverable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "code": CODE_UNDELIVERABLE,
                    "message": "destination queue full",
                    "error": e.to_string(),
                    "errorCode": e.error_code(),
                })),
            )
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn rejection(code: u16, message: &str, detail: &str) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "code": code, "message": message, "error": detail })),
    )
}

fn internal(detail: &str) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "code": CODE_UNDELIVERABLE, "message": "internal error", "error": detail })),
    )
}

fn accepted(
    trace: &relay_core::ids::TraceId,
    message_id: &relay_core::ids::MessageId,
    data: serde_json::Value,
) -> (StatusCode, Json<serde_json::Value>) {
    let mut data = data;
    if let Some(map) = data.as_object_mut() {
        map.insert("messageId".to_string(), serde_json::json!(message_id));
        map.insert("traceId".to_string(), serde_json::json!(trace));
    }
    (
        StatusCode::OK,
        Json(serde_json::json!({ "code": 0, "message": "accepted", "data": data })),
    )
}
