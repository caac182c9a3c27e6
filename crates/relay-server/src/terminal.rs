use std::net::SocketAddr;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use relay_core::envelope::{Envelope, MessageKind};
use relay_core::errors::FabricError;
use relay_core::event::ClinicalEvent;
use relay_core::ids::{RequestId, TerminalId};

use crate::server::AppState;

/// Drive one terminal connection: handshake, registration, the ordered
/// writer, and the inbound dispatch loop. The socket closing (either side)
/// ends the connection; the registry learns about it exactly once.
pub async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    terminal_id: TerminalId,
    addr: SocketAddr,
) {
    // The identity is the handshake: a malformed id never registers.
    let Some(key) = terminal_id.routing_key() else {
        warn!(terminal_id = %terminal_id, "rejected connection: malformed terminal id");
        reject(socket, &FabricError::UnknownTerminal(terminal_id)).await;
        return;
    };

    let (tx, rx) = mpsc::channel::<Envelope>(state.config.max_send_queue);
    if let Err(e) = state.registry.register(
        &terminal_id,
        &key.clinician,
        &key.department,
        Some(addr.to_string()),
        tx,
    ) {
        reject(socket, &e).await;
        return;
    }
    if let Err(e) = state.terminals.record_connected(
        &terminal_id,
        &key.clinician,
        &key.department,
        Some(&addr.to_string()),
    ) {
        warn!(terminal_id = %terminal_id, error = %e, "terminal connect write failed");
    }
    info!(terminal_id = %terminal_id, remote_addr = %addr, "terminal connected");

    let (sender, receiver) = socket.split();
    let writer = tokio::spawn(write_outbound(sender, rx));
    read_inbound(receiver, &state, &terminal_id).await;

    state.registry.disconnect(&terminal_id, "client_close");
    writer.abort();
}

/// Send one coded error envelope and close. Used before registration, so
/// there is no registry entry to clean up.
async fn reject(mut socket: WebSocket, err: &FabricError) {
    let envelope = Envelope::from_fabric_error(err);
    if let Ok(json) = serde_json::to_string(&envelope) {
        let _ = socket.send(WsMessage::Text(json.into())).await;
    }
    let _ = socket.close().await;
}

/// Forward envelopes from the terminal's ordered channel to the socket.
/// Channel closure (registry replacement) or a write error ends the task.
async fn write_outbound(
    mut sender: futures::stream::SplitSink<WebSocket, WsMessage>,
    mut rx: mpsc::Receiver<Envelope>,
) {
    while let Some(envelope) = rx.recv().await {
        let json = match serde_json::to_string(&envelope) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "dropping unserializable envelope");
                continue;
            }
        };
        if sender.send(WsMessage::Text(json.into())).await.is_err() {
            break;
        }
    }
}

/// Inbound dispatch loop. Heartbeats and acks are handled inline;
/// recommendation requests run in their own task so a slow upstream call
/// never blocks the heartbeat stream.
async fn read_inbound(
    mut receiver: futures::stream::SplitStream<WebSocket>,
    state: &AppState,
    terminal_id: &TerminalId,
) {
    while let Some(message) = receiver.next().await {
        let text = match message {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        let envelope: Envelope = match serde_json::from_str(&text) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(terminal_id = %terminal_id, error = %e, "unparseable message");
                send_to(state, terminal_id, Envelope::error(
                    "INVALID_MESSAGE",
                    "message does not parse as a protocol envelope",
                    Some(&e.to_string()),
                ));
                continue;
            }
        };

        match envelope.kind {
            MessageKind::Heartbeat => {
                if let Err(e) = state.registry.heartbeat(terminal_id) {
                    send_to(state, terminal_id, Envelope::from_fabric_error(&e));
                    continue;
                }
                if let Err(e) = state.terminals.record_heartbeat(terminal_id) {
                    warn!(terminal_id = %terminal_id, error = %e, "heartbeat write failed");
                }
                send_to(state, terminal_id, Envelope::heartbeat());
            }
            MessageKind::AiRecommendRequest => {
                let state = state.clone();
                let terminal_id = terminal_id.clone();
                tokio::spawn(async move {
                    handle_recommend_request(&state, &terminal_id, envelope.data).await;
                });
            }
            MessageKind::Ack => {
                debug!(terminal_id = %terminal_id, message_id = %envelope.id, "ack received");
            }
            kind => {
                debug!(terminal_id = %terminal_id, %kind, "unexpected inbound kind");
                send_to(state, terminal_id, Envelope::error(
                    "INVALID_MESSAGE",
                    &format!("unexpected inbound message kind: {kind}"),
                    None,
                ));
            }
        }
    }
}

/// One terminal-originated recommendation request, end to end: the trace
/// opens here and closes here, after the response (or error) envelope has
/// been handed to the writer.
async fn handle_recommend_request(
    state: &AppState,
    terminal_id: &TerminalId,
    data: serde_json::Value,
) {
    let (request_id, event) = match parse_recommend_request(&data) {
        Ok(parsed) => parsed,
        Err(detail) => {
            debug!(terminal_id = %terminal_id, detail, "bad recommendation request");
            send_to(state, terminal_id, Envelope::error(
                "INVALID_MESSAGE",
                "recommendation request is missing required fields",
                Some(&detail),
            ));
            return;
        }
    };
    let trace = state.traces.open_trace("terminal_request");

    let envelope = match state
        .orchestrator
        .recommend(&trace, None, terminal_id, &request_id, &event)
        .await
    {
        Ok(response) => match serde_json::to_value(&response) {
            Ok(data) => Envelope::new(MessageKind::AiRecommendation, data),
            Err(e) => Envelope::error("UPSTREAM_ERROR", "response serialization failed", Some(&e.to_string())),
        },
        Err(e) => Envelope::from_fabric_error(&e),
    };
    send_to(state, terminal_id, envelope);
    state.traces.close_trace(&trace);
}

/// Extract the request id and clinical event from a recommendation request
/// payload. The event fields sit directly in `data`; `requestId` is optional
/// and minted when absent.
fn parse_recommend_request(
    data: &serde_json::Value,
) -> Result<(RequestId, ClinicalEvent), String> {
    let event: ClinicalEvent =
        serde_json::from_value(data.clone()).map_err(|e| e.to_string())?;
    let request_id = data
        .get("requestId")
        .and_then(|v| v.as_str())
        .map(RequestId::from_raw)
        .unwrap_or_default();
    Ok((request_id, event))
}

/// Hand an envelope to the terminal's ordered channel without blocking the
/// read loop. A full channel drops the envelope; protocol replies are not
/// queued behind routed deliveries.
fn send_to(state: &AppState, terminal_id: &TerminalId, envelope: Envelope) {
    let Some(tx) = state.registry.sender(terminal_id) else {
        return;
    };
    if tx.try_send(envelope).is_err() {
        warn!(terminal_id = %terminal_id, "outbound channel full; reply dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recommend_request_parses_event_and_request_id() {
        let data = serde_json::json!({
            "requestId": "req_42",
            "systemId": "HIS01",
            "sceneType": "EXAM001",
            "patNo": "P001",
            "admId": "ADM42",
            "deptCode": "CARD",
            "userCode": "D1001",
            "itemData": {"patientAge": "54", "patientSex": "F"}
        });
        let (request_id, event) = parse_recommend_request(&data).unwrap();
        assert_eq!(request_id.as_str(), "req_42");
        assert_eq!(event.pat_no, "P001");
    }

    #[test]
    fn recommend_request_mints_request_id_when_absent() {
        let data = serde_json::json!({
            "systemId": "HIS01",
            "sceneType": "EXAM001",
            "patNo": "P001",
            "admId": "ADM42",
            "deptCode": "CARD",
            "userCode": "D1001",
            "itemData": {}
        });
        let (request_id, _) = parse_recommend_request(&data).unwrap();
        assert!(request_id.as_str().starts_with("req_"));
    }

    #[test]
    fn recommend_request_without_patient_is_rejected() {
        let data = serde_json::json!({ "requestId": "req_42" });
        assert!(parse_recommend_request(&data).is_err());
    }
}
