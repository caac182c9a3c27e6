use std::sync::Arc;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use relay_ai::{RecommendClient, UpstreamRequest};
use relay_core::errors::FabricError;
use relay_core::event::{ClinicalEvent, RecommendResponse};
use relay_core::ids::{RequestId, SpanId, TerminalId, TraceId};
use relay_store::service_calls::ServiceCallRepo;
use relay_store::traces::SpanStatus;

use crate::auth::AuthorizationGate;
use crate::config::FabricConfig;
use crate::session::SessionManager;
use crate::trace::TraceRecorder;

/// Drives one recommendation call end to end: session resolution, the
/// authorization gate, the bounded upstream call, normalization and the
/// session record. Each step runs under its own span; no registry or router
/// lock is held across the upstream await.
pub struct AiOrchestrator {
    sessions: Arc<SessionManager>,
    gate: Arc<AuthorizationGate>,
    client: Arc<dyn RecommendClient>,
    traces: Arc<TraceRecorder>,
    service_calls: ServiceCallRepo,
    config: FabricConfig,
}

impl AiOrchestrator {
    pub fn new(
        sessions: Arc<SessionManager>,
        gate: Arc<AuthorizationGate>,
        client: Arc<dyn RecommendClient>,
        traces: Arc<TraceRecorder>,
        service_calls: ServiceCallRepo,
        config: FabricConfig,
    ) -> Self {
        Self {
            sessions,
            gate,
            client,
            traces,
            service_calls,
            config,
        }
    }

    #[instrument(skip(self, event), fields(trace_id = %trace, terminal_id = %terminal, request_id = %request_id))]
    pub async fn recommend(
        &self,
        trace: &TraceId,
        parent: Option<&SpanId>,
        terminal: &TerminalId,
        request_id: &RequestId,
        event: &ClinicalEvent,
    ) -> Result<RecommendResponse, FabricError> {
        // 1. Resolve the (patient, day) session.
        let session_span = self.traces.open_span(
            trace,
            parent,
            "session",
            None,
            false,
            Some(serde_json::json!({ "patientId": event.pat_no })),
        )?;
        let session = match self.sessions.get_or_create(
            &event.pat_no,
            Utc::now().date_naive(),
            Some(terminal),
            event.hosp_code.as_deref(),
            event.dept_code.as_deref(),
        ) {
            Ok((row, created)) => {
                self.traces.close_span(
                    &session_span,
                    SpanStatus::Success,
                    Some(serde_json::json!({ "sessionKey": row.session_key, "created": created })),
                    None,
                );
                row
            }
            Err(e) => {
                self.traces
                    .close_span(&session_span, SpanStatus::Failed, None, Some(&e.to_string()));
                return Err(e);
            }
        };

        // 2. Gate. A denial closes the span Failed and the upstream is never
        // invoked.
        let auth_span = self
            .traces
            .open_span(trace, parent, "authorize", None, false, None)?;
        if let Err(e) = self
            .gate
            .authorize(terminal, &self.config.recommend_service_id)
        {
            self.traces
                .close_span(&auth_span, SpanStatus::Failed, None, Some(&e.to_string()));
            return Err(e);
        }
        self.traces
            .close_span(&auth_span, SpanStatus::Success, None, None);

        // 3. Single upstream call under the configured deadline.
        let upstream_request =
            UpstreamRequest::from_event(event, &self.config.ai_source, self.config.recommend_count);
        let upstream_span = self.traces.open_span(
            trace,
            parent,
            "ai_recommend",
            None,
            false,
            Some(serde_json::json!({ "sessionId": upstream_request.session_id })),
        )?;

        let started = Instant::now();
        let outcome = tokio::time::timeout(
            self.config.upstream_timeout,
            self.client.recommend(&upstream_request),
        )
        .await;
        let latency_ms = started.elapsed().as_millis() as i64;

        let recommendations = match outcome {
            Err(_) => {
                self.traces.close_span(
                    &upstream_span,
                    SpanStatus::Timeout,
                    None,
                    Some("upstream deadline exceeded"),
                );
                self.record_service_call(terminal, latency_ms, "timeout");
                return Err(FabricError::UpstreamTimeout(self.config.upstream_timeout));
            }
            Ok(Err(e)) => {
                self.traces
                    .close_span(&upstream_span, SpanStatus::Failed, None, Some(&e.to_string()));
                self.record_service_call(terminal, latency_ms, "failed");
                return Err(FabricError::UpstreamError(e.to_string()));
            }
            Ok(Ok(recommendations)) => {
                self.traces.close_span(
                    &upstream_span,
                    SpanStatus::Success,
                    Some(serde_json::json!({ "count": recommendations.len() })),
                    None,
                );
                self.record_service_call(terminal, latency_ms, "success");
                recommendations
            }
        };

        // 4. Session record, only after a successful call. A failed write
        // does not retract the response already produced.
        let content = serde_json::json!({
            "requestId": request_id,
            "recommendations": recommendations,
            "upstreamLatencyMs": latency_ms,
        });
        if let Err(e) =
            self.sessions
                .add_record(&session.session_key, "ai_response", &content, Some(trace))
        {
            warn!(session_key = %session.session_key, error = %e, "session record write failed");
        }

        info!(count = recommendations.len(), latency_ms, "recommendation complete");
        Ok(RecommendResponse {
            request_id: request_id.clone(),
            session_key: session.session_key,
            recommendations,
            upstream_latency_ms: latency_ms as u64,
        })
    }

    fn record_service_call(&self, terminal: &TerminalId, latency_ms: i64, outcome: &str) {
        if let Err(e) = self.service_calls.record(
            terminal,
            &self.config.recommend_service_id,
            latency_ms,
            outcome,
        ) {
            warn!(error = %e, "service call record write failed");
        }
    }
}
