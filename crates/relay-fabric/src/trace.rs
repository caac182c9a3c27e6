use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use relay_core::errors::FabricError;
use relay_core::ids::{SpanId, TerminalId, TraceId};
use relay_store::error::StoreError;
use relay_store::traces::{SpanNode, SpanRow, SpanStatus, TraceRepo, TraceRow, TraceStatus};

use crate::config::FabricConfig;

struct OpenTrace {
    started: Instant,
    started_wall: DateTime<Utc>,
    closed: bool,
    spans: Vec<SpanId>,
}

struct OpenSpan {
    trace_id: TraceId,
    terminal: Option<TerminalId>,
    started: Instant,
    started_wall: DateTime<Utc>,
    status: SpanStatus,
    non_critical: bool,
}

/// Builds the per-stimulus call-chain record. Spans live in a flat arena
/// keyed by id; the tree is reconstructed from parent ids on read. Every
/// open/close is written through to the store, but store failures only log —
/// trace recording never blocks routing.
pub struct TraceRecorder {
    repo: TraceRepo,
    traces: DashMap<TraceId, Mutex<OpenTrace>>,
    spans: DashMap<SpanId, Mutex<OpenSpan>>,
    config: FabricConfig,
}

impl TraceRecorder {
    pub fn new(repo: TraceRepo, config: FabricConfig) -> Self {
        Self {
            repo,
            traces: DashMap::new(),
            spans: DashMap::new(),
            config,
        }
    }

    /// Open a trace for one external stimulus.
    #[instrument(skip(self))]
    pub fn open_trace(&self, stimulus: &str) -> TraceId {
        let id = TraceId::new();
        let opened_at = Utc::now();
        self.traces.insert(
            id.clone(),
            Mutex::new(OpenTrace {
                started: Instant::now(),
                started_wall: opened_at,
                closed: false,
                spans: Vec::new(),
            }),
        );
        if let Err(e) = self.repo.insert_trace(&TraceRow {
            id: id.clone(),
            stimulus: stimulus.to_string(),
            start_time: opened_at.to_rfc3339(),
            end_time: None,
            status: TraceStatus::Running,
            total_duration_ms: None,
        }) {
            warn!(trace_id = %id, error = %e, "failed to persist trace open");
        }
        id
    }

    /// Open a span under a trace. An unknown or closed trace, or a parent
    /// belonging to a different trace, is an integrity violation: the orphan
    /// is refused and other spans are unaffected.
    #[instrument(skip(self, request_summary), fields(trace_id = %trace, service))]
    pub fn open_span(
        &self,
        trace: &TraceId,
        parent: Option<&SpanId>,
        service: &str,
        terminal: Option<&TerminalId>,
        non_critical: bool,
        request_summary: Option<serde_json::Value>,
    ) -> Result<SpanId, FabricError> {
        {
            let entry = self.traces.get(trace).ok_or_else(|| {
                FabricError::TraceIntegrity(format!("span for unknown trace {trace}"))
            })?;
            let mut open = entry.lock();
            if open.closed {
                return Err(FabricError::TraceIntegrity(format!(
                    "span for closed trace {trace}"
                )));
            }
            if let Some(parent_id) = parent {
                let parent_trace = self
                    .spans
                    .get(parent_id)
                    .map(|s| s.lock().trace_id.clone());
                if parent_trace.as_ref() != Some(trace) {
                    return Err(FabricError::TraceIntegrity(format!(
                        "parent span {parent_id} does not belong to trace {trace}"
                    )));
                }
            }
            let id = SpanId::new();
            let opened_at = Utc::now();
            open.spans.push(id.clone());
            self.spans.insert(
                id.clone(),
                Mutex::new(OpenSpan {
                    trace_id: trace.clone(),
                    terminal: terminal.cloned(),
                    started: Instant::now(),
                    started_wall: opened_at,
                    status: SpanStatus::Running,
                    non_critical,
                }),
            );
            if let Err(e) = self.repo.insert_span(&SpanRow {
                id: id.clone(),
                trace_id: trace.clone(),
                parent_span_id: parent.cloned(),
                service_name: service.to_string(),
                terminal_id: terminal.cloned(),
                start_time: opened_at.to_rfc3339(),
                end_time: None,
                duration_ms: None,
                status: SpanStatus::Running,
                request_summary: request_summary.map(|v| v.to_string()),
                response_summary: None,
                error_message: None,
                non_critical,
            }) {
                warn!(span_id = %id, error = %e, "failed to persist span open");
            }
            Ok(id)
        }
    }

    /// Close a span. Closing an unknown or already-closed span is a no-op;
    /// end time and duration are set exactly once. The stored end time is
    /// the recorded start plus the monotonic duration, so the persisted pair
    /// never disagrees.
    #[instrument(skip(self, response_summary), fields(span_id = %span, status = %status))]
    pub fn close_span(
        &self,
        span: &SpanId,
        status: SpanStatus,
        response_summary: Option<serde_json::Value>,
        error_message: Option<&str>,
    ) {
        let Some(entry) = self.spans.get(span) else {
            return;
        };
        let (duration_ms, end_time) = {
            let mut open = entry.lock();
            if open.status.is_closed() {
                return;
            }
            open.status = status;
            let duration_ms = open.started.elapsed().as_millis() as i64;
            (
                duration_ms,
                open.started_wall + chrono::Duration::milliseconds(duration_ms),
            )
        };
        drop(entry);

        let summary = response_summary.map(|v| v.to_string());
        if let Err(e) = self.repo.finish_span(
            span,
            status,
            &end_time.to_rfc3339(),
            duration_ms,
            summary.as_deref(),
            error_message,
        ) {
            warn!(span_id = %span, error = %e, "failed to persist span close");
        }
    }

    /// Close a trace, aggregating from its spans: Failed iff any
    /// non-suppressed span failed or timed out, else Success. Spans still
    /// running are closed as Timeout first. Total duration is close − open,
    /// independent of span durations. Returns None when the trace is unknown
    /// or already closed.
    pub fn close_trace(&self, trace: &TraceId) -> Option<TraceStatus> {
        self.close_trace_as(trace, None)
    }

    fn close_trace_as(&self, trace: &TraceId, forced: Option<TraceStatus>) -> Option<TraceStatus> {
        let span_ids;
        let duration_ms;
        let end_time;
        {
            let entry = self.traces.get(trace)?;
            let mut open = entry.lock();
            if open.closed {
                return None;
            }
            open.closed = true;
            duration_ms = open.started.elapsed().as_millis() as i64;
            end_time = open.started_wall + chrono::Duration::milliseconds(duration_ms);
            span_ids = open.spans.clone();
        }

        let mut any_failure = false;
        for span_id in &span_ids {
            let Some(entry) = self.spans.get(span_id) else {
                continue;
            };
            let (status, non_critical) = {
                let open = entry.lock();
                (open.status, open.non_critical)
            };
            drop(entry);
            let status = if status.is_closed() {
                status
            } else {
                self.close_span(span_id, SpanStatus::Timeout, None, Some("trace closed"));
                SpanStatus::Timeout
            };
            if !non_critical && status.is_failure() {
                any_failure = true;
            }
        }

        let status = forced.unwrap_or(if any_failure {
            TraceStatus::Failed
        } else {
            TraceStatus::Success
        });

        if let Err(e) = self
            .repo
            .finish_trace(trace, status, &end_time.to_rfc3339(), duration_ms)
        {
            warn!(trace_id = %trace, error = %e, "failed to persist trace close");
        }

        for span_id in &span_ids {
            self.spans.remove(span_id);
        }
        self.traces.remove(trace);
        debug!(trace_id = %trace, status = %status, "trace closed");
        Some(status)
    }

    /// Close every open span attributed to a terminal as Timeout. Called on
    /// disconnect so pending deliveries do not dangle.
    #[instrument(skip(self), fields(terminal_id = %terminal))]
    pub fn force_close_terminal_spans(&self, terminal: &TerminalId) {
        let pending: Vec<SpanId> = self
            .spans
            .iter()
            .filter(|entry| {
                let open = entry.lock();
                !open.status.is_closed() && open.terminal.as_ref() == Some(terminal)
            })
            .map(|entry| entry.key().clone())
            .collect();

        for span_id in pending {
            self.close_span(
                &span_id,
                SpanStatus::Timeout,
                None,
                Some("terminal disconnected"),
            );
        }
    }

    /// Reconciliation sweep: traces open past the grace period are closed as
    /// Timeout, both in memory and any rows orphaned by a restart. Returns
    /// how many traces were swept.
    pub fn close_stale_traces(&self) -> usize {
        let grace = self.config.trace_grace;
        let stale: Vec<TraceId> = self
            .traces
            .iter()
            .filter(|entry| {
                let open = entry.lock();
                !open.closed && open.started.elapsed() >= grace
            })
            .map(|entry| entry.key().clone())
            .collect();

        let mut swept = 0;
        for trace in &stale {
            if self.close_trace_as(trace, Some(TraceStatus::Timeout)).is_some() {
                swept += 1;
            }
        }

        let cutoff = (Utc::now() - chrono::Duration::from_std(grace).unwrap_or_default())
            .to_rfc3339();
        match self
            .repo
            .mark_stale_open_traces(&cutoff, &Utc::now().to_rfc3339())
        {
            Ok(n) => swept += n,
            Err(e) => warn!(error = %e, "stale trace reconciliation failed"),
        }
        swept
    }

    /// Load a persisted trace and its reconstructed span tree.
    pub fn load(&self, trace: &TraceId) -> Result<(TraceRow, Vec<SpanNode>), StoreError> {
        let (row, spans) = self.repo.load(trace)?;
        Ok((row, relay_store::traces::build_span_tree(spans)))
    }

    /// Spawn the periodic stale-trace sweep.
    pub fn spawn_stale_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let recorder = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(recorder.config.trace_grace);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let swept = recorder.close_stale_traces();
                if swept > 0 {
                    warn!(swept, "closed stale traces");
                }
            }
        })
    }
}
