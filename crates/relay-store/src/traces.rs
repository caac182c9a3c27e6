use serde::{Deserialize, Serialize};
use tracing::instrument;

use relay_core::ids::{SpanId, TerminalId, TraceId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    Running,
    Success,
    Failed,
    Timeout,
}

impl std::fmt::Display for TraceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

impl std::str::FromStr for TraceStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            other => Err(format!("unknown trace status: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    Running,
    Success,
    Failed,
    Timeout,
}

impl SpanStatus {
    pub fn is_closed(self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::Timeout)
    }
}

impl std::fmt::Display for SpanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

impl std::str::FromStr for SpanStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            other => Err(format!("unknown span status: {other}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TraceRow {
    pub id: TraceId,
    pub stimulus: String,
    pub start_time: String,
    pub end_time: Option<String>,
    pub status: TraceStatus,
    pub total_duration_ms: Option<i64>,
}

/// Flat span record: the tree is reconstructed on read from parent_span_id.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SpanRow {
    pub id: SpanId,
    pub trace_id: TraceId,
    pub parent_span_id: Option<SpanId>,
    pub service_name: String,
    pub terminal_id: Option<TerminalId>,
    pub start_time: String,
    pub end_time: Option<String>,
    pub duration_ms: Option<i64>,
    pub status: SpanStatus,
    pub request_summary: Option<String>,
    pub response_summary: Option<String>,
    pub error_message: Option<String>,
    pub non_critical: bool,
}

/// Span tree node reconstructed from flat rows.
#[derive(Clone, Debug, Serialize)]
pub struct SpanNode {
    pub span: SpanRow,
    pub children: Vec<SpanNode>,
}

/// Rebuild the parent/child structure from flat rows, preserving row order
/// among siblings. Orphans (parent not in the set) surface as roots rather
/// than disappearing.
pub fn build_span_tree(spans: Vec<SpanRow>) -> Vec<SpanNode> {
    let ids: std::collections::HashSet<String> =
        spans.iter().map(|s| s.id.as_str().to_string()).collect();

    let mut children_of: std::collections::HashMap<String, Vec<SpanRow>> =
        std::collections::HashMap::new();
    let mut roots = Vec::new();

    for span in spans {
        match span.parent_span_id.as_ref().map(|p| p.as_str().to_string()) {
            Some(parent) if ids.contains(&parent) => {
                children_of.entry(parent).or_default().push(span);
            }
            _ => roots.push(span),
        }
    }

    fn attach(
        span: SpanRow,
        children_of: &mut std::collections::HashMap<String, Vec<SpanRow>>,
    ) -> SpanNode {
        let children = children_of
            .remove(span.id.as_str())
            .unwrap_or_default()
            .into_iter()
            .map(|c| attach(c, children_of))
            .collect();
        SpanNode { span, children }
    }

    roots.into_iter().map(|r| attach(r, &mut children_of)).collect()
}

pub struct TraceRepo {
    db: Database,
}

impl TraceRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self), fields(trace_id = %trace.id))]
    pub fn insert_trace(&self, trace: &TraceRow) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO traces (id, stimulus, start_time, end_time, status, total_duration_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    trace.id.as_str(),
                    trace.stimulus,
                    trace.start_time,
                    trace.end_time,
                    trace.status.to_string(),
                    trace.total_duration_ms,
                ],
            )?;
            Ok(())
        })
    }

    /// Finalize a trace. Closed traces are write-once: a second finish is a
    /// no-op rather than a rewrite.
    #[instrument(skip(self), fields(trace_id = %id, status = %status))]
    pub fn finish_trace(
        &self,
        id: &TraceId,
        status: TraceStatus,
        end_time: &str,
        total_duration_ms: i64,
    ) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE traces SET end_time = ?1, status = ?2, total_duration_ms = ?3
                 WHERE id = ?4 AND end_time IS NULL",
                rusqlite::params![end_time, status.to_string(), total_duration_ms, id.as_str()],
            )?;
            Ok(n == 1)
        })
    }

    #[instrument(skip(self, span), fields(span_id = %span.id, trace_id = %span.trace_id))]
    pub fn insert_span(&self, span: &SpanRow) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO spans (id, trace_id, parent_span_id, service_name, terminal_id,
                                    start_time, end_time, duration_ms, status,
                                    request_summary, response_summary, error_message, non_critical)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                rusqlite::params![
                    span.id.as_str(),
                    span.trace_id.as_str(),
                    span.parent_span_id.as_ref().map(|p| p.as_str()),
                    span.service_name,
                    span.terminal_id.as_ref().map(|t| t.as_str()),
                    span.start_time,
                    span.end_time,
                    span.duration_ms,
                    span.status.to_string(),
                    span.request_summary,
                    span.response_summary,
                    span.error_message,
                    span.non_critical,
                ],
            )?;
            Ok(())
        })
    }

    /// Finalize a span. Same write-once guard as traces.
    #[instrument(skip(self, response_summary), fields(span_id = %id, status = %status))]
    pub fn finish_span(
        &self,
        id: &SpanId,
        status: SpanStatus,
        end_time: &str,
        duration_ms: i64,
        response_summary: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE spans SET end_time = ?1, duration_ms = ?2, status = ?3,
                        response_summary = COALESCE(?4, response_summary),
                        error_message = COALESCE(?5, error_message)
                 WHERE id = ?6 AND end_time IS NULL",
                rusqlite::params![
                    end_time,
                    duration_ms,
                    status.to_string(),
                    response_summary,
                    error_message,
                    id.as_str(),
                ],
            )?;
            Ok(n == 1)
        })
    }

    /// Load a trace and all its spans (insertion order).
    pub fn load(&self, id: &TraceId) -> Result<(TraceRow, Vec<SpanRow>), StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, stimulus, start_time, end_time, status, total_duration_ms
                 FROM traces WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            let trace = match rows.next()? {
                Some(row) => row_to_trace(row)?,
                None => return Err(StoreError::NotFound(format!("trace {id}"))),
            };

            let mut stmt = conn.prepare(
                "SELECT id, trace_id, parent_span_id, service_name, terminal_id,
                        start_time, end_time, duration_ms, status,
                        request_summary, response_summary, error_message, non_critical
                 FROM spans WHERE trace_id = ?1 ORDER BY rowid ASC",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            let mut spans = Vec::new();
            while let Some(row) = rows.next()? {
                spans.push(row_to_span(row)?);
            }
            Ok((trace, spans))
        })
    }

    /// Reconciliation sweep: mark traces still open past the grace cutoff as
    /// Timeout, along with their still-running spans. Durations are derived
    /// from the persisted timestamps so `duration == end - start` holds for
    /// swept rows too. Returns traces marked.
    #[instrument(skip(self))]
    pub fn mark_stale_open_traces(&self, cutoff: &str, now: &str) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE spans SET end_time = ?1,
                        duration_ms = CAST(ROUND((julianday(?1) - julianday(start_time)) * 86400000) AS INTEGER),
                        status = 'timeout'
                 WHERE end_time IS NULL
                   AND trace_id IN (SELECT id FROM traces WHERE end_time IS NULL AND start_time < ?2)",
                rusqlite::params![now, cutoff],
            )?;
            let n = conn.execute(
                "UPDATE traces SET end_time = ?1, status = 'timeout',
                        total_duration_ms = CAST(ROUND((julianday(?1) - julianday(start_time)) * 86400000) AS INTEGER)
                 WHERE end_time IS NULL AND start_time < ?2",
                rusqlite::params![now, cutoff],
            )?;
            Ok(n)
        })
    }
}

fn row_to_trace(row: &rusqlite::Row<'_>) -> Result<TraceRow, StoreError> {
    let status_str: String = row_helpers::get(row, 4, "traces", "status")?;
    Ok(TraceRow {
        id: TraceId::from_raw(row_helpers::get::<String>(row, 0, "traces", "id")?),
        stimulus: row_helpers::get(row, 1, "traces", "stimulus")?,
        start_time: row_helpers::get(row, 2, "traces", "start_time")?,
        end_time: row_helpers::get_opt(row, 3, "traces", "end_time")?,
        status: row_helpers::parse_enum(&status_str, "traces", "status")?,
        total_duration_ms: row_helpers::get_opt(row, 5, "traces", "total_duration_ms")?,
    })
}

fn row_to_span(row: &rusqlite::Row<'_>) -> Result<SpanRow, StoreError> {
    let status_str: String = row_helpers::get(row, 8, "spans", "status")?;
    Ok(SpanRow {
        id: SpanId::from_raw(row_helpers::get::<String>(row, 0, "spans", "id")?),
        trace_id: TraceId::from_raw(row_helpers::get::<String>(row, 1, "spans", "trace_id")?),
        parent_span_id: row_helpers::get_opt::<String>(row, 2, "spans", "parent_span_id")?
            .map(SpanId::from_raw),
        service_name: row_helpers::get(row, 3, "spans", "service_name")?,
        terminal_id: row_helpers::get_opt::<String>(row, 4, "spans", "terminal_id")?
            .map(TerminalId::from_raw),
        start_time: row_helpers::get(row, 5, "spans", "start_time")?,
        end_time: row_helpers::get_opt(row, 6, "spans", "end_time")?,
        duration_ms: row_helpers::get_opt(row, 7, "spans", "duration_ms")?,
        status: row_helpers::parse_enum(&status_str, "spans", "status")?,
        request_summary: row_helpers::get_opt(row, 9, "spans", "request_summary")?,
        response_summary: row_helpers::get_opt(row, 10, "spans", "response_summary")?,
        error_message: row_helpers::get_opt(row, 11, "spans", "error_message")?,
        non_critical: row_helpers::get(row, 12, "spans", "non_critical")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> TraceRepo {
        TraceRepo::new(Database::in_memory().unwrap())
    }

    fn open_trace(repo: &TraceRepo) -> TraceId {
        let id = TraceId::new();
        repo.insert_trace(&TraceRow {
            id: id.clone(),
            stimulus: "his_push".into(),
            start_time: "2026-08-25T09:00:00+00:00".into(),
            end_time: None,
            status: TraceStatus::Running,
            total_duration_ms: None,
        })
        .unwrap();
        id
    }

    fn open_span(repo: &TraceRepo, trace: &TraceId, parent: Option<&SpanId>, name: &str) -> SpanId {
        let id = SpanId::new();
        repo.insert_span(&SpanRow {
            id: id.clone(),
            trace_id: trace.clone(),
            parent_span_id: parent.cloned(),
            service_name: name.into(),
            terminal_id: None,
            start_time: "2026-08-25T09:00:00+00:00".into(),
            end_time: None,
            duration_ms: None,
            status: SpanStatus::Running,
            request_summary: None,
            response_summary: None,
            error_message: None,
            non_critical: false,
        })
        .unwrap();
        id
    }

    #[test]
    fn round_trip_preserves_structure_and_status() {
        let repo = repo();
        let trace = open_trace(&repo);
        let root = open_span(&repo, &trace, None, "gateway");
        let child_a = open_span(&repo, &trace, Some(&root), "authorize");
        let child_b = open_span(&repo, &trace, Some(&root), "route");

        for (id, status) in [
            (&child_a, SpanStatus::Success),
            (&child_b, SpanStatus::Success),
            (&root, SpanStatus::Success),
        ] {
            repo.finish_span(id, status, "2026-08-25T09:00:01+00:00", 1000, None, None)
                .unwrap();
        }
        repo.finish_trace(&trace, TraceStatus::Success, "2026-08-25T09:00:01+00:00", 1000)
            .unwrap();

        let (loaded, spans) = repo.load(&trace).unwrap();
        assert_eq!(loaded.status, TraceStatus::Success);
        assert_eq!(spans.len(), 3);

        let tree = build_span_tree(spans);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].span.id, root);
        assert_eq!(tree[0].children.len(), 2);
        assert_eq!(tree[0].children[0].span.id, child_a);
        assert_eq!(tree[0].children[1].span.id, child_b);
        assert!(tree[0].children.iter().all(|c| c.span.status == SpanStatus::Success));
    }

    #[test]
    fn finish_trace_is_write_once() {
        let repo = repo();
        let trace = open_trace(&repo);
        assert!(repo
            .finish_trace(&trace, TraceStatus::Success, "2026-08-25T09:00:01+00:00", 1000)
            .unwrap());
        // Second finish must not rewrite the closed row.
        assert!(!repo
            .finish_trace(&trace, TraceStatus::Failed, "2026-08-25T09:00:05+00:00", 5000)
            .unwrap());

        let (loaded, _) = repo.load(&trace).unwrap();
        assert_eq!(loaded.status, TraceStatus::Success);
        assert_eq!(loaded.total_duration_ms, Some(1000));
    }

    #[test]
    fn finish_span_is_write_once() {
        let repo = repo();
        let trace = open_trace(&repo);
        let span = open_span(&repo, &trace, None, "route");
        assert!(repo
            .finish_span(&span, SpanStatus::Failed, "2026-08-25T09:00:01+00:00", 1000, None, Some("queue full"))
            .unwrap());
        assert!(!repo
            .finish_span(&span, SpanStatus::Success, "2026-08-25T09:00:02+00:00", 2000, None, None)
            .unwrap());

        let (_, spans) = repo.load(&trace).unwrap();
        assert_eq!(spans[0].status, SpanStatus::Failed);
        assert_eq!(spans[0].error_message.as_deref(), Some("queue full"));
    }

    #[test]
    fn orphan_span_surfaces_as_root() {
        let repo = repo();
        let trace = open_trace(&repo);
        let root = open_span(&repo, &trace, None, "gateway");
        let ghost_parent = SpanId::from_raw("span_not_persisted");
        let orphan = open_span(&repo, &trace, Some(&ghost_parent), "lost");

        let (_, spans) = repo.load(&trace).unwrap();
        let tree = build_span_tree(spans);
        let ids: Vec<&str> = tree.iter().map(|n| n.span.id.as_str()).collect();
        assert!(ids.contains(&root.as_str()));
        assert!(ids.contains(&orphan.as_str()));
    }

    #[test]
    fn stale_open_traces_marked_timeout() {
        let repo = repo();
        let stale = open_trace(&repo);
        open_span(&repo, &stale, None, "gateway");

        let fresh = TraceId::new();
        repo.insert_trace(&TraceRow {
            id: fresh.clone(),
            stimulus: "his_push".into(),
            start_time: "2026-08-25T11:00:00+00:00".into(),
            end_time: None,
            status: TraceStatus::Running,
            total_duration_ms: None,
        })
        .unwrap();

        let marked = repo
            .mark_stale_open_traces("2026-08-25T10:00:00+00:00", "2026-08-25T11:05:00+00:00")
            .unwrap();
        assert_eq!(marked, 1);

        let (stale_row, stale_spans) = repo.load(&stale).unwrap();
        assert_eq!(stale_row.status, TraceStatus::Timeout);
        assert!(stale_spans.iter().all(|s| s.status == SpanStatus::Timeout));
        // 09:00:00 -> 11:05:00, derived from the persisted timestamps.
        assert_eq!(stale_row.total_duration_ms, Some(7_500_000));
        assert_eq!(stale_spans[0].duration_ms, Some(7_500_000));

        let (fresh_row, _) = repo.load(&fresh).unwrap();
        assert_eq!(fresh_row.status, TraceStatus::Running);
    }

    #[test]
    fn load_missing_trace_fails() {
        let repo = repo();
        assert!(matches!(
            repo.load(&TraceId::from_raw("trace_missing")),
            Err(StoreError::NotFound(_))
        ));
    }
}
