use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// A log record persisted to SQLite.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: Option<String>,
    pub span_id: Option<String>,
    pub trace_id: Option<String>,
    pub terminal_id: Option<String>,
}

/// Query parameters for searching persisted logs.
#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    pub level: Option<String>,
    pub target: Option<String>,
    pub trace_id: Option<String>,
    pub terminal_id: Option<String>,
    pub since: Option<String>,
    pub limit: Option<u32>,
}

/// SQLite sink that persists warn+ logs.
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS logs (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 timestamp TEXT NOT NULL,
                 level TEXT NOT NULL,
                 target TEXT NOT NULL,
                 message TEXT NOT NULL,
                 fields TEXT,
                 span_id TEXT,
                 trace_id TEXT,
                 terminal_id TEXT,
                 created_at TEXT NOT NULL DEFAULT (datetime('now'))
             );
             CREATE INDEX IF NOT EXISTS idx_logs_level ON logs(level);
             CREATE INDEX IF NOT EXISTS idx_logs_trace ON logs(trace_id);
             CREATE INDEX IF NOT EXISTS idx_logs_terminal ON logs(terminal_id);
             CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn insert(&self, record: &LogInsert) {
        let conn = self.conn.lock();
        let _ = conn.execute(
            "INSERT INTO logs (timestamp, level, target, message, fields, span_id, trace_id, terminal_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                record.timestamp,
                record.level,
                record.target,
                record.message,
                record.fields,
                record.span_id,
                record.trace_id,
                record.terminal_id,
            ],
        );
    }

    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut sql = String::from(
            "SELECT id, timestamp, level, target, message, fields, span_id, trace_id, terminal_id FROM logs WHERE 1=1",
        );
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(level) = &q.level {
            sql.push_str(&format!(" AND level = ?{}", params.len() + 1));
            params.push(Box::new(level.clone()));
        }
        if let Some(target) = &q.target {
            sql.push_str(&format!(" AND target LIKE ?{}", params.len() + 1));
            params.push(Box::new(format!("%{target}%")));
        }
        if let Some(trace_id) = &q.trace_id {
            sql.push_str(&format!(" AND trace_id = ?{}", params.len() + 1));
            params.push(Box::new(trace_id.clone()));
        }
        if let Some(terminal_id) = &q.terminal_id {
            sql.push_str(&format!(" AND terminal_id = ?{}", params.len() + 1));
            params.push(Box::new(terminal_id.clone()));
        }
        if let Some(since) = &q.since {
            sql.push_str(&format!(" AND timestamp >= ?{}", params.len() + 1));
            params.push(Box::new(since.clone()));
        }

        sql.push_str(" ORDER BY id DESC");

        let limit = q.limit.unwrap_or(100);
        sql.push_str(&format!(" LIMIT {limit}"));

        let param_refs: Vec<&dyn rusqlite::types::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(param_refs.as_slice(), |row| {
            Ok(LogRecord {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                level: row.get(2)?,
                target: row.get(3)?,
                message: row.get(4)?,
                fields: row.get(5)?,
                span_id: row.get(6)?,
                trace_id: row.get(7)?,
                terminal_id: row.get(8)?,
            })
        })?;

        rows.collect()
    }

    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))
    }
}

/// Internal insert record (not public).
struct LogInsert {
    timestamp: String,
    level: String,
    target: String,
    message: String,
    fields: Option<String>,
    span_id: Option<String>,
    trace_id: Option<String>,
    terminal_id: Option<String>,
}

/// tracing Layer that writes warn+ events to SQLite.
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

/// Visitor that extracts fields from a tracing event.
struct FieldVisitor {
    message: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
    trace_id: Option<String>,
    terminal_id: Option<String>,
}

impl FieldVisitor {
    fn new() -> Self {
        Self {
            message: None,
            fields: serde_json::Map::new(),
            trace_id: None,
            terminal_id: None,
        }
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let val = format!("{:?}", value);
        match field.name() {
            "message" => self.message = Some(val),
            "trace_id" => self.trace_id = Some(val.trim_matches('"').to_string()),
            "terminal_id" => self.terminal_id = Some(val.trim_matches('"').to_string()),
            name => {
                self.fields
                    .insert(name.to_string(), serde_json::Value::String(val));
            }
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = Some(value.to_string()),
            "trace_id" => self.trace_id = Some(value.to_string()),
            "terminal_id" => self.terminal_id = Some(value.to_string()),
            name => {
                self.fields
                    .insert(name.to_string(), serde_json::Value::String(value.to_string()));
            }
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Number(value.into()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(
            field.name().to_string(),
            serde_json::Value::Number(value.into()),
        );
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.fields
                .insert(field.name().to_string(), serde_json::Value::Number(n));
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Bool(value));
    }
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        // Only persist WARN and above
        let level = *event.metadata().level();
        if level > tracing::Level::WARN {
            return;
        }

        let mut visitor = FieldVisitor::new();
        event.record(&mut visitor);

        // Try to extract trace_id/terminal_id from span context if not on the event
        if visitor.trace_id.is_none() || visitor.terminal_id.is_none() {
            if let Some(scope) = ctx.event_scope(event) {
                for span in scope {
                    let extensions = span.extensions();
                    if let Some(fields) = extensions.get::<SpanFields>() {
                        if visitor.trace_id.is_none() {
                            visitor.trace_id.clone_from(&fields.trace_id);
                        }
                        if visitor.terminal_id.is_none() {
                            visitor.terminal_id.clone_from(&fields.terminal_id);
                        }
                    }
                }
            }
        }

        let span_id = ctx
            .event_scope(event)
            .and_then(|mut scope| scope.next())
            .map(|span| format!("{:?}", span.id()));

        let fields_json = if visitor.fields.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&visitor.fields).unwrap_or_default())
        };

        let record = LogInsert {
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string().to_uppercase(),
            target: event.metadata().target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields: fields_json,
            span_id,
            trace_id: visitor.trace_id,
            terminal_id: visitor.terminal_id,
        };

        self.sink.insert(&record);
    }

    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::new();
        attrs.record(&mut visitor);

        if visitor.trace_id.is_some() || visitor.terminal_id.is_some() {
            if let Some(span) = ctx.span(id) {
                let mut extensions = span.extensions_mut();
                extensions.insert(SpanFields {
                    trace_id: visitor.trace_id,
                    terminal_id: visitor.terminal_id,
                });
            }
        }
    }
}

/// Stored on spans to propagate trace_id / terminal_id to child events.
struct SpanFields {
    trace_id: Option<String>,
    terminal_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_db() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("relay-test-logs-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join("test-logs.db")
    }

    #[test]
    fn sqlite_sink_create_and_insert() {
        let db_path = temp_db();
        let sink = SqliteLogSink::new(&db_path).unwrap();

        sink.insert(&LogInsert {
            timestamp: "2026-08-14T12:00:00Z".into(),
            level: "WARN".into(),
            target: "relay_ai::client".into(),
            message: "upstream slow".into(),
            fields: Some(r#"{"latency_ms":8200}"#.into()),
            span_id: None,
            trace_id: Some("trace_123".into()),
            terminal_id: None,
        });

        let count = sink.count().unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn sqlite_sink_query_by_level() {
        let db_path = temp_db();
        let sink = SqliteLogSink::new(&db_path).unwrap();

        sink.insert(&LogInsert {
            timestamp: "2026-08-14T12:00:00Z".into(),
            level: "WARN".into(),
            target: "test".into(),
            message: "warning msg".into(),
            fields: None,
            span_id: None,
            trace_id: None,
            terminal_id: None,
        });
        sink.insert(&LogInsert {
            timestamp: "2026-08-14T12:00:01Z".into(),
            level: "ERROR".into(),
            target: "test".into(),
            message: "error msg".into(),
            fields: None,
            span_id: None,
            trace_id: None,
            terminal_id: None,
        });

        let results = sink
            .query(&LogQuery {
                level: Some("ERROR".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].message, "error msg");
    }

    #[test]
    fn sqlite_sink_query_by_trace() {
        let db_path = temp_db();
        let sink = SqliteLogSink::new(&db_path).unwrap();

        sink.insert(&LogInsert {
            timestamp: "2026-08-14T12:00:00Z".into(),
            level: "WARN".into(),
            target: "test".into(),
            message: "trace A".into(),
            fields: None,
            span_id: None,
            trace_id: Some("trace_aaa".into()),
            terminal_id: None,
        });
        sink.insert(&LogInsert {
            timestamp: "2026-08-14T12:00:01Z".into(),
            level: "WARN".into(),
            target: "test".into(),
            message: "trace B".into(),
            fields: None,
            span_id: None,
            trace_id: Some("trace_bbb".into()),
            terminal_id: None,
        });

        let results = sink
            .query(&LogQuery {
                trace_id: Some("trace_aaa".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].message, "trace A");
    }

    #[test]
    fn sqlite_sink_query_by_terminal() {
        let db_path = temp_db();
        let sink = SqliteLogSink::new(&db_path).unwrap();

        sink.insert(&LogInsert {
            timestamp: "2026-08-14T12:00:00Z".into(),
            level: "ERROR".into(),
            target: "relay_server::terminal".into(),
            message: "socket error".into(),
            fields: None,
            span_id: None,
            trace_id: None,
            terminal_id: Some("client_CARD_D1001".into()),
        });
        sink.insert(&LogInsert {
            timestamp: "2026-08-14T12:00:01Z".into(),
            level: "ERROR".into(),
            target: "relay_server::terminal".into(),
            message: "other socket".into(),
            fields: None,
            span_id: None,
            trace_id: None,
            terminal_id: Some("client_RAD_D2002".into()),
        });

        let results = sink
            .query(&LogQuery {
                terminal_id: Some("client_CARD_D1001".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].message, "socket error");
    }

    #[test]
    fn sqlite_sink_query_limit() {
        let db_path = temp_db();
        let sink = SqliteLogSink::new(&db_path).unwrap();

        for i in 0..10 {
            sink.insert(&LogInsert {
                timestamp: format!("2026-08-14T12:00:{i:02}Z"),
                level: "WARN".into(),
                target: "test".into(),
                message: format!("msg {i}"),
                fields: None,
                span_id: None,
                trace_id: None,
                terminal_id: None,
            });
        }

        let results = sink
            .query(&LogQuery {
                limit: Some(3),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results.len(), 3);
        // Most recent first (ORDER BY id DESC)
        assert_eq!(results[0].message, "msg 9");
    }

    #[test]
    fn sqlite_sink_query_since() {
        let db_path = temp_db();
        let sink = SqliteLogSink::new(&db_path).unwrap();

        sink.insert(&LogInsert {
            timestamp: "2026-08-14T11:00:00Z".into(),
            level: "WARN".into(),
            target: "test".into(),
            message: "old".into(),
            fields: None,
            span_id: None,
            trace_id: None,
            terminal_id: None,
        });
        sink.insert(&LogInsert {
            timestamp: "2026-08-14T13:00:00Z".into(),
            level: "WARN".into(),
            target: "test".into(),
            message: "new".into(),
            fields: None,
            span_id: None,
            trace_id: None,
            terminal_id: None,
        });

        let results = sink
            .query(&LogQuery {
                since: Some("2026-08-14T12:00:00Z".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].message, "new");
    }

    #[test]
    fn log_record_serde_roundtrip() {
        let record = LogRecord {
            id: 1,
            timestamp: "2026-08-14T12:00:00Z".into(),
            level: "WARN".into(),
            target: "relay_fabric".into(),
            message: "queue full".into(),
            fields: Some(r#"{"dropped":1}"#.into()),
            span_id: Some("Id(42)".into()),
            trace_id: Some("trace_123".into()),
            terminal_id: Some("client_CARD_D1001".into()),
        };
        let json = serde_json::to_string(&record).unwrap();
        let parsed: LogRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, 1);
        assert_eq!(parsed.level, "WARN");
        assert_eq!(parsed.trace_id.as_deref(), Some("trace_123"));
    }
}
