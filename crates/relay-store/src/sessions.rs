use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use relay_core::ids::{SessionKey, TerminalId, TraceId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Closed,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "closed" => Ok(Self::Closed),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// One recommendation session: all calls for a patient on one calendar day.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionRow {
    pub session_key: SessionKey,
    pub patient_id: String,
    pub session_date: NaiveDate,
    pub terminal_id: Option<TerminalId>,
    pub hospital_code: Option<String>,
    pub department: Option<String>,
    pub status: SessionStatus,
    pub created_at: String,
    pub last_active_at: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionRecordRow {
    pub id: i64,
    pub session_key: SessionKey,
    pub record_type: String,
    pub content: serde_json::Value,
    pub trace_id: Option<TraceId>,
    pub created_at: String,
}

pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Get or create the session for (patient, date).
    ///
    /// Compare-and-create: the UNIQUE index on (patient_id, session_date)
    /// guarantees exactly one row under concurrent first-calls; losers of the
    /// race read back the winner's row. Returns the row plus whether this
    /// call created it.
    #[instrument(skip(self), fields(patient_id, date = %date))]
    pub fn get_or_create(
        &self,
        patient_id: &str,
        date: NaiveDate,
        terminal: Option<&TerminalId>,
        hospital_code: Option<&str>,
        department: Option<&str>,
    ) -> Result<(SessionRow, bool), StoreError> {
        let key = SessionKey::new();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO sessions
                     (session_key, patient_id, session_date, terminal_id,
                      hospital_code, department, status, created_at, last_active_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'active', ?7, ?7)",
                rusqlite::params![
                    key.as_str(),
                    patient_id,
                    date.to_string(),
                    terminal.map(|t| t.as_str()),
                    hospital_code,
                    department,
                    now,
                ],
            )?;
            let created = inserted == 1;

            if !created {
                // Reused session: refresh activity and owning terminal.
                conn.execute(
                    "UPDATE sessions SET last_active_at = ?1,
                            terminal_id = COALESCE(?2, terminal_id)
                     WHERE patient_id = ?3 AND session_date = ?4",
                    rusqlite::params![
                        now,
                        terminal.map(|t| t.as_str()),
                        patient_id,
                        date.to_string(),
                    ],
                )?;
            }

            let row = query_session(
                conn,
                "SELECT session_key, patient_id, session_date, terminal_id, hospital_code,
                        department, status, created_at, last_active_at
                 FROM sessions WHERE patient_id = ?1 AND session_date = ?2",
                rusqlite::params![patient_id, date.to_string()],
            )?
            .ok_or_else(|| StoreError::NotFound(format!("session {patient_id}/{date}")))?;

            Ok((row, created))
        })
    }

    /// Get a session by key.
    #[instrument(skip(self), fields(session_key = %key))]
    pub fn get(&self, key: &SessionKey) -> Result<SessionRow, StoreError> {
        self.db.with_conn(|conn| {
            query_session(
                conn,
                "SELECT session_key, patient_id, session_date, terminal_id, hospital_code,
                        department, status, created_at, last_active_at
                 FROM sessions WHERE session_key = ?1",
                rusqlite::params![key.as_str()],
            )?
            .ok_or_else(|| StoreError::NotFound(format!("session {key}")))
        })
    }

    /// Close a session. Closing an already-closed session is a no-op.
    #[instrument(skip(self), fields(session_key = %key))]
    pub fn close(&self, key: &SessionKey) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE sessions SET status = 'closed', last_active_at = ?1
                 WHERE session_key = ?2 AND status != 'closed'",
                rusqlite::params![Utc::now().to_rfc3339(), key.as_str()],
            )?;
            Ok(())
        })
    }

    /// End-of-day sweep: close every active session dated strictly before
    /// `cutoff`. Returns the number of sessions closed.
    #[instrument(skip(self), fields(cutoff = %cutoff))]
    pub fn close_expired(&self, cutoff: NaiveDate) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE sessions SET status = 'closed', last_active_at = ?1
                 WHERE session_date < ?2 AND status = 'active'",
                rusqlite::params![Utc::now().to_rfc3339(), cutoff.to_string()],
            )?;
            Ok(n)
        })
    }

    /// Append a session record. Single statement: the record is either fully
    /// written or absent, never partial.
    #[instrument(skip(self, content), fields(session_key = %key, record_type))]
    pub fn add_record(
        &self,
        key: &SessionKey,
        record_type: &str,
        content: &serde_json::Value,
        trace_id: Option<&TraceId>,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO session_records (session_key, record_type, content, trace_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    key.as_str(),
                    record_type,
                    serde_json::to_string(content)?,
                    trace_id.map(|t| t.as_str()),
                    now,
                ],
            )?;
            Ok(())
        })
    }

    /// Records for a session, oldest first.
    pub fn records(&self, key: &SessionKey) -> Result<Vec<SessionRecordRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_key, record_type, content, trace_id, created_at
                 FROM session_records WHERE session_key = ?1 ORDER BY id ASC",
            )?;
            let mut rows = stmt.query([key.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                let content_raw: String = row_helpers::get(row, 3, "session_records", "content")?;
                results.push(SessionRecordRow {
                    id: row_helpers::get(row, 0, "session_records", "id")?,
                    session_key: SessionKey::from_raw(row_helpers::get::<String>(
                        row, 1, "session_records", "session_key",
                    )?),
                    record_type: row_helpers::get(row, 2, "session_records", "record_type")?,
                    content: serde_json::from_str(&content_raw).map_err(|e| {
                        StoreError::CorruptRow {
                            table: "session_records",
                            column: "content",
                            detail: e.to_string(),
                        }
                    })?,
                    trace_id: row_helpers::get_opt::<String>(row, 4, "session_records", "trace_id")?
                        .map(TraceId::from_raw),
                    created_at: row_helpers::get(row, 5, "session_records", "created_at")?,
                });
            }
            Ok(results)
        })
    }
}

fn query_session(
    conn: &rusqlite::Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Option<SessionRow>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_session(row)?)),
        None => Ok(None),
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<SessionRow, StoreError> {
    let status_str: String = row_helpers::get(row, 6, "sessions", "status")?;
    let date_str: String = row_helpers::get(row, 2, "sessions", "session_date")?;

    Ok(SessionRow {
        session_key: SessionKey::from_raw(row_helpers::get::<String>(row, 0, "sessions", "session_key")?),
        patient_id: row_helpers::get(row, 1, "sessions", "patient_id")?,
        session_date: date_str.parse().map_err(|_| StoreError::CorruptRow {
            table: "sessions",
            column: "session_date",
            detail: format!("invalid date: {date_str}"),
        })?,
        terminal_id: row_helpers::get_opt::<String>(row, 3, "sessions", "terminal_id")?
            .map(TerminalId::from_raw),
        hospital_code: row_helpers::get_opt(row, 4, "sessions", "hospital_code")?,
        department: row_helpers::get_opt(row, 5, "sessions", "department")?,
        status: row_helpers::parse_enum(&status_str, "sessions", "status")?,
        created_at: row_helpers::get(row, 7, "sessions", "created_at")?,
        last_active_at: row_helpers::get(row, 8, "sessions", "last_active_at")?,
    })
}
