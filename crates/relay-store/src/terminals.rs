use chrono::Utc;
use tracing::instrument;

use relay_core::ids::TerminalId;

use crate::database::Database;
use crate::error::StoreError;

/// Persisted terminal state snapshot. Written through on connect, heartbeat
/// and disconnect; the authoritative state lives in the in-memory registry.
pub struct TerminalRepo {
    db: Database,
}

impl TerminalRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self), fields(terminal_id = %id))]
    pub fn record_connected(
        &self,
        id: &TerminalId,
        clinician: &str,
        department: &str,
        remote_addr: Option<&str>,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO terminals
                     (id, clinician_id, department, remote_addr, status,
                      connected_at, last_heartbeat, disconnected_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 'connected', ?5, ?5, NULL, ?5)
                 ON CONFLICT (id) DO UPDATE SET
                     remote_addr = excluded.remote_addr,
                     status = 'connected',
                     connected_at = excluded.connected_at,
                     last_heartbeat = excluded.last_heartbeat,
                     disconnected_at = NULL,
                     updated_at = excluded.updated_at",
                rusqlite::params![id.as_str(), clinician, department, remote_addr, now],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(terminal_id = %id))]
    pub fn record_heartbeat(&self, id: &TerminalId) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE terminals SET last_heartbeat = ?1, status = 'connected', updated_at = ?1
                 WHERE id = ?2",
                rusqlite::params![now, id.as_str()],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(terminal_id = %id, reason))]
    pub fn record_disconnected(&self, id: &TerminalId, reason: &str) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE terminals SET status = 'disconnected', disconnected_at = ?1, updated_at = ?1
                 WHERE id = ?2",
                rusqlite::params![now, id.as_str()],
            )?;
            Ok(())
        })
    }

    pub fn status(&self, id: &TerminalId) -> Result<Option<String>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT status FROM terminals WHERE id = ?1")?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row.get::<_, String>(0)?)),
                None => Ok(None),
            }
        })
    }
}
