use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use tracing::{info, instrument, warn};

use relay_core::errors::FabricError;
use relay_core::ids::{SessionKey, TerminalId, TraceId};
use relay_store::sessions::{SessionRepo, SessionRow};

use crate::store_err;

/// Groups recommendation calls by (patient, calendar day). Creation is lazy
/// and race-free: the store's unique index decides the winner and everyone
/// else reads the winner's row back.
pub struct SessionManager {
    repo: SessionRepo,
    expiry_days: i64,
}

impl SessionManager {
    pub fn new(repo: SessionRepo, expiry_days: i64) -> Self {
        Self { repo, expiry_days }
    }

    /// Get or create the session for a patient on a given day. Returns the
    /// row plus whether this call created it.
    #[instrument(skip(self), fields(patient_id, date = %date))]
    pub fn get_or_create(
        &self,
        patient_id: &str,
        date: NaiveDate,
        terminal: Option<&TerminalId>,
        hospital_code: Option<&str>,
        department: Option<&str>,
    ) -> Result<(SessionRow, bool), FabricError> {
        let (row, created) = self
            .repo
            .get_or_create(patient_id, date, terminal, hospital_code, department)
            .map_err(store_err)?;
        if created {
            info!(session_key = %row.session_key, "session created");
        }
        Ok((row, created))
    }

    /// Close a session; closing twice is a no-op.
    pub fn close(&self, key: &SessionKey) -> Result<(), FabricError> {
        self.repo.close(key).map_err(store_err)
    }

    /// Append one record to a session. Single-statement: fully written or
    /// absent.
    pub fn add_record(
        &self,
        key: &SessionKey,
        record_type: &str,
        content: &serde_json::Value,
        trace_id: Option<&TraceId>,
    ) -> Result<(), FabricError> {
        self.repo
            .add_record(key, record_type, content, trace_id)
            .map_err(store_err)
    }

    /// End-of-day sweep: close active sessions older than the expiry window.
    pub fn close_expired(&self) -> Result<usize, FabricError> {
        let cutoff = Utc::now().date_naive() - chrono::Duration::days(self.expiry_days);
        self.repo.close_expired(cutoff).map_err(store_err)
    }

    /// Spawn the daily expiry sweep.
    pub fn spawn_expiry_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(24 * 60 * 60));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match manager.close_expired() {
                    Ok(n) if n > 0 => info!(closed = n, "closed expired sessions"),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "session expiry sweep failed"),
                }
            }
        })
    }
}
