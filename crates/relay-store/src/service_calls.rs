use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use relay_core::ids::TerminalId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Monitoring sample for one completed external call. Written once when the
/// owning span closes; never read by the routing path.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceCallRecord {
    pub terminal_id: TerminalId,
    pub service_id: String,
    pub latency_ms: i64,
    pub outcome: String,
    pub created_at: String,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ServiceCallSummary {
    pub count: u64,
    pub failures: u64,
    pub mean_latency_ms: f64,
}

pub struct ServiceCallRepo {
    db: Database,
}

impl ServiceCallRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self), fields(terminal_id = %terminal, service_id = service, latency_ms, outcome))]
    pub fn record(
        &self,
        terminal: &TerminalId,
        service: &str,
        latency_ms: i64,
        outcome: &str,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO service_calls (terminal_id, service_id, latency_ms, outcome, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![terminal.as_str(), service, latency_ms, outcome, now],
            )?;
            Ok(())
        })
    }

    /// Aggregate latency/outcome view per (terminal, service).
    pub fn summary(
        &self,
        terminal: &TerminalId,
        service: &str,
    ) -> Result<ServiceCallSummary, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT COUNT(*),
                        COALESCE(SUM(CASE WHEN outcome != 'success' THEN 1 ELSE 0 END), 0),
                        COALESCE(AVG(latency_ms), 0.0)
                 FROM service_calls WHERE terminal_id = ?1 AND service_id = ?2",
            )?;
            let mut rows = stmt.query(rusqlite::params![terminal.as_str(), service])?;
            match rows.next()? {
                Some(row) => Ok(ServiceCallSummary {
                    count: row_helpers::get::<i64>(row, 0, "service_calls", "count")? as u64,
                    failures: row_helpers::get::<i64>(row, 1, "service_calls", "failures")? as u64,
                    mean_latency_ms: row_helpers::get(row, 2, "service_calls", "mean_latency_ms")?,
                }),
                None => Ok(ServiceCallSummary::default()),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_and_summarize() {
        let repo = ServiceCallRepo::new(Database::in_memory().unwrap());
        let terminal = TerminalId::new("CARD", "D1001");

        repo.record(&terminal, "ai_recommend", 800, "success").unwrap();
        repo.record(&terminal, "ai_recommend", 1200, "success").unwrap();
        repo.record(&terminal, "ai_recommend", 30_000, "timeout").unwrap();

        let summary = repo.summary(&terminal, "ai_recommend").unwrap();
        assert_eq!(summary.count, 3);
        assert_eq!(summary.failures, 1);
        assert!((summary.mean_latency_ms - 10_666.0).abs() < 1.0);
    }

    #[test]
    fn summary_scoped_to_terminal_and_service() {
        let repo = ServiceCallRepo::new(Database::in_memory().unwrap());
        let a = TerminalId::new("CARD", "D1001");
        let b = TerminalId::new("RAD", "D2002");
        repo.record(&a, "ai_recommend", 500, "success").unwrap();
        repo.record(&b, "ai_recommend", 700, "success").unwrap();

        assert_eq!(repo.summary(&a, "ai_recommend").unwrap().count, 1);
        assert_eq!(repo.summary(&a, "other").unwrap().count, 0);
    }
}
