use std::collections::{HashMap, HashSet};

use tracing::instrument;

use relay_core::ids::TerminalId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Point-in-time view of the role/ACL tables, loaded whole and swapped by the
/// Authorization Gate. Never mutated in place.
#[derive(Clone, Debug, Default)]
pub struct AclSnapshot {
    /// terminal id -> bound role ids
    pub bindings: HashMap<String, Vec<String>>,
    /// role id -> granted service ids (allow = true rows only)
    pub grants: HashMap<String, HashSet<String>>,
}

impl AclSnapshot {
    /// Effective permission is the union across bound roles. A terminal with
    /// no bound roles is granted nothing.
    pub fn is_allowed(&self, terminal: &TerminalId, service: &str) -> bool {
        let Some(roles) = self.bindings.get(terminal.as_str()) else {
            return false;
        };
        roles.iter().any(|role| {
            self.grants
                .get(role)
                .is_some_and(|services| services.contains(service))
        })
    }
}

pub struct AclRepo {
    db: Database,
}

impl AclRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Load a complete snapshot from the configuration tables.
    #[instrument(skip(self))]
    pub fn load_snapshot(&self) -> Result<AclSnapshot, StoreError> {
        self.db.with_conn(|conn| {
            let mut bindings: HashMap<String, Vec<String>> = HashMap::new();
            let mut stmt = conn.prepare("SELECT terminal_id, role_id FROM role_bindings")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let terminal: String = row_helpers::get(row, 0, "role_bindings", "terminal_id")?;
                let role: String = row_helpers::get(row, 1, "role_bindings", "role_id")?;
                bindings.entry(terminal).or_default().push(role);
            }

            let mut grants: HashMap<String, HashSet<String>> = HashMap::new();
            let mut stmt =
                conn.prepare("SELECT role_id, service_id FROM role_acl WHERE allow = 1")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let role: String = row_helpers::get(row, 0, "role_acl", "role_id")?;
                let service: String = row_helpers::get(row, 1, "role_acl", "service_id")?;
                grants.entry(role).or_default().insert(service);
            }

            Ok(AclSnapshot { bindings, grants })
        })
    }

    /// Bind a role to a terminal (admin surface).
    pub fn bind_role(&self, terminal: &TerminalId, role: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO role_bindings (terminal_id, role_id) VALUES (?1, ?2)",
                rusqlite::params![terminal.as_str(), role],
            )?;
            Ok(())
        })
    }

    /// Grant or revoke a service for a role.
    pub fn set_grant(&self, role: &str, service: &str, allow: bool) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO role_acl (role_id, service_id, allow) VALUES (?1, ?2, ?3)
                 ON CONFLICT (role_id, service_id) DO UPDATE SET allow = excluded.allow",
                rusqlite::params![role, service, allow],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> AclRepo {
        AclRepo::new(Database::in_memory().unwrap())
    }

    #[test]
    fn unbound_terminal_is_denied() {
        let snapshot = repo().load_snapshot().unwrap();
        assert!(!snapshot.is_allowed(&TerminalId::new("CARD", "D1001"), "ai_recommend"));
    }

    #[test]
    fn bound_role_grant_allows() {
        let repo = repo();
        let terminal = TerminalId::new("CARD", "D1001");
        repo.bind_role(&terminal, "physician").unwrap();
        repo.set_grant("physician", "ai_recommend", true).unwrap();

        let snapshot = repo.load_snapshot().unwrap();
        assert!(snapshot.is_allowed(&terminal, "ai_recommend"));
        assert!(!snapshot.is_allowed(&terminal, "admin_console"));
    }

    #[test]
    fn permission_is_union_across_roles() {
        let repo = repo();
        let terminal = TerminalId::new("CARD", "D1001");
        repo.bind_role(&terminal, "physician").unwrap();
        repo.bind_role(&terminal, "resident").unwrap();
        repo.set_grant("physician", "ai_recommend", true).unwrap();
        repo.set_grant("resident", "patient_data_push", true).unwrap();

        let snapshot = repo.load_snapshot().unwrap();
        assert!(snapshot.is_allowed(&terminal, "ai_recommend"));
        assert!(snapshot.is_allowed(&terminal, "patient_data_push"));
    }

    #[test]
    fn revoked_grant_is_denied_after_reload() {
        let repo = repo();
        let terminal = TerminalId::new("CARD", "D1001");
        repo.bind_role(&terminal, "physician").unwrap();
        repo.set_grant("physician", "ai_recommend", true).unwrap();
        assert!(repo.load_snapshot().unwrap().is_allowed(&terminal, "ai_recommend"));

        repo.set_grant("physician", "ai_recommend", false).unwrap();
        assert!(!repo.load_snapshot().unwrap().is_allowed(&terminal, "ai_recommend"));
    }
}
