use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, instrument, warn};

use relay_core::errors::FabricError;
use relay_core::ids::TerminalId;
use relay_store::acl::{AclRepo, AclSnapshot};
use relay_store::error::StoreError;

/// Role-based gate consulted before any forward. Evaluation reads an
/// immutable snapshot behind a short RwLock; refresh loads a fresh snapshot
/// and swaps it whole, so the lock is never held across a suspension point.
pub struct AuthorizationGate {
    repo: AclRepo,
    snapshot: RwLock<Arc<AclSnapshot>>,
}

impl AuthorizationGate {
    /// Build the gate with an initial snapshot from the store.
    pub fn new(repo: AclRepo) -> Result<Self, StoreError> {
        let snapshot = repo.load_snapshot()?;
        Ok(Self {
            repo,
            snapshot: RwLock::new(Arc::new(snapshot)),
        })
    }

    /// Check a (terminal, service) pair against the current snapshot.
    /// Permission is the union across the terminal's bound roles; a terminal
    /// with no roles is denied.
    #[instrument(skip(self), fields(terminal_id = %terminal, service_id = service))]
    pub fn authorize(&self, terminal: &TerminalId, service: &str) -> Result<(), FabricError> {
        let snapshot = Arc::clone(&self.snapshot.read());
        if snapshot.is_allowed(terminal, service) {
            Ok(())
        } else {
            debug!("authorization denied");
            Err(FabricError::Unauthorized {
                terminal: terminal.clone(),
                service: service.to_string(),
            })
        }
    }

    /// Reload the snapshot from the store and swap it in.
    pub fn refresh(&self) -> Result<(), StoreError> {
        let fresh = self.repo.load_snapshot()?;
        *self.snapshot.write() = Arc::new(fresh);
        Ok(())
    }

    /// Spawn the periodic snapshot refresh.
    pub fn spawn_refresher(
        self: &Arc<Self>,
        interval: std::time::Duration,
    ) -> tokio::task::JoinHandle<()> {
        let gate = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = gate.refresh() {
                    warn!(error = %e, "acl snapshot refresh failed; keeping previous snapshot");
                }
            }
        })
    }
}
