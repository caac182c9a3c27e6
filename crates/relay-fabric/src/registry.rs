use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use relay_core::envelope::Envelope;
use relay_core::errors::FabricError;
use relay_core::ids::TerminalId;

use crate::config::FabricConfig;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Liveness state of a terminal connection.
///
/// New -> Connected on registration; Connected -> Idle after one missed
/// heartbeat interval; Idle -> Connected on heartbeat; Idle -> Disconnected
/// after the consecutive-miss threshold; any state -> Disconnected on
/// explicit disconnect.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalState {
    New,
    Connected,
    Idle,
    Disconnected,
}

/// Registry entry for one terminal. Owned exclusively by the registry; the
/// outbound sender is a non-owning handle to the socket writer task.
pub struct Terminal {
    pub id: TerminalId,
    pub clinician: String,
    pub department: String,
    pub remote_addr: Option<String>,
    pub state: TerminalState,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    last_seen: Instant,
    missed: u32,
    tx: mpsc::Sender<Envelope>,
}

/// Point-in-time view of a terminal, for the admin surface.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalSnapshot {
    pub id: TerminalId,
    pub clinician: String,
    pub department: String,
    pub remote_addr: Option<String>,
    pub state: TerminalState,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub missed_intervals: u32,
}

/// Lifecycle notifications consumed by the router (queue flush/drop) and the
/// trace recorder (force-close pending delivery spans).
#[derive(Clone, Debug)]
pub enum RegistryEvent {
    Connected(TerminalId),
    Disconnected { terminal: TerminalId, reason: String },
}

/// In-memory source of truth for terminal liveness.
pub struct ConnectionRegistry {
    terminals: DashMap<TerminalId, Arc<Mutex<Terminal>>>,
    events: broadcast::Sender<RegistryEvent>,
    config: FabricConfig,
}

impl ConnectionRegistry {
    pub fn new(config: FabricConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            terminals: DashMap::new(),
            events,
            config,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Register a terminal after its handshake. Fails with DuplicateIdentity
    /// when a live entry (Connected or Idle) already holds the identity; a
    /// Disconnected entry is replaced, which is the re-handshake path.
    #[instrument(skip(self, tx), fields(terminal_id = %id))]
    pub fn register(
        &self,
        id: &TerminalId,
        clinician: &str,
        department: &str,
        remote_addr: Option<String>,
        tx: mpsc::Sender<Envelope>,
    ) -> Result<(), FabricError> {
        if let Some(existing) = self.terminals.get(id) {
            let state = existing.lock().state;
            if matches!(state, TerminalState::Connected | TerminalState::Idle) {
                warn!("registration rejected: identity already live");
                return Err(FabricError::DuplicateIdentity(id.clone()));
            }
        }

        let now = Utc::now();
        let mut terminal = Terminal {
            id: id.clone(),
            clinician: clinician.to_string(),
            department: department.to_string(),
            remote_addr,
            state: TerminalState::New,
            connected_at: now,
            last_heartbeat: now,
            last_seen: Instant::now(),
            missed: 0,
            tx,
        };
        terminal.state = TerminalState::Connected;
        self.terminals.insert(id.clone(), Arc::new(Mutex::new(terminal)));

        info!("terminal registered");
        let _ = self.events.send(RegistryEvent::Connected(id.clone()));
        Ok(())
    }

    /// Record a heartbeat: resets the miss counter and revives an Idle entry.
    #[instrument(skip(self), fields(terminal_id = %id))]
    pub fn heartbeat(&self, id: &TerminalId) -> Result<(), FabricError> {
        let entry = self
            .terminals
            .get(id)
            .ok_or_else(|| FabricError::UnknownTerminal(id.clone()))?;
        let mut terminal = entry.lock();
        if terminal.state == TerminalState::Disconnected {
            return Err(FabricError::UnknownTerminal(id.clone()));
        }
        terminal.last_heartbeat = Utc::now();
        terminal.last_seen = Instant::now();
        terminal.missed = 0;
        if terminal.state == TerminalState::Idle {
            debug!("terminal revived by heartbeat");
            terminal.state = TerminalState::Connected;
        }
        Ok(())
    }

    /// Mark a terminal Disconnected and notify subscribers.
    #[instrument(skip(self), fields(terminal_id = %id, reason))]
    pub fn disconnect(&self, id: &TerminalId, reason: &str) {
        let Some(entry) = self.terminals.get(id) else {
            return;
        };
        let mut terminal = entry.lock();
        if terminal.state == TerminalState::Disconnected {
            return;
        }
        terminal.state = TerminalState::Disconnected;
        drop(terminal);
        info!("terminal disconnected");
        let _ = self.events.send(RegistryEvent::Disconnected {
            terminal: id.clone(),
            reason: reason.to_string(),
        });
    }

    /// Outbound channel for a live terminal. None when the terminal is
    /// unknown or Disconnected; an Idle socket is still writable.
    pub fn sender(&self, id: &TerminalId) -> Option<mpsc::Sender<Envelope>> {
        let entry = self.terminals.get(id)?;
        let terminal = entry.lock();
        match terminal.state {
            TerminalState::Connected | TerminalState::Idle => Some(terminal.tx.clone()),
            _ => None,
        }
    }

    pub fn state(&self, id: &TerminalId) -> Option<TerminalState> {
        self.terminals.get(id).map(|e| e.lock().state)
    }

    pub fn snapshot(&self, id: &TerminalId) -> Option<TerminalSnapshot> {
        self.terminals.get(id).map(|e| snapshot_of(&e.lock()))
    }

    /// All live terminals, for the admin surface.
    pub fn live_terminals(&self) -> Vec<TerminalSnapshot> {
        self.terminals
            .iter()
            .filter_map(|entry| {
                let terminal = entry.lock();
                match terminal.state {
                    TerminalState::Connected | TerminalState::Idle => Some(snapshot_of(&terminal)),
                    _ => None,
                }
            })
            .collect()
    }

    /// One liveness pass: Connected terminals that missed an interval turn
    /// Idle; Idle terminals past the miss threshold are disconnected.
    /// Entries written off on a previous pass are reaped first, so the map
    /// only tracks identities that are live or freshly lost.
    pub fn sweep(&self) {
        self.terminals
            .retain(|_, entry| entry.lock().state != TerminalState::Disconnected);

        let mut lost: Vec<TerminalId> = Vec::new();

        for entry in self.terminals.iter() {
            let mut terminal = entry.lock();
            if matches!(
                terminal.state,
                TerminalState::New | TerminalState::Disconnected
            ) {
                continue;
            }

            let elapsed = terminal.last_seen.elapsed();
            let intervals =
                (elapsed.as_millis() / self.config.heartbeat_interval.as_millis().max(1)) as u32;
            terminal.missed = intervals;

            if intervals >= self.config.miss_threshold {
                terminal.state = TerminalState::Disconnected;
                lost.push(terminal.id.clone());
            } else if intervals >= 1 && terminal.state == TerminalState::Connected {
                debug!(terminal_id = %terminal.id, intervals, "terminal idle");
                terminal.state = TerminalState::Idle;
            }
        }

        for id in lost {
            warn!(terminal_id = %id, "terminal lost: heartbeat threshold exceeded");
            let _ = self.events.send(RegistryEvent::Disconnected {
                terminal: id,
                reason: "heartbeat_timeout".to_string(),
            });
        }
    }

    /// Spawn the periodic liveness sweep.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(registry.config.sweep_period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                registry.sweep();
            }
        })
    }
}

fn snapshot_of(terminal: &Terminal) -> TerminalSnapshot {
    TerminalSnapshot {
        id: terminal.id.clone(),
        clinician: terminal.clinician.clone(),
        department: terminal.department.clone(),
        remote_addr: terminal.remote_addr.clone(),
        state: terminal.state,
        connected_at: terminal.connected_at,
        last_heartbeat: terminal.last_heartbeat,
        missed_intervals: terminal.missed,
    }
}
