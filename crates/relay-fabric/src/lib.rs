pub mod auth;
pub mod config;
pub mod orchestrator;
pub mod registry;
pub mod router;
pub mod session;
pub mod trace;

pub use auth::AuthorizationGate;
pub use config::FabricConfig;
pub use orchestrator::AiOrchestrator;
pub use registry::{ConnectionRegistry, RegistryEvent, TerminalSnapshot, TerminalState};
pub use router::{DeliveryOutcome, MessageRouter};
pub use session::SessionManager;
pub use trace::TraceRecorder;

use relay_core::errors::FabricError;
use relay_store::error::StoreError;

/// Map a store failure into the fabric taxonomy.
pub(crate) fn store_err(e: StoreError) -> FabricError {
    FabricError::Storage(e.to_string())
}
