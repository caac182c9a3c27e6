pub mod push;
pub mod server;
pub mod terminal;

pub use server::{build_router, start, AppState, ServerConfig, ServerError, ServerHandle};
