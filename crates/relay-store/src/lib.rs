pub mod acl;
pub mod database;
pub mod error;
pub mod row_helpers;
pub mod schema;
pub mod service_calls;
pub mod sessions;
pub mod terminals;
pub mod traces;

pub use acl::{AclRepo, AclSnapshot};
pub use database::Database;
pub use error::StoreError;
pub use service_calls::{ServiceCallRecord, ServiceCallRepo};
pub use sessions::{SessionRepo, SessionRow, SessionStatus};
pub use terminals::TerminalRepo;
pub use traces::{build_span_tree, SpanNode, SpanRow, SpanStatus, TraceRepo, TraceRow, TraceStatus};
