pub mod envelope;
pub mod errors;
pub mod event;
pub mod ids;

pub use envelope::{Envelope, MessageKind};
pub use errors::FabricError;
pub use event::{ClinicalEvent, Recommendation, RecommendRequest, RecommendResponse};
pub use ids::{MessageId, RequestId, RoutingKey, SessionKey, SpanId, TerminalId, TraceId};
