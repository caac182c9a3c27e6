use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::FabricError;
use crate::ids::MessageId;

/// Kinds of messages carried over the persistent terminal connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Heartbeat,
    PatientData,
    AiRecommendRequest,
    AiRecommendation,
    Ack,
    Error,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Heartbeat => "heartbeat",
            Self::PatientData => "patient_data",
            Self::AiRecommendRequest => "ai_recommend_request",
            Self::AiRecommendation => "ai_recommendation",
            Self::Ack => "ack",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Protocol envelope delivered over the terminal connection.
/// The payload is an opaque blob to the fabric; only routing-relevant fields
/// are ever inspected, and only at the boundary.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub id: MessageId,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl Envelope {
    pub fn new(kind: MessageKind, data: serde_json::Value) -> Self {
        Self {
            kind,
            id: MessageId::new(),
            timestamp: Utc::now(),
            data,
        }
    }

    pub fn heartbeat() -> Self {
        Self::new(MessageKind::Heartbeat, serde_json::json!({ "status": "alive" }))
    }

    /// Coded error envelope surfaced to the terminal.
    pub fn error(code: &str, message: &str, details: Option<&str>) -> Self {
        Self::new(
            MessageKind::Error,
            serde_json::json!({
                "errorCode": code,
                "errorMessage": message,
                "details": details,
            }),
        )
    }

    pub fn from_fabric_error(err: &FabricError) -> Self {
        Self::error(err.error_code(), &err.to_string(), None)
    }
}
