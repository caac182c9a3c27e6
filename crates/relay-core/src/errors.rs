use std::time::Duration;

use crate::ids::TerminalId;

/// Typed error hierarchy for the routing fabric.
/// Every variant maps to a wire-visible error code so a terminal can tell a
/// retryable upstream timeout apart from a hard denial.
#[derive(Clone, Debug, thiserror::Error)]
pub enum FabricError {
    #[error("unknown terminal: {0}")]
    UnknownTerminal(TerminalId),
    #[error("duplicate identity: {0} is already registered")]
    DuplicateIdentity(TerminalId),
    #[error("terminal {terminal} is not authorized for service {service}")]
    Unauthorized { terminal: TerminalId, service: String },
    #[error("delivery expired: {0}")]
    DeliveryExpired(String),
    #[error("upstream call timed out after {0:?}")]
    UpstreamTimeout(Duration),
    #[error("upstream error: {0}")]
    UpstreamError(String),
    #[error("trace integrity violation: {0}")]
    TraceIntegrity(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl FabricError {
    /// Wire error code carried in the terminal error envelope.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::UnknownTerminal(_) => "UNKNOWN_TERMINAL",
            Self::DuplicateIdentity(_) => "DUPLICATE_IDENTITY",
            Self::Unauthorized { .. } => "UNAUTHORIZED",
            Self::DeliveryExpired(_) => "DELIVERY_EXPIRED",
            Self::UpstreamTimeout(_) => "UPSTREAM_TIMEOUT",
            Self::UpstreamError(_) => "UPSTREAM_ERROR",
            Self::TraceIntegrity(_) => "TRACE_INTEGRITY",
            Self::Storage(_) => "STORAGE_ERROR",
        }
    }

    /// Whether the originating terminal may sensibly retry the stimulus.
    /// Retries, when they happen, originate client-side.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::UpstreamTimeout(_) | Self::UpstreamError(_) | Self::DeliveryExpired(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_distinct() {
        let errors = [
            FabricError::UnknownTerminal(TerminalId::from_raw("client_A_B")),
            FabricError::DuplicateIdentity(TerminalId::from_raw("client_A_B")),
            FabricError::Unauthorized {
                terminal: TerminalId::from_raw("client_A_B"),
                service: "ai_recommend".into(),
            },
            FabricError::DeliveryExpired("ttl".into()),
            FabricError::UpstreamTimeout(Duration::from_secs(30)),
            FabricError::UpstreamError("502".into()),
            FabricError::TraceIntegrity("orphan span".into()),
            FabricError::Storage("disk full".into()),
        ];
        let mut codes: Vec<&str> = errors.iter().map(|e| e.error_code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn retryable_classification() {
        assert!(FabricError::UpstreamTimeout(Duration::from_secs(30)).is_retryable());
        assert!(FabricError::UpstreamError("boom".into()).is_retryable());
        assert!(FabricError::DeliveryExpired("queue full".into()).is_retryable());
        assert!(!FabricError::Unauthorized {
            terminal: TerminalId::from_raw("client_A_B"),
            service: "ai_recommend".into(),
        }
        .is_retryable());
        assert!(!FabricError::DuplicateIdentity(TerminalId::from_raw("client_A_B")).is_retryable());
    }

    #[test]
    fn timeout_and_upstream_error_are_distinguishable() {
        let timeout = FabricError::UpstreamTimeout(Duration::from_secs(30));
        let error = FabricError::UpstreamError("bad gateway".into());
        assert_ne!(timeout.error_code(), error.error_code());
    }
}
