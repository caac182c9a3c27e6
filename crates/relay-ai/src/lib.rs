pub mod client;
pub mod mock;
pub mod models;

pub use client::HttpRecommendClient;
pub use mock::{MockRecommendClient, MockResponse};
pub use models::UpstreamRequest;

use async_trait::async_trait;
use thiserror::Error;

use relay_core::event::Recommendation;

/// Errors from the recommendation upstream. The overall deadline is enforced
/// by the caller; this layer reports transport and protocol failures.
#[derive(Clone, Debug, Error)]
pub enum AiError {
    #[error("network error: {0}")]
    Network(String),

    #[error("upstream returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("invalid upstream response: {0}")]
    InvalidResponse(String),
}

impl AiError {
    pub fn is_retryable(&self) -> bool {
        match self {
            AiError::Network(_) => true,
            AiError::Http { status, .. } => {
                matches!(status, 408 | 429) || *status >= 500
            }
            AiError::InvalidResponse(_) => false,
        }
    }
}

/// Client for the clinical recommendation upstream.
#[async_trait]
pub trait RecommendClient: Send + Sync {
    fn name(&self) -> &str;

    /// Fetch recommendations for one encounter. Returns the normalized list;
    /// an empty list is a valid outcome.
    async fn recommend(&self, request: &UpstreamRequest) -> Result<Vec<Recommendation>, AiError>;
}
