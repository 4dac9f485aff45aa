use thiserror::Error;

/// The crate's single error taxonomy. Every provider adapter, the
/// provider manager, and the consensus engine all fail into this type.
#[derive(Debug, Error)]
pub enum DuhError {
    #[error("[{provider_id}] authentication failed: {message}")]
    ProviderAuth { provider_id: String, message: String },

    #[error("[{provider_id}] rate limited{}", retry_after.map(|s| format!(" (retry after {s}s)")).unwrap_or_default())]
    ProviderRateLimit {
        provider_id: String,
        retry_after: Option<u64>,
    },

    #[error("[{provider_id}] timed out after {timeout_ms}ms")]
    ProviderTimeout { provider_id: String, timeout_ms: u64 },

    #[error("[{provider_id}] overloaded: {message}")]
    ProviderOverloaded { provider_id: String, message: String },

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("cost limit ${limit:.2} exceeded (current: ${current:.2})")]
    CostLimitExceeded { limit: f64, current: f64 },

    #[error("insufficient models: {0}")]
    InsufficientModels(String),

    #[error("consensus error: {0}")]
    Consensus(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
}

impl DuhError {
    /// Provider identifier carried by variants that name one, if any.
    pub fn provider_id(&self) -> Option<&str> {
        match self {
            Self::ProviderAuth { provider_id, .. }
            | Self::ProviderRateLimit { provider_id, .. }
            | Self::ProviderTimeout { provider_id, .. }
            | Self::ProviderOverloaded { provider_id, .. } => Some(provider_id),
            _ => None,
        }
    }

    /// Whether this error is worth retrying per the backoff policy.
    /// Only transient provider-side conditions qualify; auth, routing,
    /// and consensus/config errors are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ProviderRateLimit { .. } | Self::ProviderTimeout { .. } | Self::ProviderOverloaded { .. }
        )
    }

    /// Server-hinted retry delay, when the error carries one.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::ProviderRateLimit { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Sanitized message safe for returning to an external caller.
    /// Never leaks upstream response bodies or connection internals.
    pub fn user_message(&self) -> String {
        match self {
            Self::ProviderAuth { provider_id, .. } => {
                format!("authentication failed for {provider_id}")
            }
            Self::ProviderRateLimit { provider_id, .. } => {
                format!("rate limited by {provider_id} — try again shortly")
            }
            Self::ProviderTimeout { provider_id, .. } => {
                format!("request to {provider_id} timed out")
            }
            Self::ProviderOverloaded { provider_id, .. } => {
                format!("{provider_id} is overloaded")
            }
            Self::ModelNotFound(model) => format!("model not found: {model}"),
            Self::CostLimitExceeded { limit, current } => {
                format!("cost limit ${limit:.2} exceeded (current: ${current:.2})")
            }
            Self::InsufficientModels(_) => "not enough models available".to_string(),
            Self::Consensus(_) => "consensus protocol error".to_string(),
            Self::Config(_) => "configuration error".to_string(),
            Self::Storage(_) => "storage error".to_string(),
            Self::Request(_) => "request to provider failed".to_string(),
        }
    }
}
