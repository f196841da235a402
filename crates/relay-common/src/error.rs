pub type PlaneResult<T> = std::result::Result<T, PlaneError>;

/// Error taxonomy surfaced by the event plane.
///
/// Kind names are stable: they tag the `errors.total` counter and map onto
/// transport-level error codes in the façade.
#[derive(thiserror::Error, Debug)]
pub enum PlaneError {
    #[error("unauthorized: no principal")]
    Unauthorized,
    #[error("access denied: topic={topic}")]
    AccessDenied { topic: String },
    #[error("rate limited, retry in {reset_after_secs}s")]
    RateLimited { reset_after_secs: u64 },
    #[error("invalid {field}: {reason}")]
    InvalidInput {
        field: &'static str,
        reason: String,
    },
    #[error("payload exceeds {max_bytes} bytes")]
    PayloadTooLarge { max_bytes: usize },
    #[error("store unavailable")]
    StoreUnavailable,
    #[error("internal error: {0}")]
    Internal(String),
}

impl PlaneError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            field,
            reason: reason.into(),
        }
    }

    /// Stable tag for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::AccessDenied { .. } => "access_denied",
            Self::RateLimited { .. } => "rate_limited",
            Self::InvalidInput { .. } => "invalid_input",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::StoreUnavailable => "store_unavailable",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether the caller may retry the same request unchanged.
    pub fn retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable)
    }
}
