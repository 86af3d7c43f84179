//! Error taxonomy shared by the registry, dispatcher and recorder.

use thiserror::Error;

/// Errors surfaced by the orchestration core.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A user-correctable problem with a submitted field.
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("provider '{0}' is not registered")]
    ProviderNotFound(String),

    /// Another run already holds the provider key. Retry later.
    #[error("provider {key} is busy")]
    ProviderBusy { key: String },

    #[error("provider {key} timed out after {secs}s")]
    ProviderTimeout { key: String, secs: u64 },

    #[error("provider {key} failed: {reason}")]
    ProviderFailure { key: String, reason: String },

    #[error("persistence error: {0}")]
    Persistence(String),
}

impl CoreError {
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Stable snake_case code used in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation_error",
            Self::InvalidCronExpression { .. } => "invalid_cron_expression",
            Self::NotFound { .. } => "not_found",
            Self::ProviderNotFound(_) => "provider_not_found",
            Self::ProviderBusy { .. } => "provider_busy",
            Self::ProviderTimeout { .. } => "provider_timeout",
            Self::ProviderFailure { .. } => "provider_failure",
            Self::Persistence(_) => "persistence_error",
        }
    }

    /// The offending field for validation failures.
    pub fn field(&self) -> Option<&'static str> {
        match self {
            Self::Validation { field, .. } => Some(field),
            Self::InvalidCronExpression { .. } => Some("cron_expression"),
            _ => None,
        }
    }

    /// Cron failures are a subset of validation failures.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. } | Self::InvalidCronExpression { .. }
        )
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ProviderBusy { .. }
                | Self::ProviderTimeout { .. }
                | Self::ProviderFailure { .. }
                | Self::Persistence(_)
        )
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Persistence(e.to_string())
    }
}

impl From<r2d2::Error> for CoreError {
    fn from(e: r2d2::Error) -> Self {
        Self::Persistence(format!("connection pool: {e}"))
    }
}

impl From<tokio::task::JoinError> for CoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Persistence(format!("storage task aborted: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cron_error_is_validation() {
        let err = CoreError::InvalidCronExpression {
            expression: "* *".into(),
            reason: "expected 5 fields".into(),
        };
        assert!(err.is_validation());
        assert_eq!(err.field(), Some("cron_expression"));
        assert_eq!(err.kind(), "invalid_cron_expression");
    }

    #[test]
    fn test_busy_is_retryable_not_found_is_not() {
        assert!(CoreError::ProviderBusy { key: "iperf3".into() }.is_retryable());
        assert!(!CoreError::not_found("schedule", "x").is_retryable());
        assert_eq!(
            CoreError::not_found("schedule", "abc").to_string(),
            "schedule 'abc' not found"
        );
    }
}
