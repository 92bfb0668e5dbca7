use thiserror::Error;

/// Error taxonomy shared by the platform services.
///
/// Validation problems carry every violated rule at once so an operator
/// sees the full picture in a single response. Provider failures keep the
/// upstream code/message verbatim and are the only class eligible for
/// automatic retry. Configuration problems fail the operation outright.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    ValidationError(#[from] validator::ValidationErrors),

    #[error("Claim ineligible: {}", .0.join("; "))]
    Ineligible(Vec<String>),

    #[error("Bad request: {0}")]
    BadRequest(anyhow::Error),

    #[error("Not found: {0}")]
    NotFound(anyhow::Error),

    #[error("Conflict: {0}")]
    Conflict(anyhow::Error),

    #[error("Payment provider error [{code}]: {message}")]
    Provider { code: String, message: String },

    #[error("Configuration error: {0}")]
    Configuration(anyhow::Error),

    #[error("Database error: {0}")]
    DatabaseError(anyhow::Error),

    #[error("Internal error: {0}")]
    InternalError(#[from] anyhow::Error),
}

impl AppError {
    /// Provider-side failures are retriable; everything else is not.
    pub fn is_retriable(&self) -> bool {
        matches!(self, AppError::Provider { .. })
    }

    pub fn provider<C: Into<String>, M: Into<String>>(code: C, message: M) -> Self {
        AppError::Provider {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Configuration(anyhow::Error::new(err))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::DatabaseError(anyhow::Error::new(err))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(anyhow::Error::new(err))
    }
}
