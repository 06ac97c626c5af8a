// Error handling shared across the gateway workspace.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ServiceError>;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ServiceError::Database(_) | ServiceError::Io(_))
    }

    pub fn status_code(&self) -> u16 {
        match self {
            ServiceError::Validation(_) => 400,
            ServiceError::NotFound(_) => 404,
            ServiceError::Conflict(_) => 409,
            _ => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            ServiceError::Validation("bad".to_string()).status_code(),
            400
        );
        assert_eq!(
            ServiceError::NotFound("tenant".to_string()).status_code(),
            404
        );
        assert_eq!(
            ServiceError::Conflict("domain".to_string()).status_code(),
            409
        );
        assert_eq!(
            ServiceError::Internal("boom".to_string()).status_code(),
            500
        );
    }

    #[test]
    fn test_error_retryable() {
        assert!(!ServiceError::Validation("bad".to_string()).is_retryable());
        assert!(!ServiceError::Configuration("bad".to_string()).is_retryable());
    }
}
