use thiserror::Error;

/// Main error type for the storch framework
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorchError {
    /// Shape-related errors, including plate/axis mismatches on reduction
    #[error("Shape error: {0}")]
    ShapeError(String),

    /// Precondition violations on user-supplied values
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Calls made from inside a tracing scope that forbids them
    #[error("Invalid context: {0}")]
    InvalidContext(String),

    /// Invalid state errors (e.g. backward through a released graph)
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Unsupported operation errors
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Operation errors with context
    #[error("Operation error: {operation} - {message}")]
    OperationError {
        operation: String,
        message: String,
    },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// IO errors
    #[error("IO error: {0}")]
    IoError(String),

    /// Internal errors that shouldn't happen
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl StorchError {
    /// Create a shape error with an optional suggestion
    pub fn shape_error(expected: &str, got: &str, suggestion: Option<&str>) -> Self {
        let message = if let Some(sugg) = suggestion {
            format!("Expected {}, got {}. Suggestion: {}", expected, got, sugg)
        } else {
            format!("Expected {}, got {}", expected, got)
        };
        StorchError::ShapeError(message)
    }

    /// Create an operation error with context
    pub fn operation_error(operation: &str, message: &str) -> Self {
        StorchError::OperationError {
            operation: operation.to_string(),
            message: message.to_string(),
        }
    }
}

impl From<std::io::Error> for StorchError {
    fn from(err: std::io::Error) -> Self {
        StorchError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for StorchError {
    fn from(err: serde_json::Error) -> Self {
        StorchError::SerializationError(err.to_string())
    }
}

/// Result type for storch operations
pub type StorchResult<T> = Result<T, StorchError>;

/// Error codes for programmatic error handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ShapeMismatch,
    InvalidValue,
    InvalidContext,
    InvalidState,
    Unsupported,
    ConfigInvalid,
    SerializationFailed,
    InternalError,
}

impl StorchError {
    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            StorchError::ShapeError(_) => ErrorCode::ShapeMismatch,
            StorchError::InvalidInput(_) => ErrorCode::InvalidValue,
            StorchError::InvalidContext(_) => ErrorCode::InvalidContext,
            StorchError::InvalidState(_) => ErrorCode::InvalidState,
            StorchError::UnsupportedOperation(_) => ErrorCode::Unsupported,
            StorchError::OperationError { .. } => ErrorCode::InvalidValue,
            StorchError::ConfigurationError(_) => ErrorCode::ConfigInvalid,
            StorchError::SerializationError(_) => ErrorCode::SerializationFailed,
            StorchError::IoError(_) => ErrorCode::SerializationFailed,
            StorchError::InternalError(_) => ErrorCode::InternalError,
        }
    }

    /// Precondition violations: the caller passed something the contract forbids
    pub fn is_precondition_violation(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::ShapeMismatch | ErrorCode::InvalidValue | ErrorCode::InvalidContext
        )
    }
}
