//! Error types for Shoots

use std::fmt;

/// Result type alias for Shoots operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Shoots
#[derive(Debug)]
pub enum Error {
    /// Payload missing fields or carrying invalid values
    MalformedRequest(String),
    /// Bucket or dataset absent
    NotFound(String),
    /// Schema mismatch or a resample rule that does not fit the data
    Validation(String),
    /// Unknown action type
    UnsupportedAction(String),
    /// Filter or SQL statement rejected by the query layer
    Query(String),
    /// Non-empty bucket delete, or a write that would clobber an existing dataset
    Conflict(String),
    /// Missing or invalid credentials
    Unauthenticated(String),
    /// Configuration errors
    Config(String),
    /// Internal error
    Internal(String),
    /// Arrow-related errors
    Arrow(arrow::error::ArrowError),
    /// Parquet-related errors
    Parquet(parquet::errors::ParquetError),
    /// DataFusion errors
    DataFusion(datafusion::error::DataFusionError),
    /// IO errors
    Io(std::io::Error),
    /// Serialization errors
    Serialization(String),
}

/// The taxonomy every error collapses onto when it leaves the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    MalformedRequest,
    NotFound,
    Validation,
    UnsupportedAction,
    Query,
    Conflict,
    Unauthenticated,
    Config,
    Internal,
}

impl ErrorKind {
    /// Stable name carried in error details on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MalformedRequest => "MalformedRequestError",
            ErrorKind::NotFound => "NotFoundError",
            ErrorKind::Validation => "ValidationError",
            ErrorKind::UnsupportedAction => "UnsupportedActionError",
            ErrorKind::Query => "QueryError",
            ErrorKind::Conflict => "ConflictError",
            ErrorKind::Unauthenticated => "UnauthenticatedError",
            ErrorKind::Config => "ConfigError",
            ErrorKind::Internal => "InternalError",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let kind = match value {
            "MalformedRequestError" => ErrorKind::MalformedRequest,
            "NotFoundError" => ErrorKind::NotFound,
            "ValidationError" => ErrorKind::Validation,
            "UnsupportedActionError" => ErrorKind::UnsupportedAction,
            "QueryError" => ErrorKind::Query,
            "ConflictError" => ErrorKind::Conflict,
            "UnauthenticatedError" => ErrorKind::Unauthenticated,
            "ConfigError" => ErrorKind::Config,
            "InternalError" => ErrorKind::Internal,
            _ => return None,
        };
        Some(kind)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Classify this error onto the service taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MalformedRequest(_) => ErrorKind::MalformedRequest,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Validation(_) => ErrorKind::Validation,
            Error::UnsupportedAction(_) => ErrorKind::UnsupportedAction,
            Error::Query(_) => ErrorKind::Query,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::Unauthenticated(_) => ErrorKind::Unauthenticated,
            Error::Config(_) => ErrorKind::Config,
            Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            Error::Internal(_)
            | Error::Arrow(_)
            | Error::Parquet(_)
            | Error::DataFusion(_)
            | Error::Io(_)
            | Error::Serialization(_) => ErrorKind::Internal,
        }
    }

    /// Rebuild an error from a kind and message, e.g. after crossing the wire.
    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::MalformedRequest => Error::MalformedRequest(message),
            ErrorKind::NotFound => Error::NotFound(message),
            ErrorKind::Validation => Error::Validation(message),
            ErrorKind::UnsupportedAction => Error::UnsupportedAction(message),
            ErrorKind::Query => Error::Query(message),
            ErrorKind::Conflict => Error::Conflict(message),
            ErrorKind::Unauthenticated => Error::Unauthenticated(message),
            ErrorKind::Config => Error::Config(message),
            ErrorKind::Internal => Error::Internal(message),
        }
    }

    /// Message without the kind prefix.
    pub fn message(&self) -> String {
        match self {
            Error::MalformedRequest(msg)
            | Error::NotFound(msg)
            | Error::Validation(msg)
            | Error::UnsupportedAction(msg)
            | Error::Query(msg)
            | Error::Conflict(msg)
            | Error::Unauthenticated(msg)
            | Error::Config(msg)
            | Error::Internal(msg)
            | Error::Serialization(msg) => msg.clone(),
            Error::Arrow(e) => e.to_string(),
            Error::Parquet(e) => e.to_string(),
            Error::DataFusion(e) => e.to_string(),
            Error::Io(e) => e.to_string(),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Arrow(e) => Some(e),
            Error::Parquet(e) => Some(e),
            Error::DataFusion(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::MalformedRequest(msg) => write!(f, "Malformed request: {}", msg),
            Error::NotFound(msg) => write!(f, "Not found: {}", msg),
            Error::Validation(msg) => write!(f, "Validation error: {}", msg),
            Error::UnsupportedAction(action) => write!(f, "Unsupported action: {}", action),
            Error::Query(msg) => write!(f, "Query error: {}", msg),
            Error::Conflict(msg) => write!(f, "Conflict: {}", msg),
            Error::Unauthenticated(msg) => write!(f, "Unauthenticated: {}", msg),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
            Error::Arrow(e) => write!(f, "Arrow error: {}", e),
            Error::Parquet(e) => write!(f, "Parquet error: {}", e),
            Error::DataFusion(e) => write!(f, "DataFusion error: {}", e),
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
        }
    }
}

impl From<arrow::error::ArrowError> for Error {
    fn from(e: arrow::error::ArrowError) -> Self {
        Error::Arrow(e)
    }
}

impl From<parquet::errors::ParquetError> for Error {
    fn from(e: parquet::errors::ParquetError) -> Self {
        Error::Parquet(e)
    }
}

impl From<datafusion::error::DataFusionError> for Error {
    fn from(e: datafusion::error::DataFusionError) -> Self {
        use datafusion::error::DataFusionError;

        // Planning failures mean the caller's statement is at fault.
        match e.find_root() {
            DataFusionError::SQL(..)
            | DataFusionError::Plan(_)
            | DataFusionError::SchemaError(..)
            | DataFusionError::NotImplemented(_) => Error::Query(e.to_string()),
            // The dataset was removed between lookup and scan.
            DataFusionError::ObjectStore(object_store::Error::NotFound { .. }) => {
                Error::NotFound(e.to_string())
            }
            DataFusionError::IoError(io) if io.kind() == std::io::ErrorKind::NotFound => {
                Error::NotFound(e.to_string())
            }
            _ => Error::DataFusion(e),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_not_found_classifies_as_not_found() {
        let err = Error::from(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = Error::from(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope"));
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn kind_names_round_trip() {
        for kind in [
            ErrorKind::MalformedRequest,
            ErrorKind::NotFound,
            ErrorKind::Validation,
            ErrorKind::UnsupportedAction,
            ErrorKind::Query,
            ErrorKind::Conflict,
            ErrorKind::Unauthenticated,
            ErrorKind::Config,
            ErrorKind::Internal,
        ] {
            assert_eq!(ErrorKind::parse(kind.as_str()), Some(kind));
            assert_eq!(Error::from_kind(kind, "x").kind(), kind);
        }
        assert_eq!(ErrorKind::parse("Nope"), None);
    }

    #[test]
    fn plan_errors_become_query_errors() {
        let err = Error::from(datafusion::error::DataFusionError::Plan(
            "No field named nope".to_string(),
        ));
        assert_eq!(err.kind(), ErrorKind::Query);

        let err = Error::from(datafusion::error::DataFusionError::Execution(
            "disk on fire".to_string(),
        ));
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn missing_object_becomes_not_found() {
        use datafusion::error::DataFusionError;

        let missing = object_store::Error::NotFound {
            path: "b/gone.parquet".to_string(),
            source: Box::new(std::io::Error::new(std::io::ErrorKind::NotFound, "gone")),
        };
        let err = Error::from(DataFusionError::Context(
            "scan".to_string(),
            Box::new(DataFusionError::ObjectStore(missing)),
        ));
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.message().contains("gone.parquet"));
    }
}
