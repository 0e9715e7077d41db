use std::fmt;

/// Unified error type for every fallible boundary in the sync core: remote
/// client calls, state-store access, configuration loading, and webhook
/// request handling. Matches the taxonomy in the spec's error-handling
/// design so executor and worker code can match on variant rather than on
/// message text.
#[derive(Debug, Clone)]
pub enum SyncError {
    /// Transient transport failure; the caller should retry.
    Network(String),
    /// 401/403 from a remote; not retried automatically.
    Unauthorized(String),
    /// The document does not exist on the remote.
    NotFound(String),
    /// The destination rejected the document's shape; not retried.
    Validation(String),
    /// Optimistic-concurrency collision survived the client-level retries.
    TimestampMismatch(String),
    /// Other non-2xx remote response.
    RemoteError(String),
    /// Missing or malformed configuration; fatal to the affected component.
    Configuration(String),
    /// State-store access failed.
    Storage(String),
    /// JSON (de)serialization failed.
    Serialization(String),
    /// Catch-all for conditions that don't fit the above.
    Generic(String),
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::Network(msg) => write!(f, "network error: {}", msg),
            SyncError::Unauthorized(msg) => write!(f, "unauthorized: {}", msg),
            SyncError::NotFound(msg) => write!(f, "not found: {}", msg),
            SyncError::Validation(msg) => write!(f, "validation error: {}", msg),
            SyncError::TimestampMismatch(msg) => write!(f, "timestamp mismatch: {}", msg),
            SyncError::RemoteError(msg) => write!(f, "remote error: {}", msg),
            SyncError::Configuration(msg) => write!(f, "configuration error: {}", msg),
            SyncError::Storage(msg) => write!(f, "storage error: {}", msg),
            SyncError::Serialization(msg) => write!(f, "serialization error: {}", msg),
            SyncError::Generic(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for SyncError {}

impl SyncError {
    /// Transient transport errors are worth retrying; everything else
    /// (auth, validation, configuration) is not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Network(_) | SyncError::RemoteError(_))
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        SyncError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(format!("JSON error: {}", err))
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            SyncError::Network(err.to_string())
        } else {
            SyncError::RemoteError(err.to_string())
        }
    }
}

/// Result type alias used throughout the sync core.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Error context builder, for attaching the operation name and the
/// (doctype, docname) key to a lower-level error before it is logged or
/// returned to a caller.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    operation: String,
    key: Option<String>,
    details: Vec<String>,
}

impl ErrorContext {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            key: None,
            details: Vec::new(),
        }
    }

    pub fn with_key(mut self, doctype: &str, docname: &str) -> Self {
        self.key = Some(format!("{doctype}/{docname}"));
        self
    }

    pub fn with_detail(mut self, detail: &str) -> Self {
        self.details.push(detail.to_string());
        self
    }

    pub fn build(self, error: SyncError) -> SyncError {
        let mut message = format!("{}: {}", self.operation, error);

        if let Some(key) = &self.key {
            message = format!("{} (key: {})", message, key);
        }

        if !self.details.is_empty() {
            message = format!("{} - {}", message, self.details.join(", "));
        }

        match error {
            SyncError::Network(_) => SyncError::Network(message),
            SyncError::Unauthorized(_) => SyncError::Unauthorized(message),
            SyncError::NotFound(_) => SyncError::NotFound(message),
            SyncError::Validation(_) => SyncError::Validation(message),
            SyncError::TimestampMismatch(_) => SyncError::TimestampMismatch(message),
            SyncError::RemoteError(_) => SyncError::RemoteError(message),
            SyncError::Configuration(_) => SyncError::Configuration(message),
            SyncError::Storage(_) => SyncError::Storage(message),
            SyncError::Serialization(_) => SyncError::Serialization(message),
            SyncError::Generic(_) => SyncError::Generic(message),
        }
    }
}

/// Macro for adding operation/key context to an error at a call site.
#[macro_export]
macro_rules! error_context {
    ($operation:expr, $doctype:expr, $docname:expr, $error:expr) => {
        $crate::error::ErrorContext::new($operation)
            .with_key($doctype, $docname)
            .build($error)
    };
    ($operation:expr, $error:expr) => {
        $crate::error::ErrorContext::new($operation).build($error)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification_matches_transient_transport_errors() {
        assert!(SyncError::Network("timeout".into()).is_retryable());
        assert!(SyncError::RemoteError("502".into()).is_retryable());
        assert!(!SyncError::Unauthorized("bad key".into()).is_retryable());
        assert!(!SyncError::Validation("bad field".into()).is_retryable());
    }

    #[test]
    fn error_context_annotates_operation_and_key() {
        let err = ErrorContext::new("sync_one")
            .with_key("Customer", "C1")
            .build(SyncError::Network("connection refused".into()));

        assert!(matches!(err, SyncError::Network(_)));
        assert!(err.to_string().contains("sync_one"));
        assert!(err.to_string().contains("Customer/C1"));
    }

    #[test]
    fn sqlx_errors_map_to_storage_variant() {
        let err: SyncError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, SyncError::Storage(_)));
    }
}
