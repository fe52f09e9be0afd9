use thiserror::Error;

/// Application-wide error types.
///
/// This enum represents the failures that can interrupt a fetch, a parse or a
/// store call in the sync pipeline. It uses the `thiserror` crate for ergonomic
/// error handling and automatic conversion from underlying library errors.
///
/// Data-level problems are not errors: a malformed record or a
/// duplicate identity key is an outcome that gets counted in the sync report,
/// not an error that unwinds the caller.
///
/// # Error Conversion
///
/// - `sqlx::Error` → `AppError::DatabaseError`
/// - `serde_json::Error` → `AppError::SerializationError`
///
/// # Examples
///
/// ```no_run
/// use tallysync_core::error::AppError;
///
/// fn example() -> Result<(), AppError> {
///     Err(AppError::ConfigurationError("TALLY_HOST is empty".to_string()))
/// }
/// ```
#[derive(Error, Debug)]
pub enum AppError {
    /// Required configuration is missing or invalid.
    ///
    /// Fatal for a sync run: it aborts before any entity kind is fetched
    /// and is never retried.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// The Tally endpoint could not be reached or the connection dropped.
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Request timeout.
    ///
    /// This error occurs when a request takes longer than the configured timeout.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Tally answered but rejected the request shape.
    ///
    /// Tally returns HTTP 200 for these, so the marker is detected in the body.
    #[error("Protocol error for '{request}': {message}")]
    ProtocolError { request: String, message: String },

    /// Response body was empty or too short to hold the requested collection.
    #[error("Empty response for '{request}' ({len} bytes)")]
    EmptyResponse { request: String, len: usize },

    /// The response could not be read as XML at all.
    #[error("XML error: {0}")]
    XmlError(String),

    /// A single record could not be written to the store.
    #[error("Write failed for {key}: {message}")]
    WriteFailure { key: String, message: String },

    /// Database operation failed.
    ///
    /// This error wraps all errors from SQLx database operations, including
    /// connection failures, query errors, and constraint violations.
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    /// JSON serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Generic application error for cases not covered by specific variants.
    ///
    /// Use this sparingly - prefer creating specific error variants
    /// for better error handling and debugging.
    #[error("Error: {0}")]
    Generic(String),
}

impl AppError {
    /// Returns a user-friendly error message suitable for CLI output.
    pub fn user_message(&self) -> String {
        match self {
            AppError::DatabaseError(e) => {
                if e.to_string().contains("connection") {
                    "Cannot connect to database. Is PostgreSQL running?\n   Check DATABASE_URL."
                        .to_string()
                } else {
                    format!("Database error: {}", e)
                }
            }
            AppError::ConfigurationError(msg) => {
                format!(
                    "Configuration error: {}\n   Check TALLY_HOST, TALLY_PORT and companies.toml.",
                    msg
                )
            }
            AppError::TransportError(msg) => {
                format!(
                    "Cannot reach Tally: {}\n   Is Tally running with the HTTP server enabled?",
                    msg
                )
            }
            AppError::Timeout(secs) => {
                format!(
                    "Tally did not answer within {} seconds.\n   Large voucher ranges may need a smaller window.",
                    secs
                )
            }
            AppError::ProtocolError { request, message } => {
                if message.contains("SVCurrentCompany") {
                    format!(
                        "Tally rejected '{}': the company is not open in Tally.\n   Open the company and try again.",
                        request
                    )
                } else {
                    format!("Tally rejected '{}': {}", request, message)
                }
            }
            AppError::EmptyResponse { request, .. } => {
                format!(
                    "Tally returned no data for '{}'. The company may have no entries in range.",
                    request
                )
            }
            _ => self.to_string(),
        }
    }

    /// Returns true if this error is retryable.
    ///
    /// # Examples
    ///
    /// ```
    /// use tallysync_core::error::AppError;
    ///
    /// let err = AppError::TransportError("connection refused".to_string());
    /// assert!(err.is_retryable());
    ///
    /// // A rejected request shape will be rejected again
    /// let err = AppError::ProtocolError {
    ///     request: "List of Ledgers".to_string(),
    ///     message: "Unknown Request".to_string(),
    /// };
    /// assert!(!err.is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::TransportError(_) | AppError::Timeout(_))
    }

    /// Returns true if this error must abort a sync run before any fetch.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AppError::ConfigurationError(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AppError::ConfigurationError("missing host".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing host");
    }

    #[test]
    fn test_generic_error() {
        let err = AppError::Generic("Something went wrong".to_string());
        assert_eq!(err.to_string(), "Error: Something went wrong");
    }

    #[test]
    fn test_protocol_error_display() {
        let err = AppError::ProtocolError {
            request: "Day Book".to_string(),
            message: "Unknown Request".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Protocol error for 'Day Book': Unknown Request"
        );
    }

    #[test]
    fn test_empty_response_error() {
        let err = AppError::EmptyResponse {
            request: "List of Ledgers".to_string(),
            len: 3,
        };
        assert_eq!(err.to_string(), "Empty response for 'List of Ledgers' (3 bytes)");
    }

    #[test]
    fn test_user_message_company_not_open() {
        let err = AppError::ProtocolError {
            request: "List of Ledgers".to_string(),
            message: "Could not set 'SVCurrentCompany' to 'Acme'".to_string(),
        };
        assert!(err.user_message().contains("not open in Tally"));
    }

    #[test]
    fn test_error_from_serde() {
        let json = "{ invalid json }";
        let result: Result<serde_json::Value, _> = serde_json::from_str(json);
        let serde_err = result.unwrap_err();
        let app_err: AppError = serde_err.into();
        assert!(matches!(app_err, AppError::SerializationError(_)));
    }

    #[test]
    fn test_user_message_database_connection() {
        let err = AppError::DatabaseError(sqlx::Error::PoolTimedOut);
        let msg = err.user_message();
        assert!(msg.contains("Cannot connect to database") || msg.contains("Database error"));
    }

    #[test]
    fn test_is_retryable() {
        assert!(AppError::TransportError("reset".to_string()).is_retryable());
        assert!(AppError::Timeout(30).is_retryable());
        assert!(!AppError::EmptyResponse {
            request: "x".to_string(),
            len: 0
        }
        .is_retryable());
        assert!(!AppError::ConfigurationError("bad".to_string()).is_retryable());
    }

    #[test]
    fn test_only_configuration_is_fatal() {
        assert!(AppError::ConfigurationError("bad".to_string()).is_fatal());
        assert!(!AppError::Timeout(30).is_fatal());
        assert!(!AppError::XmlError("eof".to_string()).is_fatal());
    }
}
