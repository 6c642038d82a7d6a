//! Directory error types
//!
//! Error definitions grouped by kind, with transient classification for the
//! single reconnect-and-retry and a mapping from LDAP result codes.

use std::fmt;

use thiserror::Error;

/// Error that can occur while querying or writing to the directory.
#[derive(Debug, Error)]
pub enum DirectoryError {
    // Lookup errors
    /// Target entry or search base does not exist.
    #[error("no such entry: {dn}")]
    NotFound { dn: String },

    /// A lookup expecting exactly one entry matched several.
    #[error("{count} entries matched a lookup expecting exactly one")]
    MultipleObjectsReturned { count: usize },

    // Query errors
    /// Predicate uses a field, lookup or shape the directory cannot express.
    #[error("invalid query: {message}")]
    InvalidQuery { message: String },

    // Connection errors (transient)
    /// Failed to establish or keep the directory session.
    #[error("connection failed: {message}")]
    ConnectionFailed {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A directory operation exceeded its configured timeout.
    #[error("directory operation timed out after {timeout_secs} seconds")]
    Timeout { timeout_secs: u64 },

    /// The server kept returning continuation cookies past the page ceiling.
    #[error("paged search exceeded {max_pages} pages")]
    PageLimitExceeded { max_pages: u32 },

    // Authentication errors (permanent)
    /// Bind credentials were rejected.
    #[error("authentication failed: invalid credentials for {bind_dn}")]
    AuthenticationFailed { bind_dn: String },

    /// The bound identity may not perform the operation.
    #[error("insufficient access rights: {message}")]
    InsufficientAccess { message: String },

    // Server-side rejections
    /// Uniqueness or schema constraint violated (e.g. entry already exists).
    #[error("integrity error on {dn}: {message}")]
    Integrity { dn: String, message: String },

    /// A value was rejected because of its syntax.
    #[error("invalid value for {dn}: {message}")]
    Data { dn: String, message: String },

    /// Malformed filter, unknown attribute or other request the server refused.
    #[error("protocol error (result code {code}): {message}")]
    Protocol { code: u32, message: String },

    // Client-side errors
    /// A value does not match the field's declared type.
    #[error("field '{field}' expects {expected}, got {found}")]
    TypeMismatch {
        field: String,
        expected: &'static str,
        found: &'static str,
    },

    /// Configuration is invalid.
    #[error("invalid configuration: {message}")]
    InvalidConfiguration { message: String },
}

/// Coarse error category shared by all [`DirectoryError`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    InvalidQuery,
    Connection,
    Authentication,
    Integrity,
    Data,
    Protocol,
    Type,
    Configuration,
}

impl ErrorKind {
    /// Get the string representation of the kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidQuery => "invalid_query",
            ErrorKind::Connection => "connection",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Integrity => "integrity",
            ErrorKind::Data => "data",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Type => "type",
            ErrorKind::Configuration => "configuration",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// LDAP result codes (RFC 4511 appendix A) that get a dedicated mapping.
const RC_TIME_LIMIT_EXCEEDED: u32 = 3;
const RC_STRONGER_AUTH_REQUIRED: u32 = 8;
const RC_CONSTRAINT_VIOLATION: u32 = 19;
const RC_ATTRIBUTE_OR_VALUE_EXISTS: u32 = 20;
const RC_INVALID_ATTRIBUTE_SYNTAX: u32 = 21;
const RC_NO_SUCH_OBJECT: u32 = 32;
const RC_INAPPROPRIATE_AUTHENTICATION: u32 = 48;
const RC_INVALID_CREDENTIALS: u32 = 49;
const RC_INSUFFICIENT_ACCESS_RIGHTS: u32 = 50;
const RC_BUSY: u32 = 51;
const RC_UNAVAILABLE: u32 = 52;
const RC_OBJECT_CLASS_VIOLATION: u32 = 65;
const RC_NOT_ALLOWED_ON_NON_LEAF: u32 = 66;
const RC_NOT_ALLOWED_ON_RDN: u32 = 67;
const RC_ENTRY_ALREADY_EXISTS: u32 = 68;

impl DirectoryError {
    /// Map a non-zero LDAP result code to the error taxonomy.
    ///
    /// `target` is the DN the operation addressed (or the bind DN for binds).
    pub fn from_result_code(code: u32, text: &str, target: &str) -> Self {
        let message = if text.is_empty() {
            format!("result code {code}")
        } else {
            text.to_string()
        };

        match code {
            RC_NO_SUCH_OBJECT => DirectoryError::NotFound {
                dn: target.to_string(),
            },
            RC_INVALID_CREDENTIALS | RC_INAPPROPRIATE_AUTHENTICATION | RC_STRONGER_AUTH_REQUIRED => {
                DirectoryError::AuthenticationFailed {
                    bind_dn: target.to_string(),
                }
            }
            RC_INSUFFICIENT_ACCESS_RIGHTS => DirectoryError::InsufficientAccess { message },
            RC_ENTRY_ALREADY_EXISTS
            | RC_CONSTRAINT_VIOLATION
            | RC_ATTRIBUTE_OR_VALUE_EXISTS
            | RC_OBJECT_CLASS_VIOLATION
            | RC_NOT_ALLOWED_ON_NON_LEAF
            | RC_NOT_ALLOWED_ON_RDN => DirectoryError::Integrity {
                dn: target.to_string(),
                message,
            },
            RC_INVALID_ATTRIBUTE_SYNTAX => DirectoryError::Data {
                dn: target.to_string(),
                message,
            },
            RC_TIME_LIMIT_EXCEEDED => DirectoryError::Timeout { timeout_secs: 0 },
            RC_BUSY | RC_UNAVAILABLE => DirectoryError::connection_failed(message),
            _ => DirectoryError::Protocol { code, message },
        }
    }

    /// Get the kind this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DirectoryError::NotFound { .. } => ErrorKind::NotFound,
            DirectoryError::MultipleObjectsReturned { .. } | DirectoryError::InvalidQuery { .. } => {
                ErrorKind::InvalidQuery
            }
            DirectoryError::ConnectionFailed { .. }
            | DirectoryError::Timeout { .. }
            | DirectoryError::PageLimitExceeded { .. } => ErrorKind::Connection,
            DirectoryError::AuthenticationFailed { .. } | DirectoryError::InsufficientAccess { .. } => {
                ErrorKind::Authentication
            }
            DirectoryError::Integrity { .. } => ErrorKind::Integrity,
            DirectoryError::Data { .. } => ErrorKind::Data,
            DirectoryError::Protocol { .. } => ErrorKind::Protocol,
            DirectoryError::TypeMismatch { .. } => ErrorKind::Type,
            DirectoryError::InvalidConfiguration { .. } => ErrorKind::Configuration,
        }
    }

    /// Check if this error is transient and warrants a reconnect-and-retry.
    ///
    /// A runaway paged search is connection-class but retrying it would loop
    /// the same way, so it is not transient.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DirectoryError::ConnectionFailed { .. } | DirectoryError::Timeout { .. }
        )
    }

    /// Get an error code for classification.
    pub fn error_code(&self) -> &'static str {
        match self {
            DirectoryError::NotFound { .. } => "NOT_FOUND",
            DirectoryError::MultipleObjectsReturned { .. } => "MULTIPLE_OBJECTS",
            DirectoryError::InvalidQuery { .. } => "INVALID_QUERY",
            DirectoryError::ConnectionFailed { .. } => "CONNECTION_FAILED",
            DirectoryError::Timeout { .. } => "TIMEOUT",
            DirectoryError::PageLimitExceeded { .. } => "PAGE_LIMIT_EXCEEDED",
            DirectoryError::AuthenticationFailed { .. } => "AUTH_FAILED",
            DirectoryError::InsufficientAccess { .. } => "INSUFFICIENT_ACCESS",
            DirectoryError::Integrity { .. } => "INTEGRITY",
            DirectoryError::Data { .. } => "INVALID_DATA",
            DirectoryError::Protocol { .. } => "PROTOCOL",
            DirectoryError::TypeMismatch { .. } => "TYPE_MISMATCH",
            DirectoryError::InvalidConfiguration { .. } => "INVALID_CONFIG",
        }
    }

    // Convenience constructors

    /// Create a connection failed error.
    pub fn connection_failed(message: impl Into<String>) -> Self {
        DirectoryError::ConnectionFailed {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection failed error with source.
    pub fn connection_failed_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        DirectoryError::ConnectionFailed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an invalid query error.
    pub fn invalid_query(message: impl Into<String>) -> Self {
        DirectoryError::InvalidQuery {
            message: message.into(),
        }
    }

    /// Create an invalid configuration error.
    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        DirectoryError::InvalidConfiguration {
            message: message.into(),
        }
    }
}

/// Result type for directory operations.
pub type DirectoryResult<T> = Result<T, DirectoryError>;
