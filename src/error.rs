//! FleetSync Error Types

use std::time::Duration;
use thiserror::Error;

/// Result type alias for FleetSync operations
pub type Result<T> = std::result::Result<T, Error>;

/// FleetSync error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Connection errors
    #[error("No database connection available")]
    NoEndpoint,

    #[error("Unknown endpoint: {0}")]
    UnknownEndpoint(String),

    #[error("Connect to endpoint {endpoint} failed ({failure}): {detail}")]
    Connect {
        endpoint: String,
        failure: ConnectFailure,
        detail: String,
    },

    // Query errors
    #[error("Empty statement")]
    NoStatement,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Query execution failed: {0}")]
    QueryExecution(String),

    #[error("Schema error: {0}")]
    Schema(String),

    // Liveness errors
    #[error("Liveness probe on endpoint {endpoint} exceeded {timeout:?}; connection presumed hung")]
    LivenessTimeout { endpoint: String, timeout: Duration },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for errors the run cannot recover from. A hung connection cannot
    /// be safely unwound mid-query, so the process-level supervisor is
    /// expected to terminate on `LivenessTimeout` rather than retry.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::LivenessTimeout { .. })
    }

    /// Extract the classified connect failure, if this is one.
    pub fn connect_failure(&self) -> Option<ConnectFailure> {
        match self {
            Error::Connect { failure, .. } => Some(*failure),
            _ => None,
        }
    }
}

/// Classified reason an endpoint connection failed, derived from the
/// underlying driver error text. Always non-fatal to the connect cycle:
/// the failing endpoint is dropped and the run continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailure {
    /// Hostname did not resolve
    DnsFailure,
    /// No route to the host
    HostUnreachable,
    /// Host up but nothing listening on the port
    ConnectionRefused,
    /// Server demanded a password and none was configured
    NoPasswordSupplied,
    /// Credentials rejected
    AuthenticationFailed,
    /// Anything else
    GenericConnectFailure,
}

impl std::fmt::Display for ConnectFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectFailure::DnsFailure => write!(f, "DNS_FAILURE"),
            ConnectFailure::HostUnreachable => write!(f, "HOST_UNREACHABLE"),
            ConnectFailure::ConnectionRefused => write!(f, "CONNECTION_REFUSED"),
            ConnectFailure::NoPasswordSupplied => write!(f, "NO_PASSWORD_SUPPLIED"),
            ConnectFailure::AuthenticationFailed => write!(f, "AUTHENTICATION_FAILED"),
            ConnectFailure::GenericConnectFailure => write!(f, "GENERIC_CONNECT_FAILURE"),
        }
    }
}

/// Classify a driver connect error from its message text.
pub fn classify_connect_error(detail: &str) -> ConnectFailure {
    let text = detail.to_lowercase();

    if text.contains("failed to lookup address")
        || text.contains("name or service not known")
        || text.contains("no such host")
        || text.contains("temporary failure in name resolution")
    {
        ConnectFailure::DnsFailure
    } else if text.contains("no route to host") || text.contains("network is unreachable") {
        ConnectFailure::HostUnreachable
    } else if text.contains("connection refused") {
        ConnectFailure::ConnectionRefused
    } else if text.contains("using password: no") {
        ConnectFailure::NoPasswordSupplied
    } else if text.contains("access denied") || text.contains("authentication") {
        ConnectFailure::AuthenticationFailed
    } else {
        ConnectFailure::GenericConnectFailure
    }
}
