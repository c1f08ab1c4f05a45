//! Error types for portal operations

use thiserror::Error;

/// Errors that can occur while starting, running or stopping the portal
#[derive(Debug, Error)]
pub enum PortalError {
    /// Host default gateway or egress interface could not be discovered
    #[error("Gateway discovery failed: {0}")]
    Discovery(String),

    /// Virtual interface creation or I/O failure
    #[error("Virtual interface error: {0}")]
    Device(String),

    /// Anchor start, CIDR fetch or transport failure
    #[error("Anchor error: {0}")]
    Anchor(String),

    /// Routing, firewall, NAT or sysctl step failed
    #[error("Network configuration error: {0}")]
    Configuration(String),

    /// Recoverable I/O failure inside a forwarding loop
    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    /// Status server could not be started
    #[error("Status server error: {0}")]
    Status(String),

    /// Operation not allowed in the current lifecycle state
    #[error("Invalid lifecycle state: {0}")]
    InvalidState(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for portal operations
pub type Result<T> = std::result::Result<T, PortalError>;
