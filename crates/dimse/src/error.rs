//! Error types for DIMSE operations

use thiserror::Error;

/// Result type alias for DIMSE operations
pub type Result<T> = std::result::Result<T, DimseError>;

/// Error types that can occur during DIMSE operations
#[derive(Error, Debug)]
pub enum DimseError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("DICOM parsing error: {0}")]
    DicomParsing(String),

    #[error("DICOM UL error: {0}")]
    DicomUl(String),

    /// Peer refused negotiation. Not retryable without a configuration change.
    #[error("Association rejected: {0}")]
    AssociationRejected(String),

    /// Timeout, abort or invalid reply in the middle of an exchange.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Peer could not process one query identifier (status 0xCxxx).
    #[error("Query unprocessable (status 0x{status:04X})")]
    QueryUnprocessable { status: u16 },

    /// Part of a retrieval failed on the peer side.
    #[error("Sub-operation failure (status 0x{status:04X}, failed {failed})")]
    SubOperationFailure { status: u16, failed: u16 },

    /// Peer does not know the move destination (status 0xA801).
    #[error("Move destination '{destination}' unknown to peer")]
    DestinationUnknown { destination: String },

    /// Local persistence of a pushed object failed.
    #[error("Failed to store object {sop_instance_uid}: {reason}")]
    StoreWriteFailure {
        sop_instance_uid: String,
        reason: String,
    },

    #[error("Invalid AE Title: {0}")]
    InvalidAeTitle(String),

    #[error("Timeout occurred: {0}")]
    Timeout(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DimseError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new connection lost error
    pub fn connection_lost(msg: impl Into<String>) -> Self {
        Self::ConnectionLost(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DimseError::Network(_) | DimseError::Timeout(_) | DimseError::ConnectionLost(_)
        )
    }

    /// Whether the error points at a configuration defect an operator must fix
    pub fn is_configuration_defect(&self) -> bool {
        matches!(
            self,
            DimseError::Config(_)
                | DimseError::InvalidAeTitle(_)
                | DimseError::AssociationRejected(_)
                | DimseError::DestinationUnknown { .. }
        )
    }
}
