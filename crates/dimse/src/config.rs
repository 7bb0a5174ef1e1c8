//! Configuration types for DIMSE services

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::{DEFAULT_DIMSE_PORT, DEFAULT_STORE_PORT};

/// Configuration for the local side: outbound identity plus the store listener
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DimseConfig {
    /// Local Application Entity Title, also advertised as the move destination
    #[serde(alias = "ae_title")]
    pub local_aet: String,

    /// Bind address for the store listener
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,

    /// Port for the store listener
    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum PDU size in bytes
    #[serde(default = "default_max_pdu")]
    pub max_pdu: u32,

    /// Connection/negotiation timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Maximum wait between two replies of one exchange, in milliseconds
    #[serde(default = "default_reply_timeout")]
    pub reply_timeout_ms: u64,

    /// Idle timeout for inbound store associations, in milliseconds
    #[serde(default = "default_association_timeout")]
    pub association_timeout_ms: u64,

    /// How long to keep listening after a failure reply that may be followed
    /// by more replies (0xCxxx on find, 0xA702 on move), in milliseconds
    #[serde(default = "default_grace")]
    pub failure_grace_ms: u64,

    /// Output directory for pushed objects
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Transfer syntaxes proposed for find/move contexts (in order of preference)
    #[serde(default = "default_transfer_syntaxes")]
    pub preferred_transfer_syntaxes: Vec<String>,

    /// Maximum number of concurrent inbound store associations
    #[serde(default = "default_max_associations")]
    pub max_associations: u32,

    /// Treat C-FIND status 0xFF01 (optional keys not supported) as a match.
    /// Peer dependent: some archives use it for genuine matches.
    #[serde(default = "default_true")]
    pub optional_keys_pending_is_match: bool,
}

/// Configuration for a remote DICOM node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteNode {
    /// Remote Application Entity Title
    pub ae_title: String,

    /// Remote host address
    pub host: String,

    /// Remote port
    pub port: u16,

    /// Connection timeout in milliseconds (overrides global setting)
    pub connect_timeout_ms: Option<u64>,

    /// Maximum PDU size for this node (overrides global setting)
    pub max_pdu: Option<u32>,
}

impl Default for DimseConfig {
    fn default() -> Self {
        Self {
            local_aet: "QRPULL".to_string(),
            bind_addr: default_bind_addr(),
            port: default_port(),
            max_pdu: default_max_pdu(),
            connect_timeout_ms: default_connect_timeout(),
            reply_timeout_ms: default_reply_timeout(),
            association_timeout_ms: default_association_timeout(),
            failure_grace_ms: default_grace(),
            storage_dir: default_storage_dir(),
            preferred_transfer_syntaxes: default_transfer_syntaxes(),
            max_associations: default_max_associations(),
            optional_keys_pending_is_match: true,
        }
    }
}

impl DimseConfig {
    /// Get connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Get reply timeout as Duration
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    /// Get association idle timeout as Duration
    pub fn association_timeout(&self) -> Duration {
        Duration::from_millis(self.association_timeout_ms)
    }

    /// Get failure grace period as Duration
    pub fn failure_grace(&self) -> Duration {
        Duration::from_millis(self.failure_grace_ms)
    }

    /// Socket address the store listener binds to
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::error::Result<()> {
        validate_ae_title(&self.local_aet)?;

        if self.port == 0 {
            return Err(crate::error::DimseError::config(
                "Port must be greater than 0",
            ));
        }

        if self.max_pdu < 16384 || self.max_pdu > 131072 {
            return Err(crate::error::DimseError::config(
                "Max PDU size must be between 16384 and 131072 bytes",
            ));
        }

        if self.reply_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(crate::error::DimseError::config(
                "Timeouts must be greater than 0",
            ));
        }

        if self.preferred_transfer_syntaxes.is_empty() {
            return Err(crate::error::DimseError::config(
                "At least one transfer syntax must be proposed",
            ));
        }

        if self.max_associations == 0 {
            return Err(crate::error::DimseError::config(
                "max_associations must be greater than 0",
            ));
        }

        Ok(())
    }
}

impl RemoteNode {
    /// Create a new remote node configuration
    pub fn new(ae_title: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            ae_title: ae_title.into(),
            host: host.into(),
            port,
            connect_timeout_ms: None,
            max_pdu: None,
        }
    }

    /// Set connection timeout for this node
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.connect_timeout_ms = Some(timeout_ms);
        self
    }

    /// `AE@host:port` form used in logs and by the UL layer
    pub fn address(&self) -> String {
        format!("{}@{}:{}", self.ae_title, self.host, self.port)
    }

    /// Validate the remote node configuration
    pub fn validate(&self) -> crate::error::Result<()> {
        validate_ae_title(&self.ae_title)?;

        if self.host.is_empty() {
            return Err(crate::error::DimseError::config(
                "Remote host cannot be empty",
            ));
        }

        if self.port == 0 {
            return Err(crate::error::DimseError::config(
                "Remote port must be greater than 0",
            ));
        }

        Ok(())
    }
}

impl std::fmt::Display for RemoteNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.address())
    }
}

fn validate_ae_title(title: &str) -> crate::error::Result<()> {
    let trimmed = title.trim();
    if trimmed.is_empty() || trimmed.len() > 16 {
        return Err(crate::error::DimseError::InvalidAeTitle(format!(
            "'{}' must be 1-16 characters",
            title
        )));
    }
    if trimmed.contains('\\') || trimmed.chars().any(|c| c.is_control()) {
        return Err(crate::error::DimseError::InvalidAeTitle(format!(
            "'{}' contains characters not allowed in an AE title",
            title
        )));
    }
    Ok(())
}

// Default value functions
fn default_bind_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0))
}

fn default_port() -> u16 {
    DEFAULT_STORE_PORT
}

fn default_max_pdu() -> u32 {
    16384
}

fn default_connect_timeout() -> u64 {
    30_000 // 30 seconds
}

fn default_reply_timeout() -> u64 {
    60_000
}

fn default_association_timeout() -> u64 {
    300_000 // 5 minutes
}

fn default_grace() -> u64 {
    2_000
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("./dicom")
}

fn default_transfer_syntaxes() -> Vec<String> {
    vec![
        "1.2.840.10008.1.2.1".to_string(), // Explicit VR Little Endian
        "1.2.840.10008.1.2".to_string(),   // Implicit VR Little Endian
    ]
}

fn default_max_associations() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

/// Default port used for a remote archive when none is configured
pub fn default_remote_port() -> u16 {
    DEFAULT_DIMSE_PORT
}
