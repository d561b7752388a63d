//! Error types for the DHCP daemon and resolution service.
//!
//! All fallible operations in this crate return [`Result<T>`], which uses
//! the [`Error`] enum for error variants. A key that does not exist in the
//! store is never an error: lookups return an empty record and resolution
//! falls through to the next precedence level.

/// Errors that can occur while resolving, allocating or answering.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File system or network I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (config file or API bodies).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed DHCP packet received.
    ///
    /// This includes packets that are too short, have invalid magic cookies,
    /// invalid option lengths, or other protocol violations.
    #[error("Invalid DHCP packet: {0}")]
    InvalidPacket(String),

    /// Well-formed packet this server does not answer (wrong opcode,
    /// missing or unhandled message type).
    #[error("Unsupported message: {0}")]
    UnsupportedMessageType(String),

    /// The dynamic pool has no free entry.
    #[error("No available IP addresses in pool")]
    PoolExhausted,

    /// The shared store could not be reached or did not answer in time.
    ///
    /// Distinct from "key not found" so operators can tell an unknown client
    /// from a backend outage.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// A stored hash contains a field this crate does not know, or a value
    /// that does not parse as the field's type.
    #[error("Invalid record {key}: field {field}: {reason}")]
    InvalidRecord {
        key: String,
        field: String,
        reason: String,
    },

    /// The failover peer did not answer the heartbeat probe.
    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),

    /// The remote resolution service failed or returned an error status.
    #[error("Resolution service error: {0}")]
    Api(String),

    /// Invalid daemon configuration.
    ///
    /// Returned by [`Config::validate`](crate::Config::validate).
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Socket creation or configuration error.
    ///
    /// Typically occurs when binding to port 67 without administrator privileges.
    #[error("Socket error: {0}")]
    Socket(String),
}

impl From<redis::RedisError> for Error {
    fn from(error: redis::RedisError) -> Self {
        Self::StoreUnavailable(error.to_string())
    }
}

impl Error {
    pub(crate) fn invalid_record(
        key: &str,
        field: &str,
        reason: impl std::fmt::Display,
    ) -> Self {
        Self::InvalidRecord {
            key: key.to_string(),
            field: field.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
