use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur when working with a demagnetization device
#[derive(Error, Debug)]
pub enum DemagError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// No Bluetooth adapter is available on this host
    #[error("No Bluetooth adapter available")]
    AdapterNotFound,

    /// Device not found while locating it by address
    #[error("Device {address} not found")]
    DeviceNotFound {
        /// Address that was searched for
        address: String,
    },

    /// Link could not be established (rejected or timed out)
    #[error("Failed to connect to device: {0}")]
    ConnectionFailed(String),

    /// Link dropped while an operation was in flight
    #[error("Connection lost")]
    ConnectionLost,

    /// Explicitly bounded operation did not finish in time
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// Malformed or unexpected-length payload
    #[error("Failed to decode {what}: {reason}")]
    Decode {
        /// Name of the payload being decoded
        what: &'static str,
        /// What was wrong with it
        reason: String,
    },

    /// State ordinal outside the known range
    #[error("Unknown device state ordinal: {0}")]
    InvalidState(u8),

    /// State characteristic returned no data
    #[error("State characteristic returned an empty payload")]
    EmptyState,

    /// Expected characteristic missing from the discovered GATT table
    #[error("Characteristic {0} not found on device")]
    MissingCharacteristic(Uuid),

    /// Settings store failure
    #[error("Settings error: {0}")]
    Settings(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The owning task has been shut down
    #[error("Controller is shut down")]
    Closed,
}

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DemagError>;

impl DemagError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::ConnectionFailed(_)
                | Self::ConnectionLost
                | Self::DeviceNotFound { .. }
                | Self::AdapterNotFound
        )
    }

    /// Check if this error came from payload decoding
    #[must_use]
    pub const fn is_decode_error(&self) -> bool {
        matches!(
            self,
            Self::Decode { .. } | Self::InvalidState(_) | Self::EmptyState
        )
    }

    pub(crate) fn decode(what: &'static str, reason: impl Into<String>) -> Self {
        Self::Decode {
            what,
            reason: reason.into(),
        }
    }
}
