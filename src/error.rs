//! Error types and result definitions for the tuyaswitch crate.
//! Includes Tuya-specific error codes and conversion from standard IO/JSON errors.

use thiserror::Error;

/// Represents all possible errors that can occur when talking to the switch.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TuyaError {
    /// Standard IO error (network, broken pipe, etc.)
    #[error("IO error: {0}")]
    Io(String),

    /// JSON serialization or deserialization error
    #[error("JSON error: {0}")]
    Json(String),

    /// Failed to decrypt a message from the device (wrong key or version)
    #[error("Decryption failed")]
    DecryptionFailed,

    /// Failed to encrypt a message for the device
    #[error("Encryption failed")]
    EncryptionFailed,

    /// The payload received from the device was malformed or unexpected
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Request timed out
    #[error("Timeout waiting for device")]
    Timeout,

    /// CRC check failed for the received message
    #[error("CRC mismatch")]
    CrcMismatch,

    /// HMAC signature verification failed (v3.4+)
    #[error("HMAC mismatch")]
    HmacMismatch,

    /// TCP connection could not be established
    #[error("Socket connection failed: {0}")]
    ConnectionFailed(String),

    /// The device closed the TCP connection
    #[error("Connection closed by device")]
    ConnectionClosed,

    /// The message header was invalid
    #[error("Invalid header")]
    InvalidHeader,

    /// Failed to decode hex or base64 data
    #[error("Decode error: {0}")]
    DecodeError(String),

    /// Key negotiation (handshake) failed
    #[error("Handshake failed")]
    HandshakeFailed,

    /// Generic error for wrong Local Key or Protocol Version
    #[error("Check device key or version")]
    KeyOrVersionError,

    /// The requested protocol version is not implemented
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    /// Device handle parameters are unusable
    #[error("Invalid device configuration: {0}")]
    InvalidConfig(String),
}

/// A specialized Result type for Tuya operations.
pub type Result<T> = std::result::Result<T, TuyaError>;

impl From<std::io::Error> for TuyaError {
    fn from(err: std::io::Error) -> Self {
        TuyaError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for TuyaError {
    fn from(err: serde_json::Error) -> Self {
        TuyaError::Json(err.to_string())
    }
}

impl TuyaError {
    pub fn code(&self) -> u32 {
        match self {
            TuyaError::Io(_) => ERR_CONNECT,
            TuyaError::Json(_) => ERR_JSON,
            TuyaError::DecryptionFailed => ERR_KEY_OR_VER,
            TuyaError::EncryptionFailed => ERR_KEY_OR_VER,
            TuyaError::InvalidPayload(_) => ERR_PAYLOAD,
            TuyaError::CrcMismatch => ERR_KEY_OR_VER,
            TuyaError::HmacMismatch => ERR_KEY_OR_VER,
            TuyaError::ConnectionFailed(_) => ERR_CONNECT,
            TuyaError::ConnectionClosed => ERR_CONNECT,
            TuyaError::InvalidHeader => ERR_PAYLOAD,
            TuyaError::DecodeError(_) => ERR_PAYLOAD,
            TuyaError::HandshakeFailed => ERR_KEY_OR_VER,
            TuyaError::KeyOrVersionError => ERR_KEY_OR_VER,
            TuyaError::Timeout => ERR_TIMEOUT,
            TuyaError::UnsupportedVersion(_) => ERR_PARAMS,
            TuyaError::InvalidConfig(_) => ERR_PARAMS,
        }
    }

    /// One-line report: the error, its code and the TinyTuya message for that code.
    pub fn report(&self) -> String {
        let code = self.code();
        format!("{} (code {}: {})", self, code, get_error_message(code))
    }

    /// True for failures of the socket itself, after which a reused
    /// connection is worth reopening.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, TuyaError::Io(_) | TuyaError::ConnectionClosed)
    }
}

// TinyTuya Error Response Codes
define_error_codes! {
    ERR_JSON = 900 => "Invalid JSON Response from Device",
    ERR_CONNECT = 901 => "Network Error: Unable to Connect",
    ERR_TIMEOUT = 902 => "Timeout Waiting for Device",
    ERR_PAYLOAD = 904 => "Unexpected Payload from Device",
    ERR_PARAMS = 912 => "Missing Function Parameters",
    ERR_KEY_OR_VER = 914 => "Check device key or version",
}
