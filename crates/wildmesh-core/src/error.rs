//! Error types for the mesh core.
//!
//! Only malformed input, bad configuration and caller mistakes are errors.
//! Missing routes, stale neighbors, rejected joins and an unsynchronized
//! clock are ordinary return values.

use thiserror::Error;

/// Frame and payload decoding errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Frame shorter than the fixed header plus checksum
    #[error("frame too short: {0} bytes")]
    FrameTooShort(usize),

    /// Frame-level integrity check failed
    #[error("checksum mismatch: expected {expected:#06x}, computed {actual:#06x}")]
    ChecksumMismatch { expected: u16, actual: u16 },

    /// Envelope version this build does not speak
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    /// Unrecognized message type tag
    #[error("unknown message type {0:#04x}")]
    UnknownMessageType(u8),

    /// Declared payload length disagrees with the frame
    #[error("payload length mismatch: declared {declared}, actual {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    /// Payload ended before a field could be read
    #[error("truncated payload: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    /// Payload carried bytes past its schema
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),

    /// Declared field outside its valid range
    #[error("field `{field}` out of range: {value}")]
    OutOfRange { field: &'static str, value: u64 },

    /// Payload does not fit in the length field
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A field failed validation
    #[error("invalid `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },

    /// Reading the configuration file failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Parsing the configuration file failed
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Top-level mesh error
#[derive(Error, Debug)]
pub enum MeshError {
    /// Frame or payload could not be encoded or decoded
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Configuration rejected
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Application payload larger than the configured limit
    #[error("payload of {size} bytes exceeds limit of {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    /// Transmit queue is full
    #[error("transmit queue full")]
    QueueFull,
}

/// Result type for mesh operations
pub type MeshResult<T> = std::result::Result<T, MeshError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_error_display() {
        let err = CodecError::ChecksumMismatch {
            expected: 0x1234,
            actual: 0xabcd,
        };
        assert_eq!(
            err.to_string(),
            "checksum mismatch: expected 0x1234, computed 0xabcd"
        );
    }

    #[test]
    fn test_mesh_error_from_codec() {
        let err: MeshError = CodecError::UnknownMessageType(0x42).into();
        assert!(err.to_string().contains("unknown message type 0x42"));
    }

    #[test]
    fn test_config_error_invalid() {
        let err = ConfigError::invalid("routing.cost_penalty", "must be positive");
        assert_eq!(err.to_string(), "invalid `routing.cost_penalty`: must be positive");
    }
}
