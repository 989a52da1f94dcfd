//! Error types for protocol decoding.

use thiserror::Error;

/// Errors a decoder can report for a single frame. Per the decoder contract
/// none of these ever propagate as a panic: the listener pool
/// logs them with the offending span and keeps reading the same connection.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    /// Frame is too short to contain its required fields.
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    /// Frame prefix/command does not match any known shape for this protocol.
    #[error("unrecognized frame: {0}")]
    UnrecognizedFrame(String),

    /// A field within an otherwise-recognized frame failed to parse.
    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },

    /// Declared length field disagrees with the bytes actually present.
    #[error("length mismatch: frame declares {declared} bytes, got {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    /// Checksum/CRC did not validate.
    #[error("checksum mismatch")]
    ChecksumMismatch,

    /// Invalid UTF-8 where a text field was expected.
    #[error("invalid string encoding")]
    InvalidString,

    /// Codec or command id not recognized by this decoder version.
    #[error("unknown codec or command: {0:#04x}")]
    UnknownCodec(u8),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_human_readable() {
        let e = ParseError::TooShort {
            expected: 10,
            actual: 3,
        };
        assert_eq!(
            e.to_string(),
            "frame too short: expected at least 10 bytes, got 3"
        );
    }
}
