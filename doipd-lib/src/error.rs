use std::io;
use thiserror::Error;

/// The primary error type for the `doipd-lib` crate.
#[derive(Error, Debug)]
pub enum DoipError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("bad DoIP header: inverse version 0x{inverse:02X} is not the complement of 0x{version:02X}")]
    InverseVersionMismatch { version: u8, inverse: u8 },

    #[error("payload of {length} bytes for type 0x{payload_type:04X} exceeds the {max} byte cap")]
    PayloadTooLarge {
        payload_type: u16,
        length: u32,
        max: u32,
    },

    #[error("truncated payload: expected at least {expected} bytes, got {actual}")]
    TruncatedPayload { expected: usize, actual: usize },

    #[error("malformed payload for type 0x{payload_type:04X}: {reason}")]
    MalformedPayload { payload_type: u16, reason: String },

    #[error("identity config: {0}")]
    Config(String),
}
