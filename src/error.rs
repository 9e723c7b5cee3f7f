use std::io;
use thiserror::Error;

/// Errors returned by the shared map and its mapped-file engine.
#[derive(Error, Debug)]
pub enum MapError {
    /// IO errors when creating, mapping or flushing the backing file
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The requested sizes cannot be laid out in a file
    #[error("Capacity error: {0}")]
    Capacity(String),

    #[error("Encoded key is {len} bytes, slot key capacity is {max}")]
    KeyTooLarge { len: usize, max: usize },

    #[error("Encoded value is {len} bytes, slot value capacity is {max}")]
    ValueTooLarge { len: usize, max: usize },

    /// Every slot of the target segment is in use
    #[error("Segment {segment} has no free entry slots")]
    OutOfSegmentSpace { segment: usize },

    /// Spin budget exhausted while the segment lock was held by `holder`
    #[error("Timed out acquiring lock of segment {segment} (holder marker {holder:#x})")]
    LockTimeout { segment: usize, holder: u64 },

    /// The file header is not one this build can interpret
    #[error("Format mismatch: {0}")]
    FormatMismatch(String),

    #[error("Key encoding error: {0}")]
    KeyEncoding(String),

    #[error("Value encoding error: {0}")]
    ValueEncoding(String),

    #[error("Map has been closed")]
    Closed,

    /// Unknown, misaligned or out-of-range field for the atomic value view
    #[error("Invalid field: {0}")]
    InvalidField(String),

    /// The referenced slot was freed or reused since the reference was taken
    #[error("Value reference is no longer live")]
    StaleReference,
}

pub type Result<T> = std::result::Result<T, MapError>;
