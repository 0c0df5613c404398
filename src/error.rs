//! Error types for the Venus register core.

use thiserror::Error;

pub type Result<T, E> = core::result::Result<T, Error<E>>;

/// A raw word block did not match the width the catalog declares.
///
/// Word widths are static metadata, so hitting this at runtime means the
/// catalog and the read path disagree. Catalog validation rejects
/// inconsistent definitions at startup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("register {name}: expected {expected} words, got {got}")]
    MalformedLength {
        name: &'static str,
        expected: u16,
        got: u16,
    },
}

/// Rejections on the write path, reported to the caller before any
/// transport traffic happens.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EncodeError {
    #[error("register {name}: value {value} outside valid range")]
    OutOfRange { name: &'static str, value: f64 },
    #[error("register {name} is not writable")]
    NotWritable { name: &'static str },
    #[error("register {name} cannot encode this value kind")]
    UnsupportedValue { name: &'static str },
}

/// Static-table defects caught by startup validation. These are fatal:
/// a catalog that fails validation is a programming error, not a device
/// condition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error("duplicate register name {0}")]
    DuplicateName(&'static str),
    #[error("registers {0} and {1} overlap in address space")]
    AddressOverlap(&'static str, &'static str),
    #[error("writable register {0} has no valid range")]
    MissingBounds(&'static str),
    #[error("register {0} has a zero-width encoding")]
    ZeroWidth(&'static str),
    #[error("register {0} maps a bit outside its word block")]
    BitOutOfRange(&'static str),
    #[error("register {0} has a zero scale factor")]
    ZeroScale(&'static str),
}

/// Top level error for coordinator operations, generic over the transport's
/// own error type.
#[derive(Error, Debug)]
pub enum Error<E> {
    #[error("transport error")]
    Transport(E),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("unknown register {0}")]
    UnknownRegister(String),
}
