//! Crate-local error type.
//!
//! `ErrorKind` mirrors the response codes in the wire protocol one-to-one
//! (see `protocol::ResponseCode`); `protocol` owns the conversion so this
//! module stays free of wire concerns.

use std::fmt;

use thiserror::Error;

/// The kind of failure a storage operation can report.
///
/// Every variant here maps to exactly one on-wire response code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    NoContent,
    Forbidden,
    CapacityExceeded,
    Malformed,
    Internal,
}

/// Crate-local error, carrying a kind plus an optional human-readable detail.
#[derive(Error, Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    detail: Option<&'static str>,
}

impl Error {
    pub const fn new(kind: ErrorKind) -> Self {
        Self { kind, detail: None }
    }

    pub const fn with_detail(kind: ErrorKind, detail: &'static str) -> Self {
        Self {
            kind,
            detail: Some(detail),
        }
    }

    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.detail {
            Some(detail) => write!(f, "{:?}: {}", self.kind, detail),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[macro_export]
macro_rules! bail {
    ($kind:expr) => {
        return Err($crate::error::Error::new($kind))
    };
    ($kind:expr, $detail:expr) => {
        return Err($crate::error::Error::with_detail($kind, $detail))
    };
}
