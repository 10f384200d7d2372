use std::{error::Error, fmt};

use backtrace::Backtrace;
use log::error;

/// The failure categories surfaced through the public api. Everything is
/// reported as a status value, there is no unwinding across the crate
/// boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    DbOpenFailed,
    DbCreateFailed,
    KeyRepeat,
    KeyNotFound,
    /// Reserved for typed-bucket extensions.
    BucketTypeMismatch,
    Io,
}

pub struct KvError {
    kind: ErrorKind,
    details: String,
    backtrace: Backtrace,
}

impl KvError {
    pub fn new(kind: ErrorKind, msg: &str) -> KvError {
        KvError {
            kind,
            details: msg.to_string(),
            backtrace: Backtrace::new(),
        }
    }

    pub fn key_repeat(key: &[u8]) -> KvError {
        Self::new(
            ErrorKind::KeyRepeat,
            &format!("key already exists: {}", hex::encode(key)),
        )
    }

    pub fn key_not_found(key: &[u8]) -> KvError {
        Self::new(
            ErrorKind::KeyNotFound,
            &format!("key not found: {}", hex::encode(key)),
        )
    }

    pub fn open_failed(msg: &str) -> KvError {
        Self::new(ErrorKind::DbOpenFailed, msg)
    }

    pub fn create_failed(msg: &str) -> KvError {
        Self::new(ErrorKind::DbCreateFailed, msg)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn show_backtrace(&self) {
        error!("{}, backtrace:\n{:?}", self, self.backtrace);
    }
}

impl fmt::Display for KvError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{:?}] {}", self.kind, self.details)
    }
}

impl fmt::Debug for KvError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "KvError {{ kind: {:?}, details: {} }}", self.kind, self.details)
    }
}

impl Error for KvError {}

impl From<std::io::Error> for KvError {
    fn from(e: std::io::Error) -> KvError {
        Self::new(ErrorKind::Io, &e.to_string())
    }
}
