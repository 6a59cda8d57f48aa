use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// EmberDB errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// Neither log superblock carries a valid checksum. The store cannot be
    /// opened from this directory.
    CorruptSuperBlock,
    /// An IO error surfaced to the caller. Flush-path IO errors are retried
    /// internally and never reach here.
    Io(String),
    /// The snapshot does not belong to this store.
    InvalidSnapshot,
    /// The key exceeds the encodable length limit.
    KeyTooLarge,
    /// The key does not resolve to a live record.
    ItemNotFound,
    /// The key resolves to a record that carries no value.
    ItemNoValue,
    /// The swapper could not reclaim enough memory within its eviction
    /// deadline.
    SwapperTimeout,
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::CorruptSuperBlock => write!(f, "log superblock is corrupted"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::InvalidSnapshot => write!(f, "invalid store snapshot"),
            Error::KeyTooLarge => write!(f, "key exceeds maximum encodable length"),
            Error::ItemNotFound => write!(f, "item not found"),
            Error::ItemNoValue => write!(f, "item has no value"),
            Error::SwapperTimeout => write!(f, "eviction timed out before reaching memory quota"),
        }
    }
}

/// An EmberDB Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Io(err.to_string())
    }
}
