//! Error types for `pgtde` operations.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

/// Main error type for registry, codec and WAL storage operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Provider options failed to parse or validate
    #[error("invalid provider options: {0}")]
    InvalidOptions(String),

    /// Provider name does not fit the on-disk record
    #[error("provider name \"{name}\" is too long (maximum is {max} bytes)")]
    NameTooLong {
        /// The rejected name
        name: String,
        /// Maximum name length in bytes
        max: usize,
    },

    /// A provider with the same name already exists
    #[error("key provider \"{0}\" already exists")]
    Duplicate(String),

    /// No provider matched the given name or id
    #[error("key provider {0} does not exist")]
    NotFound(String),

    /// The caller broke an API precondition
    #[error("invalid call: {0}")]
    InvalidCall(String),

    /// A file holds a partial record or inconsistent metadata
    #[error("file \"{}\" is corrupted: {reason}", path.display())]
    Corrupt {
        /// File that failed the integrity check
        path: PathBuf,
        /// What was wrong with it
        reason: String,
    },

    /// No provider id is left to assign in this file
    #[error("cannot create key provider, id out of range")]
    IdOutOfRange,

    /// I/O operation failed
    #[error("I/O error on \"{}\": {source}", path.display())]
    Io {
        /// File being accessed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// Key provider backend failed
    #[error("key provider error: {0}")]
    KeyProvider(#[from] KeyProviderError),

    /// A WAL segment size is not a power of two between 1 MiB and 1 GiB
    #[error("invalid WAL segment size: {0} bytes")]
    InvalidSegmentSize(u64),

    /// Encryption or decryption of key material failed
    #[error("encryption failed: {0}")]
    Crypto(String),
}

impl Error {
    /// Wraps an I/O error with the path it happened on.
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        Self::Io { path: path.as_ref().to_path_buf(), source }
    }

    /// Builds a corruption error for `path`.
    pub fn corrupt(path: impl AsRef<Path>, reason: impl Into<String>) -> Self {
        Self::Corrupt { path: path.as_ref().to_path_buf(), reason: reason.into() }
    }
}

/// Errors returned by key provider backends.
#[derive(Debug)]
pub enum KeyProviderError {
    /// Key not found in the backend
    KeyNotFound(String),

    /// A key with the same name is already stored
    Duplicate(String),

    /// Backend storage holds a partial or malformed key
    Corrupt(String),

    /// Retrieved key does not fit the key buffer
    InvalidKeySize {
        /// Size reported by the backend
        actual: usize,
        /// Largest supported key size
        max: usize,
    },

    /// Provider options are unusable for this backend
    InvalidConfig(String),

    /// Remote backend failed, timed out or answered ambiguously
    Backend(String),

    /// I/O operation failed
    Io(io::Error),
}

impl fmt::Display for KeyProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeyNotFound(name) => write!(f, "key not found: {name}"),
            Self::Duplicate(name) => write!(f, "key already exists: {name}"),
            Self::Corrupt(msg) => write!(f, "key storage corrupted: {msg}"),
            Self::InvalidKeySize { actual, max } => {
                write!(f, "invalid key size {actual} bytes (maximum {max})")
            }
            Self::InvalidConfig(msg) => write!(f, "invalid provider configuration: {msg}"),
            Self::Backend(msg) => write!(f, "backend error: {msg}"),
            Self::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for KeyProviderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for KeyProviderError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_keeps_path() {
        let err = Error::io("/tmp/pg_tde_5_keyring", io::Error::from(io::ErrorKind::NotFound));
        let msg = err.to_string();
        assert!(msg.contains("/tmp/pg_tde_5_keyring"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_key_provider_error_converts() {
        let err: Error = KeyProviderError::KeyNotFound("wal-key".to_string()).into();
        assert!(matches!(err, Error::KeyProvider(KeyProviderError::KeyNotFound(_))));
        assert_eq!(err.to_string(), "key provider error: key not found: wal-key");
    }
}
