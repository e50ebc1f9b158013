//! Error types for the secret store

use crate::cipher::CipherError;
use std::path::PathBuf;
use thiserror::Error;

/// Everything that can go wrong between reading the filestore and writing it back
#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Configuration(String),

    #[error("secret for key {0} does not exist")]
    NotFound(String),

    #[error("secret for {key} already exists with value ({existing}), use --force or `lockbox update` to overwrite")]
    Conflict { key: String, existing: String },

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid filter pattern")]
    InvalidPattern(#[from] regex::Error),

    #[error("decrypting secrets file failed")]
    Decryption(#[source] CipherError),

    #[error("encrypting secrets file failed")]
    Encryption(#[source] CipherError),

    #[error("secrets payload is not valid JSON")]
    Serialization(#[from] serde_json::Error),

    #[error("{action} {}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("clipboard copy failed: {0}")]
    Clipboard(String),
}

impl Error {
    pub(crate) fn io(action: &'static str, path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Error::Io {
            action,
            path,
            source,
        }
    }
}

/// Convenience result alias for secret store operations
pub type Result<T> = std::result::Result<T, Error>;
