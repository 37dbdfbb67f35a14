//! TLS-specific error types for credential loading and session I/O

use std::path::{Path, PathBuf};

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, TlsError>;

/// Errors raised by credential caches and sessions
///
/// Credential loading errors (`NotFound`, `Parse`, `Decryption`) are recoverable:
/// the caller may retry with another path or password. `Handshake` and `Io`
/// are terminal for the session that raised them. `WouldBlock` is not a
/// failure at all, only a request to retry once the transport is ready.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    /// The cryptographic engine could not be initialized
    #[error("Engine initialization failed: {0}")]
    Initialization(String),
    /// A credential file does not exist
    #[error("File not found: {}", path.display())]
    NotFound {
        /// Path that was requested
        path: PathBuf,
    },
    /// Credential content is malformed or empty
    #[error("Parse error: {0}")]
    Parse(String),
    /// A private key could not be decrypted with the supplied password
    #[error("Key decryption failed: {0}")]
    Decryption(String),
    /// Diffie-Hellman parameter generation failed
    #[error("Parameter generation failed: {0}")]
    Generation(String),
    /// Session options are inconsistent or rejected by the engine
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// Protocol-level handshake failure reported by the engine or the peer
    #[error("Handshake failed: {0}")]
    Handshake(String),
    /// The transport is not ready; retry the same call later
    #[error("Operation would block")]
    WouldBlock,
    /// Transport failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// An operation was called in a session state that does not allow it
    #[error("Invalid session usage: {0}")]
    Usage(String),
}

impl TlsError {
    /// Returns true for the retry signal of non-blocking transports
    #[must_use]
    pub fn is_would_block(&self) -> bool {
        match self {
            Self::WouldBlock => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::WouldBlock,
            _ => false,
        }
    }

    /// Map a filesystem error for `path`, keeping `NotFound` distinct
    pub(crate) fn from_file_io(path: &Path, e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            Self::Io(e)
        }
    }
}

impl From<rustls::Error> for TlsError {
    fn from(e: rustls::Error) -> Self {
        Self::Handshake(e.to_string())
    }
}
