//! Logging setup and helpers for sensitive values
//!
//! The crate logs through `tracing`, whose `log` feature forwards events to
//! `env_logger` when no subscriber is installed. Levels are configured with
//! `RUST_LOG`, for example `RUST_LOG=cryypt_tls=debug`.

use std::sync::Once;

use sha2::{Digest, Sha256};

static INIT_LOGGER: Once = Once::new();

/// Logging entry points for applications and tests
pub struct LoggingTransformer;

impl LoggingTransformer {
    /// Initialize `env_logger` once for the process
    pub fn init() {
        INIT_LOGGER.call_once(|| {
            let installed = env_logger::Builder::from_default_env()
                .format_timestamp_micros()
                .try_init()
                .is_ok();
            if installed {
                tracing::info!("Structured logging initialized");
            }
        });
    }

    /// Initialize logging for test environments
    ///
    /// Safe to call from every test; later calls are ignored.
    pub fn init_test() {
        let _ = env_logger::Builder::from_default_env()
            .is_test(true)
            .try_init();
    }

    /// Short SHA-256 tag for correlating a sensitive value in logs
    #[must_use]
    pub fn fingerprint(value: &[u8]) -> String {
        let hash = hex::encode(Sha256::digest(value));
        format!("#{}", &hash[..12])
    }

    /// Log a session lifecycle event
    pub fn log_session_event(peer: &str, event: &str) {
        tracing::debug!("Session with {}: {}", peer, event);
    }

    /// Log a terminal session failure without exposing payload data
    pub fn log_session_failure(peer: &str, operation: &str, error: &dyn std::error::Error) {
        tracing::error!("Session with {} failed during {}: {}", peer, operation, error);
    }
}
