//! One-time initialization of the cryptographic engine
//!
//! Every component that touches engine state calls
//! [`EngineGuard::ensure_initialized`] on its construction path. The first
//! successful call builds the ring-backed provider, checks that the system
//! random source works and publishes the provider process-wide.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use rustls::crypto::CryptoProvider;

use crate::error::{Result, TlsError};

static ENGINE: OnceCell<Arc<CryptoProvider>> = OnceCell::new();
static INITIALIZATIONS: AtomicUsize = AtomicUsize::new(0);

/// Process-wide guard for the TLS engine
pub struct EngineGuard;

impl EngineGuard {
    /// Initialize the engine if needed and return the shared provider
    ///
    /// Safe to call concurrently from any number of threads: exactly one
    /// initialization runs and every caller observes its result.
    ///
    /// # Errors
    ///
    /// Returns [`TlsError::Initialization`] if the engine reports an
    /// unrecoverable error (no usable random source or no cipher suites).
    pub fn ensure_initialized() -> Result<Arc<CryptoProvider>> {
        ENGINE.get_or_try_init(Self::initialize).cloned()
    }

    /// Number of times the initialization body has run in this process
    #[must_use]
    pub fn initializations() -> usize {
        INITIALIZATIONS.load(Ordering::SeqCst)
    }

    /// Whether the engine has been initialized successfully
    #[must_use]
    pub fn is_initialized() -> bool {
        ENGINE.get().is_some()
    }

    fn initialize() -> Result<Arc<CryptoProvider>> {
        INITIALIZATIONS.fetch_add(1, Ordering::SeqCst);

        let provider = rustls::crypto::ring::default_provider();
        if provider.cipher_suites.is_empty() || provider.kx_groups.is_empty() {
            return Err(TlsError::Initialization(
                "engine provides no cipher suites or key exchange groups".to_string(),
            ));
        }

        let mut probe = [0u8; 32];
        provider
            .secure_random
            .fill(&mut probe)
            .map_err(|_| TlsError::Initialization("secure random source unavailable".to_string()))?;

        let provider = Arc::new(provider);
        // Another library may have installed its own default; ours is still
        // used explicitly for every configuration built here.
        if CryptoProvider::install_default((*provider).clone()).is_err() {
            tracing::debug!("Process default crypto provider already installed");
        }

        tracing::info!(
            "TLS engine initialized ({} cipher suites, {} key exchange groups)",
            provider.cipher_suites.len(),
            provider.kx_groups.len()
        );
        Ok(provider)
    }
}
