//! Credential store and per-session credential bundles

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;

use crate::certificate::{CertificateChain, CertificateChainCache};
use crate::config::SessionOptions;
use crate::dh::{DhParamCache, DhParams, DhSettings};
use crate::error::{Result, TlsError};
use crate::key::{PrivateKey, PrivateKeyCache};
use crate::session::Direction;

static GLOBAL: Lazy<Arc<CredentialStore>> = Lazy::new(|| Arc::new(CredentialStore::default()));

/// The three credential caches shared by sessions
#[derive(Debug, Default)]
pub struct CredentialStore {
    /// Certificate chains by path
    pub certificates: CertificateChainCache,
    /// Decrypted private keys by path and password
    pub keys: PrivateKeyCache,
    /// Generated and file-loaded DH parameters
    pub dh: DhParamCache,
}

impl CredentialStore {
    /// Process-wide store used by [`crate::Session::new`]
    #[must_use]
    pub fn global() -> Arc<Self> {
        Arc::clone(&GLOBAL)
    }

    /// Create an independent store with the given DH settings
    #[must_use]
    pub fn new(dh: DhSettings) -> Self {
        Self {
            certificates: CertificateChainCache::default(),
            keys: PrivateKeyCache::default(),
            dh: DhParamCache::new(dh),
        }
    }

    /// Drop entries older than `max_age` from every cache
    ///
    /// The current DH parameter set is not affected.
    pub fn purge(&self, max_age: Duration) -> usize {
        let removed =
            self.certificates.purge(max_age) + self.keys.purge(max_age) + self.dh.purge(max_age);
        if removed > 0 {
            tracing::info!("Purged {} stale credential(s)", removed);
        }
        removed
    }
}

/// Key, certificate chain and DH parameters for one end of a session
#[derive(Debug, Clone)]
pub struct Credentials {
    identity: Option<(Arc<CertificateChain>, Arc<PrivateKey>)>,
    dh_params: Option<Arc<DhParams>>,
}

impl Credentials {
    /// Load everything `options` names for a session in `direction`
    ///
    /// Loading errors are returned unchanged.
    ///
    /// # Errors
    ///
    /// - [`TlsError::Configuration`] if only one of certificate and key is
    ///   set, or a server has neither
    /// - any error of the underlying caches
    pub fn resolve(
        direction: Direction,
        options: &SessionOptions,
        store: &CredentialStore,
    ) -> Result<Self> {
        let identity = match (&options.certificate_file, &options.key_file) {
            (Some(cert), Some(key)) => {
                let chain = store.certificates.from_file(cert)?;
                let key = store.keys.from_file(key, options.password())?;
                Some((chain, key))
            }
            (None, None) => None,
            _ => {
                return Err(TlsError::Configuration(
                    "certificate_file and key_file must be set together".to_string(),
                ))
            }
        };

        if direction == Direction::Server && identity.is_none() {
            return Err(TlsError::Configuration(
                "Server sessions require certificate_file and key_file".to_string(),
            ));
        }

        let dh_params = match &options.dh_params_file {
            Some(path) => Some(store.dh.from_file(path)?),
            None if direction == Direction::Server && options.dh_key_exchange => {
                Some(store.dh.current()?)
            }
            None => None,
        };

        Ok(Self { identity, dh_params })
    }

    /// Certificate chain presented to the peer
    #[must_use]
    pub fn chain(&self) -> Option<&Arc<CertificateChain>> {
        self.identity.as_ref().map(|(chain, _)| chain)
    }

    /// Private key matching the chain's leaf
    #[must_use]
    pub fn key(&self) -> Option<&Arc<PrivateKey>> {
        self.identity.as_ref().map(|(_, key)| key)
    }

    /// DH parameters offered for key exchange
    #[must_use]
    pub fn dh_params(&self) -> Option<&Arc<DhParams>> {
        self.dh_params.as_ref()
    }
}
