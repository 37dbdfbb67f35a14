//! Certificate chain loading and caching
//!
//! A chain file holds one or more concatenated PEM certificates (or a single
//! DER certificate), leaf first. Parsing is all-or-nothing: a chain is only
//! published once every certificate in the file decoded as X.509.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use rustls::pki_types::CertificateDer;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::cache::{CredentialCache, DEFAULT_CAPACITY};
use crate::engine::EngineGuard;
use crate::error::{Result, TlsError};

/// Descriptive fields extracted from one certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateSummary {
    /// Subject distinguished name
    pub subject: String,
    /// Issuer distinguished name
    pub issuer: String,
    /// Serial number, hex encoded
    pub serial: String,
    /// End of validity as a Unix timestamp
    pub not_after: i64,
}

impl CertificateSummary {
    /// Extract the summary from DER bytes
    ///
    /// # Errors
    ///
    /// Returns [`TlsError::Parse`] if the bytes are not an X.509 certificate.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| TlsError::Parse(format!("X.509 parsing failed: {e}")))?;
        Ok(Self {
            subject: cert.subject().to_string(),
            issuer: cert.issuer().to_string(),
            serial: hex::encode(cert.raw_serial()),
            not_after: cert.validity().not_after.timestamp(),
        })
    }
}

/// Ordered certificate list loaded from one file
#[derive(Debug)]
pub struct CertificateChain {
    loaded_at: SystemTime,
    source_path: PathBuf,
    certificates: Vec<CertificateDer<'static>>,
    summaries: Vec<CertificateSummary>,
}

impl CertificateChain {
    /// Parse a chain from file content
    ///
    /// # Errors
    ///
    /// Returns [`TlsError::Parse`] for malformed content or a file with no
    /// certificates.
    pub fn parse(source_path: &Path, content: &[u8]) -> Result<Self> {
        let certificates = decode_certificates(content)?;
        if certificates.is_empty() {
            return Err(TlsError::Parse(format!(
                "No certificates found in {}",
                source_path.display()
            )));
        }

        let summaries = certificates
            .iter()
            .map(|der| CertificateSummary::from_der(der.as_ref()))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            loaded_at: SystemTime::now(),
            source_path: source_path.to_path_buf(),
            certificates,
            summaries,
        })
    }

    /// When the chain was parsed
    #[must_use]
    pub fn loaded_at(&self) -> SystemTime {
        self.loaded_at
    }

    /// File the chain came from
    #[must_use]
    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    /// Certificates in file order, leaf first
    #[must_use]
    pub fn certificates(&self) -> &[CertificateDer<'static>] {
        &self.certificates
    }

    /// Per-certificate descriptive fields, in the same order
    #[must_use]
    pub fn summaries(&self) -> &[CertificateSummary] {
        &self.summaries
    }

    /// The first certificate of the file
    #[must_use]
    pub fn leaf(&self) -> &CertificateDer<'static> {
        &self.certificates[0]
    }

    /// Number of certificates
    #[must_use]
    pub fn len(&self) -> usize {
        self.certificates.len()
    }

    /// Always false: empty chains are rejected at parse time
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }
}

fn decode_certificates(content: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    if content.is_empty() {
        return Ok(Vec::new());
    }

    if content.windows(10).any(|w| w == b"-----BEGIN") {
        let mut reader = content;
        rustls_pemfile::certs(&mut reader)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| TlsError::Parse(format!("Failed to parse PEM: {e}")))
    } else {
        // Raw DER holds exactly one certificate
        Ok(vec![CertificateDer::from(content.to_vec())])
    }
}

/// Cache of certificate chains keyed by file path
#[derive(Debug)]
pub struct CertificateChainCache {
    entries: CredentialCache<PathBuf, CertificateChain>,
}

impl Default for CertificateChainCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl CertificateChainCache {
    /// Create a cache bounded to `capacity` chains
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: CredentialCache::new("certificate chain", capacity),
        }
    }

    /// Return the chain for `path`, loading and caching it on first use
    ///
    /// # Errors
    ///
    /// - [`TlsError::NotFound`] if the file does not exist
    /// - [`TlsError::Parse`] if the content is malformed or empty
    pub fn from_file(&self, path: impl AsRef<Path>) -> Result<Arc<CertificateChain>> {
        let path = path.as_ref();
        if let Some(chain) = self.entries.get(&path.to_path_buf()) {
            tracing::debug!("Certificate chain cache hit for {}", path.display());
            return Ok(chain);
        }
        self.reload(path)
    }

    /// Parse `path` again and replace the cached chain on success
    ///
    /// A failed reload leaves any previously cached chain in place.
    ///
    /// # Errors
    ///
    /// Same as [`Self::from_file`].
    pub fn reload(&self, path: impl AsRef<Path>) -> Result<Arc<CertificateChain>> {
        EngineGuard::ensure_initialized()?;
        let path = path.as_ref();
        let content = std::fs::read(path).map_err(|e| TlsError::from_file_io(path, e))?;
        let chain = Arc::new(CertificateChain::parse(path, &content)?);

        tracing::info!(
            "Loaded {} certificate(s) from {}",
            chain.len(),
            path.display()
        );
        self.entries.insert(path.to_path_buf(), Arc::clone(&chain));
        Ok(chain)
    }

    /// Forget the cached chain for `path`
    pub fn evict(&self, path: impl AsRef<Path>) -> bool {
        self.entries.remove(&path.as_ref().to_path_buf()).is_some()
    }

    /// Drop chains loaded longer than `max_age` ago
    pub fn purge(&self, max_age: Duration) -> usize {
        self.entries.purge(max_age)
    }

    /// Number of cached chains
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no chain is cached
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cache statistics as `(hits, misses)`
    #[must_use]
    pub fn stats(&self) -> (usize, usize) {
        self.entries.stats()
    }
}
