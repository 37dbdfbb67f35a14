//! Private key loading, decryption and caching
//!
//! Keys are cached per `(path, password)` pair. The password itself is never
//! stored: the cache key carries a SHA-256 digest bound to the path, which is
//! enough to recognise a repeated request without keeping the secret around.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use pkcs8::pkcs5::pbes2;
use pkcs8::{EncryptedPrivateKeyInfo, PrivateKeyInfo};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs1KeyDer, PrivatePkcs8KeyDer, PrivateSec1KeyDer};
use rustls::sign::SigningKey;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::cache::{CredentialCache, DEFAULT_CAPACITY};
use crate::engine::EngineGuard;
use crate::error::{Result, TlsError};

const ENCRYPTED_PKCS8_TAG: &str = "ENCRYPTED PRIVATE KEY";
const PKCS8_TAG: &str = "PRIVATE KEY";
const PKCS1_TAG: &str = "RSA PRIVATE KEY";
const SEC1_TAG: &str = "EC PRIVATE KEY";

/// PBKDF2 rounds used by [`encrypt_pkcs8_pem`]
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// Encoding the key was stored in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFormat {
    /// Unencrypted PKCS#8
    Pkcs8,
    /// PKCS#8 protected with PBES2
    EncryptedPkcs8,
    /// PKCS#1 RSA key
    Pkcs1,
    /// SEC1 elliptic-curve key
    Sec1,
}

/// Decrypted private key, validated as a usable signing key
pub struct PrivateKey {
    loaded_at: SystemTime,
    source_path: PathBuf,
    password_digest: [u8; 32],
    format: KeyFormat,
    der: Zeroizing<Vec<u8>>,
    signing_key: Arc<dyn SigningKey>,
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey")
            .field("loaded_at", &self.loaded_at)
            .field("source_path", &self.source_path)
            .field("format", &self.format)
            .field("algorithm", &self.signing_key.algorithm())
            .finish_non_exhaustive()
    }
}

impl PrivateKey {
    /// Decode (and if needed decrypt) key file content
    ///
    /// # Errors
    ///
    /// - [`TlsError::Parse`] if no key record is found or the key is not usable
    /// - [`TlsError::Decryption`] if the key is encrypted and the password is
    ///   missing or wrong
    pub fn parse(source_path: &Path, content: &[u8], password: Option<&str>) -> Result<Self> {
        let provider = EngineGuard::ensure_initialized()?;
        let (format, der) = decode_key(content, password)?;

        let signing_key = provider
            .key_provider
            .load_private_key(key_der(format, &der))
            .map_err(|e| TlsError::Parse(format!("Unsupported private key: {e}")))?;

        Ok(Self {
            loaded_at: SystemTime::now(),
            source_path: source_path.to_path_buf(),
            password_digest: password_digest(source_path, password),
            format,
            der,
            signing_key,
        })
    }

    /// When the key was loaded
    #[must_use]
    pub fn loaded_at(&self) -> SystemTime {
        self.loaded_at
    }

    /// File the key came from
    #[must_use]
    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    /// Storage format of the key file
    #[must_use]
    pub fn format(&self) -> KeyFormat {
        self.format
    }

    /// Engine signing handle for this key
    #[must_use]
    pub fn signing_key(&self) -> Arc<dyn SigningKey> {
        Arc::clone(&self.signing_key)
    }

    /// Fresh copy of the decrypted key for engine configuration
    #[must_use]
    pub fn key_der(&self) -> PrivateKeyDer<'static> {
        key_der(self.format, &self.der)
    }

    /// Whether `password` is the one this key was loaded with
    #[must_use]
    pub fn was_loaded_with(&self, password: Option<&str>) -> bool {
        self.password_digest == password_digest(&self.source_path, password)
    }
}

fn key_der(format: KeyFormat, der: &[u8]) -> PrivateKeyDer<'static> {
    match format {
        KeyFormat::Pkcs8 | KeyFormat::EncryptedPkcs8 => {
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(der.to_vec()))
        }
        KeyFormat::Pkcs1 => PrivateKeyDer::Pkcs1(PrivatePkcs1KeyDer::from(der.to_vec())),
        KeyFormat::Sec1 => PrivateKeyDer::Sec1(PrivateSec1KeyDer::from(der.to_vec())),
    }
}

fn password_digest(path: &Path, password: Option<&str>) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(path.as_os_str().as_encoded_bytes());
    match password {
        Some(password) => {
            hasher.update([1u8]);
            hasher.update(password.as_bytes());
        }
        None => hasher.update([0u8]),
    }
    hasher.finalize().into()
}

fn decode_key(content: &[u8], password: Option<&str>) -> Result<(KeyFormat, Zeroizing<Vec<u8>>)> {
    if content.is_empty() {
        return Err(TlsError::Parse("Key file is empty".to_string()));
    }

    if !content.windows(10).any(|w| w == b"-----BEGIN") {
        // DER: encrypted PKCS#8 if it decodes as such, plain PKCS#8 otherwise
        return match EncryptedPrivateKeyInfo::try_from(content) {
            Ok(_) => Ok((KeyFormat::EncryptedPkcs8, decrypt_pkcs8(content, password)?)),
            Err(_) => Ok((KeyFormat::Pkcs8, Zeroizing::new(content.to_vec()))),
        };
    }

    let blocks = pem::parse_many(content)
        .map_err(|e| TlsError::Parse(format!("Failed to parse PEM: {e}")))?;
    let block = blocks
        .into_iter()
        .find(|b| {
            matches!(
                b.tag(),
                ENCRYPTED_PKCS8_TAG | PKCS8_TAG | PKCS1_TAG | SEC1_TAG
            )
        })
        .ok_or_else(|| TlsError::Parse("No private key found in PEM data".to_string()))?;

    if block.headers().get("DEK-Info").is_some() {
        return Err(TlsError::Parse(
            "Legacy PEM encryption is not supported, convert the key to PKCS#8".to_string(),
        ));
    }

    let format = match block.tag() {
        ENCRYPTED_PKCS8_TAG => {
            return Ok((
                KeyFormat::EncryptedPkcs8,
                decrypt_pkcs8(block.contents(), password)?,
            ))
        }
        PKCS1_TAG => KeyFormat::Pkcs1,
        SEC1_TAG => KeyFormat::Sec1,
        _ => KeyFormat::Pkcs8,
    };
    Ok((format, Zeroizing::new(block.into_contents())))
}

fn decrypt_pkcs8(der: &[u8], password: Option<&str>) -> Result<Zeroizing<Vec<u8>>> {
    let password = password.ok_or_else(|| {
        TlsError::Decryption("Key is encrypted but no password was supplied".to_string())
    })?;

    let info = EncryptedPrivateKeyInfo::try_from(der)
        .map_err(|e| TlsError::Parse(format!("Malformed encrypted key: {e}")))?;
    let document = info
        .decrypt(password)
        .map_err(|e| TlsError::Decryption(e.to_string()))?;

    // Padding can occasionally survive a wrong password
    PrivateKeyInfo::try_from(document.as_bytes()).map_err(|e| {
        TlsError::Decryption(format!("Decrypted data is not a private key: {e}"))
    })?;

    Ok(Zeroizing::new(document.as_bytes().to_vec()))
}

/// Encrypt a PKCS#8 DER key into an `ENCRYPTED PRIVATE KEY` PEM record
///
/// Uses PBES2 with PBKDF2-SHA256 and AES-256-CBC, random salt and IV.
///
/// # Errors
///
/// Returns [`TlsError::Parse`] if `pkcs8_der` is not a PKCS#8 key.
pub fn encrypt_pkcs8_pem(pkcs8_der: &[u8], password: &str) -> Result<String> {
    let info = PrivateKeyInfo::try_from(pkcs8_der)
        .map_err(|e| TlsError::Parse(format!("Not a PKCS#8 private key: {e}")))?;

    let salt: [u8; 16] = rand::random();
    let iv: [u8; 16] = rand::random();
    let params = pbes2::Parameters::pbkdf2_sha256_aes256cbc(PBKDF2_ITERATIONS, &salt, &iv)
        .map_err(|e| TlsError::Configuration(format!("Invalid PBES2 parameters: {e}")))?;

    let document = info
        .encrypt_with_params(params, password)
        .map_err(|e| TlsError::Configuration(format!("Key encryption failed: {e}")))?;

    Ok(pem::encode(&pem::Pem::new(
        ENCRYPTED_PKCS8_TAG,
        document.as_bytes().to_vec(),
    )))
}

/// Cache of decrypted private keys keyed by path and password digest
#[derive(Debug)]
pub struct PrivateKeyCache {
    entries: CredentialCache<(PathBuf, [u8; 32]), PrivateKey>,
}

impl Default for PrivateKeyCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl PrivateKeyCache {
    /// Create a cache bounded to `capacity` keys
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: CredentialCache::new("private key", capacity),
        }
    }

    /// Load and decrypt the key at `path`, reusing a cached copy when the same
    /// password was used before
    ///
    /// Failed loads never create a cache entry.
    ///
    /// # Errors
    ///
    /// - [`TlsError::NotFound`] if the file does not exist
    /// - [`TlsError::Parse`] if the content is not a usable key
    /// - [`TlsError::Decryption`] if the password is missing or wrong
    pub fn from_file(
        &self,
        path: impl AsRef<Path>,
        password: Option<&str>,
    ) -> Result<Arc<PrivateKey>> {
        let path = path.as_ref();
        let cache_key = (path.to_path_buf(), password_digest(path, password));
        if let Some(key) = self.entries.get(&cache_key) {
            tracing::debug!("Private key cache hit for {}", path.display());
            return Ok(key);
        }

        let content =
            Zeroizing::new(std::fs::read(path).map_err(|e| TlsError::from_file_io(path, e))?);
        let key = match PrivateKey::parse(path, &content, password) {
            Ok(key) => Arc::new(key),
            Err(e) => {
                tracing::warn!("Failed to load private key from {}: {}", path.display(), e);
                return Err(e);
            }
        };

        tracing::info!(
            "Loaded {:?} private key from {}",
            key.format(),
            path.display()
        );
        self.entries.insert(cache_key, Arc::clone(&key));
        Ok(key)
    }

    /// Forget the cached key for `path` loaded with `password`
    pub fn evict(&self, path: impl AsRef<Path>, password: Option<&str>) -> bool {
        let path = path.as_ref();
        self.entries
            .remove(&(path.to_path_buf(), password_digest(path, password)))
            .is_some()
    }

    /// Drop keys loaded longer than `max_age` ago
    pub fn purge(&self, max_age: Duration) -> usize {
        self.entries.purge(max_age)
    }

    /// Number of cached keys
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no key is cached
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
