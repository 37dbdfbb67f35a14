//! Diffie-Hellman parameters for server key exchange
//!
//! [`DhParamCache`] keeps an auto-regenerating "current" parameter set and a
//! separate cache of sets loaded from files. Generation is slow, so after the
//! first set exists a background thread produces replacements and publishes
//! them with an atomic swap; readers never wait on generation.

pub mod kx;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use arc_swap::ArcSwapOption;
use crossbeam_channel::{RecvTimeoutError, Sender};
use der::asn1::UintRef;
use der::{Decode, Encode, Sequence};
use num_bigint::BigUint;
use rustls::crypto::SupportedKxGroup;

use crate::cache::{CredentialCache, DEFAULT_CAPACITY};
use crate::engine::EngineGuard;
use crate::error::{Result, TlsError};

pub use kx::{registered_groups, FfdheGroup, FFDHE_PRIVATE_GROUP, MAX_REGISTERED_GROUPS};

/// Smallest prime size accepted for generation or loading, in bits
pub const MIN_DH_BITS: usize = 256;

const PEM_TAG: &str = "DH PARAMETERS";
const GENERATION_ATTEMPTS: usize = 8;

/// PKCS#3 `DHParameter`
#[derive(Sequence)]
struct DhParameter<'a> {
    prime: UintRef<'a>,
    base: UintRef<'a>,
    #[asn1(optional = "true")]
    private_value_length: Option<u32>,
}

/// Tuning knobs for [`DhParamCache`]
#[derive(Debug, Clone)]
pub struct DhSettings {
    /// Prime size for generated parameters
    pub bits: usize,
    /// Delay between background regenerations
    ///
    /// Every new parameter set a session uses is registered with the engine
    /// for the life of the process, up to [`MAX_REGISTERED_GROUPS`] sets.
    /// After that, sessions using a new set fall back to the ECDHE groups.
    /// Keep the interval long enough that regenerations stay under that
    /// bound.
    pub refresh_interval: Duration,
    /// Number of file-loaded parameter sets kept
    pub file_cache_capacity: usize,
}

impl Default for DhSettings {
    fn default() -> Self {
        Self {
            bits: 2048,
            refresh_interval: Duration::from_secs(24 * 3600),
            file_cache_capacity: DEFAULT_CAPACITY,
        }
    }
}

/// Immutable Diffie-Hellman parameter set
#[derive(Debug)]
pub struct DhParams {
    generated_at: SystemTime,
    source_path: Option<PathBuf>,
    prime: BigUint,
    generator: BigUint,
}

impl DhParams {
    /// Generate a fresh safe-prime parameter set with generator 2
    ///
    /// This is CPU-bound and slow for production sizes; keep it off any
    /// latency-sensitive path.
    ///
    /// # Errors
    ///
    /// Returns [`TlsError::Generation`] if `bits` is below [`MIN_DH_BITS`] or
    /// prime generation fails.
    pub fn generate(bits: usize) -> Result<Self> {
        EngineGuard::ensure_initialized()?;
        if bits < MIN_DH_BITS {
            return Err(TlsError::Generation(format!(
                "{bits}-bit parameters requested, minimum is {MIN_DH_BITS}"
            )));
        }

        let mut attempts = 0;
        let prime = loop {
            let candidate = glass_pumpkin::safe_prime::new(bits)
                .map_err(|e| TlsError::Generation(format!("Safe prime generation failed: {e:?}")))?;
            if candidate.bits() as usize == bits {
                break candidate;
            }
            attempts += 1;
            if attempts >= GENERATION_ATTEMPTS {
                return Err(TlsError::Generation(format!(
                    "No {bits}-bit safe prime after {attempts} attempts"
                )));
            }
        };

        Ok(Self {
            generated_at: SystemTime::now(),
            source_path: None,
            prime,
            generator: BigUint::from(2u32),
        })
    }

    /// Load a parameter set from a PKCS#3 PEM or DER file
    ///
    /// # Errors
    ///
    /// - [`TlsError::NotFound`] if the file does not exist
    /// - [`TlsError::Parse`] if the content is malformed
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read(path).map_err(|e| TlsError::from_file_io(path, e))?;
        let mut params = Self::parse(&content)?;
        params.source_path = Some(path.to_path_buf());
        Ok(params)
    }

    /// Parse a PKCS#3 PEM or DER record
    ///
    /// # Errors
    ///
    /// Returns [`TlsError::Parse`] for malformed or unusable parameters.
    pub fn parse(content: &[u8]) -> Result<Self> {
        EngineGuard::ensure_initialized()?;
        if content.is_empty() {
            return Err(TlsError::Parse("DH parameter file is empty".to_string()));
        }

        let der = if content.windows(10).any(|w| w == b"-----BEGIN") {
            pem::parse_many(content)
                .map_err(|e| TlsError::Parse(format!("Failed to parse PEM: {e}")))?
                .into_iter()
                .find(|block| block.tag() == PEM_TAG)
                .ok_or_else(|| TlsError::Parse("No DH PARAMETERS record found".to_string()))?
                .into_contents()
        } else {
            content.to_vec()
        };

        let record = DhParameter::from_der(&der)
            .map_err(|e| TlsError::Parse(format!("Malformed DH parameters: {e}")))?;
        let prime = BigUint::from_bytes_be(record.prime.as_bytes());
        let generator = BigUint::from_bytes_be(record.base.as_bytes());

        let bits = prime.bits() as usize;
        if bits < MIN_DH_BITS || !prime.bit(0) {
            return Err(TlsError::Parse(format!(
                "DH prime must be odd and at least {MIN_DH_BITS} bits, got {bits} bits"
            )));
        }
        if generator < BigUint::from(2u32) || generator >= &prime - 1u32 {
            return Err(TlsError::Parse("DH generator out of range".to_string()));
        }

        Ok(Self {
            generated_at: SystemTime::now(),
            source_path: None,
            prime,
            generator,
        })
    }

    /// Encode as a PKCS#3 DER record
    ///
    /// # Errors
    ///
    /// Returns [`TlsError::Parse`] if encoding fails.
    pub fn to_der(&self) -> Result<Vec<u8>> {
        let prime = self.prime.to_bytes_be();
        let base = self.generator.to_bytes_be();
        let record = DhParameter {
            prime: UintRef::new(&prime).map_err(|e| TlsError::Parse(e.to_string()))?,
            base: UintRef::new(&base).map_err(|e| TlsError::Parse(e.to_string()))?,
            private_value_length: None,
        };
        record
            .to_der()
            .map_err(|e| TlsError::Parse(format!("DH parameter encoding failed: {e}")))
    }

    /// Encode as a `DH PARAMETERS` PEM record
    ///
    /// # Errors
    ///
    /// Returns [`TlsError::Parse`] if encoding fails.
    pub fn to_pem(&self) -> Result<String> {
        Ok(pem::encode(&pem::Pem::new(PEM_TAG, self.to_der()?)))
    }

    /// When the set was generated or loaded
    #[must_use]
    pub fn generated_at(&self) -> SystemTime {
        self.generated_at
    }

    /// File the set was loaded from, `None` for generated sets
    #[must_use]
    pub fn source_path(&self) -> Option<&Path> {
        self.source_path.as_deref()
    }

    /// The prime modulus
    #[must_use]
    pub fn prime(&self) -> &BigUint {
        &self.prime
    }

    /// The generator
    #[must_use]
    pub fn generator(&self) -> &BigUint {
        &self.generator
    }

    /// Size of the prime in bits
    #[must_use]
    pub fn bits(&self) -> usize {
        self.prime.bits() as usize
    }

    /// Hex SHA-256 fingerprint of prime and generator
    #[must_use]
    pub fn fingerprint(&self) -> String {
        kx::fingerprint(&self.prime, &self.generator)
    }

    /// Engine key-exchange group over this parameter set
    ///
    /// `None` if the group registry is full; see [`MAX_REGISTERED_GROUPS`].
    #[must_use]
    pub fn kx_group(&self) -> Option<&'static dyn SupportedKxGroup> {
        kx::intern(&self.prime, &self.generator).map(|group| group as &'static dyn SupportedKxGroup)
    }
}

#[derive(Debug)]
struct Shared {
    settings: DhSettings,
    current: ArcSwapOption<DhParams>,
    first_generation: Mutex<()>,
    files: CredentialCache<PathBuf, DhParams>,
    generations: AtomicUsize,
}

impl Shared {
    fn generate(&self) -> Result<Arc<DhParams>> {
        let started = Instant::now();
        let params = match DhParams::generate(self.settings.bits) {
            Ok(params) => Arc::new(params),
            Err(e) => {
                tracing::error!("DH parameter generation failed, keeping current set: {}", e);
                return Err(e);
            }
        };

        self.current.store(Some(Arc::clone(&params)));
        self.generations.fetch_add(1, Ordering::SeqCst);
        tracing::info!(
            "Generated {}-bit DH parameters in {:?}",
            self.settings.bits,
            started.elapsed()
        );
        Ok(params)
    }
}

#[derive(Debug)]
struct Refresher {
    // Dropping the sender wakes the thread and ends it
    _stop: Sender<()>,
    _handle: JoinHandle<()>,
}

/// Current and file-loaded Diffie-Hellman parameters
#[derive(Debug)]
pub struct DhParamCache {
    shared: Arc<Shared>,
    refresher: Mutex<Option<Refresher>>,
}

impl Default for DhParamCache {
    fn default() -> Self {
        Self::new(DhSettings::default())
    }
}

impl DhParamCache {
    /// Create an empty cache; nothing is generated until first use
    #[must_use]
    pub fn new(settings: DhSettings) -> Self {
        let files = CredentialCache::new("DH parameter", settings.file_cache_capacity);
        Self {
            shared: Arc::new(Shared {
                settings,
                current: ArcSwapOption::empty(),
                first_generation: Mutex::new(()),
                files,
                generations: AtomicUsize::new(0),
            }),
            refresher: Mutex::new(None),
        }
    }

    /// Settings this cache was created with
    #[must_use]
    pub fn settings(&self) -> &DhSettings {
        &self.shared.settings
    }

    /// The most recent parameter set, generating one synchronously if none
    /// exists yet
    ///
    /// Once a set exists this is a lock-free snapshot load and never waits on
    /// a regeneration in progress.
    ///
    /// # Errors
    ///
    /// Returns [`TlsError::Generation`] if the first generation fails.
    pub fn current(&self) -> Result<Arc<DhParams>> {
        if let Some(params) = self.shared.current.load_full() {
            return Ok(params);
        }

        let _first = lock(&self.shared.first_generation);
        if let Some(params) = self.shared.current.load_full() {
            return Ok(params);
        }

        tracing::info!(
            "No DH parameters available, generating {} bits synchronously",
            self.shared.settings.bits
        );
        let params = self.shared.generate()?;
        self.start_refresh();
        Ok(params)
    }

    /// Current set if one exists, without generating
    #[must_use]
    pub fn peek(&self) -> Option<Arc<DhParams>> {
        self.shared.current.load_full()
    }

    /// Generate a new set and publish it as current
    ///
    /// On failure the previous current set stays in use.
    ///
    /// # Errors
    ///
    /// Returns [`TlsError::Generation`] if generation fails.
    pub fn generate(&self) -> Result<Arc<DhParams>> {
        let params = self.shared.generate()?;
        self.start_refresh();
        Ok(params)
    }

    /// Load a parameter set from a file, caching it by path
    ///
    /// File-loaded sets are independent of the current set.
    ///
    /// # Errors
    ///
    /// - [`TlsError::NotFound`] if the file does not exist
    /// - [`TlsError::Parse`] if the content is malformed
    pub fn from_file(&self, path: impl AsRef<Path>) -> Result<Arc<DhParams>> {
        let path = path.as_ref();
        if let Some(params) = self.shared.files.get(&path.to_path_buf()) {
            tracing::debug!("DH parameter cache hit for {}", path.display());
            return Ok(params);
        }

        let params = Arc::new(DhParams::from_file(path)?);
        tracing::info!(
            "Loaded {}-bit DH parameters from {}",
            params.bits(),
            path.display()
        );
        self.shared
            .files
            .insert(path.to_path_buf(), Arc::clone(&params));
        Ok(params)
    }

    /// Number of successful generations so far
    #[must_use]
    pub fn generations(&self) -> usize {
        self.shared.generations.load(Ordering::SeqCst)
    }

    /// Whether the background refresh thread is running
    #[must_use]
    pub fn is_refreshing(&self) -> bool {
        lock(&self.refresher).is_some()
    }

    /// Stop background regeneration; returns whether it was running
    pub fn stop_refresh(&self) -> bool {
        lock(&self.refresher).take().is_some()
    }

    /// Drop file-loaded sets older than `max_age`
    pub fn purge(&self, max_age: Duration) -> usize {
        self.shared.files.purge(max_age)
    }

    fn start_refresh(&self) {
        let mut slot = lock(&self.refresher);
        if slot.is_some() {
            return;
        }

        let (stop, stopped) = crossbeam_channel::bounded::<()>(1);
        let shared = Arc::downgrade(&self.shared);
        let interval = self.shared.settings.refresh_interval;

        let spawned = std::thread::Builder::new()
            .name("dh-param-refresh".to_string())
            .spawn(move || loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    _ => break,
                }
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                // Failures are logged inside; the previous set stays current
                let _ = shared.generate();
            });

        match spawned {
            Ok(handle) => {
                tracing::debug!("DH parameter refresh every {:?}", interval);
                *slot = Some(Refresher {
                    _stop: stop,
                    _handle: handle,
                });
            }
            Err(e) => tracing::error!("Failed to start DH parameter refresh thread: {}", e),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
