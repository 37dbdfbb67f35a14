//! Per-connection TLS session over a caller-supplied transport
//!
//! A session is driven entirely by its caller. `handshake()` performs one
//! non-blocking step and is called again until it reports completion, so many
//! sessions can share one readiness loop. States only move forward:
//!
//! ```text
//! Unconfigured -> Handshaking -> Active -> Disconnected
//! ```

use std::fmt;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::ServerName;
use rustls::{
    ClientConfig, ClientConnection, Connection, NamedGroup, ServerConfig, ServerConnection,
};

use crate::certificate::CertificateSummary;
use crate::config::{ProtocolVersion, SessionOptions};
use crate::credentials::{CredentialStore, Credentials};
use crate::engine::EngineGuard;
use crate::error::{Result, TlsError};
use crate::logging::LoggingTransformer;
use crate::transport::{PullAdapter, PushAdapter, Transport};
use crate::verify::{DeferredClientVerifier, DeferredServerVerifier, VerifyContext, VerifyStatus};

/// Which end of the connection a session plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Outgoing connection; the session sends the first flight
    Client,
    /// Incoming connection; the session presents a server certificate
    Server,
}

/// Session lifecycle states, in the only order they can be visited
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionState {
    /// Credentials and engine configuration are being built
    Unconfigured,
    /// The protocol handshake is in progress
    Handshaking,
    /// Application data may flow
    Active,
    /// The engine connection has been released
    Disconnected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unconfigured => "unconfigured",
            Self::Handshaking => "handshaking",
            Self::Active => "active",
            Self::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Who the session talks to
///
/// The host is the TLS server name for client sessions and the name checked
/// by [`Session::verify`]. The address is only used in logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    /// Host name or IP literal
    pub host: String,
    /// Remote socket address, if known
    pub address: Option<SocketAddr>,
}

impl PeerIdentity {
    /// Peer known by name only
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            address: None,
        }
    }

    /// Attach the remote socket address
    #[must_use]
    pub fn with_address(mut self, address: SocketAddr) -> Self {
        self.address = Some(address);
        self
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address {
            Some(address) => write!(f, "{} ({})", self.host, address),
            None => f.write_str(&self.host),
        }
    }
}

/// Parameters negotiated by a completed handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Protocol version in use
    pub protocol: Option<ProtocolVersion>,
    /// Cipher suite name, e.g. `TLS13_AES_256_GCM_SHA384`
    pub cipher_suite: String,
    /// Key-exchange group, absent for resumed TLS 1.2 sessions
    pub key_exchange_group: Option<NamedGroup>,
    /// Record compression; TLS compression is never negotiated
    pub compression: &'static str,
    /// Subject of the peer's leaf certificate, if one was presented
    pub peer_subject: Option<String>,
}

impl fmt::Display for SessionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.protocol {
            Some(protocol) => write!(f, "{protocol}")?,
            None => f.write_str("unknown")?,
        }
        write!(f, ", {}", self.cipher_suite)?;
        match self.key_exchange_group {
            Some(group) => write!(f, ", {group:?}")?,
            None => f.write_str(", no key exchange")?,
        }
        write!(f, ", compression {}", self.compression)?;
        if let Some(subject) = &self.peer_subject {
            write!(f, ", peer {subject}")?;
        }
        Ok(())
    }
}

/// One TLS connection over a [`Transport`]
pub struct Session {
    direction: Direction,
    options: Arc<SessionOptions>,
    peer: PeerIdentity,
    transport: Box<dyn Transport>,
    store: Arc<CredentialStore>,
    provider: Arc<CryptoProvider>,
    credentials: Option<Credentials>,
    state: SessionState,
    connection: Option<Connection>,
    negotiated: Option<SessionInfo>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("direction", &self.direction)
            .field("peer", &self.peer)
            .field("state", &self.state)
            .field("negotiated", &self.negotiated)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a session using the process-wide credential store
    ///
    /// # Errors
    ///
    /// See [`Session::with_store`].
    pub fn new(
        direction: Direction,
        transport: impl Transport + 'static,
        peer: PeerIdentity,
        options: impl Into<Arc<SessionOptions>>,
    ) -> Result<Self> {
        Self::with_store(direction, transport, peer, options, CredentialStore::global())
    }

    /// Create a session that loads credentials through `store`
    ///
    /// On success the session is `Handshaking`. On failure no session exists.
    ///
    /// # Errors
    ///
    /// - [`TlsError::Configuration`] for inconsistent options or options the
    ///   engine rejects
    /// - any credential loading error, unchanged
    pub fn with_store(
        direction: Direction,
        transport: impl Transport + 'static,
        peer: PeerIdentity,
        options: impl Into<Arc<SessionOptions>>,
        store: Arc<CredentialStore>,
    ) -> Result<Self> {
        let base = EngineGuard::ensure_initialized()?;
        let options = options.into();

        let mut session = Self {
            direction,
            options,
            peer,
            transport: Box::new(transport),
            store,
            provider: base,
            credentials: None,
            state: SessionState::Unconfigured,
            connection: None,
            negotiated: None,
        };
        session.configure()?;
        Ok(session)
    }

    fn configure(&mut self) -> Result<()> {
        self.options.validate()?;
        let credentials = Credentials::resolve(self.direction, &self.options, &self.store)?;
        let provider = Arc::new(session_provider(
            &self.provider,
            &self.options,
            self.direction,
            &credentials,
        )?);
        let versions = self.options.protocol_versions();

        let connection = match self.direction {
            Direction::Client => {
                let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
                    .with_protocol_versions(&versions)
                    .map_err(config_error)?
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(DeferredServerVerifier::new(
                        &provider,
                    )));
                let config = match (credentials.chain(), credentials.key()) {
                    (Some(chain), Some(key)) => builder
                        .with_client_auth_cert(chain.certificates().to_vec(), key.key_der())
                        .map_err(config_error)?,
                    _ => builder.with_no_client_auth(),
                };
                let server_name = ServerName::try_from(self.peer.host.clone()).map_err(|e| {
                    TlsError::Configuration(format!("Invalid server name {}: {e}", self.peer.host))
                })?;
                Connection::Client(
                    ClientConnection::new(Arc::new(config), server_name).map_err(config_error)?,
                )
            }
            Direction::Server => {
                let builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
                    .with_protocol_versions(&versions)
                    .map_err(config_error)?;
                let builder = if self.options.verify_peer {
                    let verifier = DeferredClientVerifier::new(&provider);
                    builder.with_client_cert_verifier(Arc::new(verifier))
                } else {
                    builder.with_no_client_auth()
                };
                let (chain, key) = match (credentials.chain(), credentials.key()) {
                    (Some(chain), Some(key)) => (chain, key),
                    _ => {
                        return Err(TlsError::Configuration(
                            "Server sessions require a certificate and key".to_string(),
                        ))
                    }
                };
                let config = builder
                    .with_single_cert(chain.certificates().to_vec(), key.key_der())
                    .map_err(config_error)?;
                Connection::Server(ServerConnection::new(Arc::new(config)).map_err(config_error)?)
            }
        };

        self.provider = provider;
        self.credentials = Some(credentials);
        self.connection = Some(connection);
        self.transition(SessionState::Handshaking);
        Ok(())
    }

    /// Advance the handshake as far as the transport allows
    ///
    /// Returns `Ok(true)` once the handshake is complete (and on every later
    /// call while active) and `Ok(false)` when the transport is not ready and
    /// the call must be repeated. A transport that accepts zero bytes counts
    /// as not ready.
    ///
    /// # Errors
    ///
    /// - [`TlsError::Handshake`] for protocol failures, after which the
    ///   session is disconnected
    /// - [`TlsError::Io`] for transport failures, also terminal
    /// - [`TlsError::Usage`] if the session is already disconnected
    pub fn handshake(&mut self) -> Result<bool> {
        match self.state {
            SessionState::Active => return Ok(true),
            SessionState::Handshaking => {}
            state => {
                return Err(TlsError::Usage(format!("Cannot handshake a session that is {state}")))
            }
        }

        loop {
            let Some(conn) = self.connection.as_mut() else {
                return Err(TlsError::Usage("Session has no engine connection".to_string()));
            };

            while conn.wants_write() {
                match conn.write_tls(&mut PushAdapter(self.transport.as_mut())) {
                    Ok(0) => return Ok(false),
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                    Err(e) => return Err(self.fail("handshake", TlsError::Io(e))),
                }
            }

            if !conn.is_handshaking() {
                self.establish();
                return Ok(true);
            }

            match conn.read_tls(&mut PullAdapter(self.transport.as_mut())) {
                Ok(0) => {
                    let closed = "Peer closed the connection during the handshake";
                    return Err(self.fail("handshake", TlsError::Handshake(closed.to_string())));
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(self.fail("handshake", TlsError::Io(e))),
            }

            if let Err(e) = conn.process_new_packets() {
                // Best effort: let the peer see the alert
                while conn.wants_write() {
                    match conn.write_tls(&mut PushAdapter(self.transport.as_mut())) {
                        Ok(n) if n > 0 => {}
                        _ => break,
                    }
                }
                return Err(self.fail("handshake", TlsError::from(e)));
            }
        }
    }

    /// Check the peer certificate against the configured policy
    ///
    /// Never changes the session state.
    pub fn verify(&self) -> VerifyStatus {
        if self.state != SessionState::Active {
            return VerifyStatus::NotEstablished;
        }
        let presented = self
            .connection
            .as_ref()
            .and_then(|conn| conn.peer_certificates())
            .unwrap_or_default();

        VerifyContext {
            direction: self.direction,
            options: &self.options,
            peer: &self.peer,
            certificates: &self.store.certificates,
            provider: &self.provider,
        }
        .verify(presented)
    }

    /// Read decrypted application data
    ///
    /// Returns `Ok(0)` once the peer has closed the session cleanly, and only
    /// then.
    ///
    /// # Errors
    ///
    /// - [`TlsError::Usage`] unless the session is active, or if `buf` is
    ///   empty; no I/O happens
    /// - [`TlsError::WouldBlock`] when no complete record is available yet
    /// - [`TlsError::Io`] or [`TlsError::Handshake`] for terminal failures
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.require_active("read")?;
        if buf.is_empty() {
            return Err(TlsError::Usage("Cannot read into an empty buffer".to_string()));
        }

        loop {
            let Some(conn) = self.connection.as_mut() else {
                return Err(TlsError::Usage("Session has no engine connection".to_string()));
            };

            match conn.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(self.fail("read", TlsError::Io(e))),
            }

            match conn.read_tls(&mut PullAdapter(self.transport.as_mut())) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Err(TlsError::WouldBlock)
                }
                Err(e) => return Err(self.fail("read", TlsError::Io(e))),
            }

            if let Err(e) = conn.process_new_packets() {
                let _ = conn.write_tls(&mut PushAdapter(self.transport.as_mut()));
                return Err(self.fail("read", TlsError::from(e)));
            }

            // Post-handshake messages such as key updates may need a reply
            if let Err(e) = self.flush() {
                return Err(self.fail("read", e));
            }
        }
    }

    /// Encrypt and send application data
    ///
    /// Returns how many bytes the engine accepted. Data the transport could not
    /// take yet stays buffered and is sent by later calls.
    ///
    /// # Errors
    ///
    /// - [`TlsError::Usage`] unless the session is active; no I/O happens
    /// - [`TlsError::WouldBlock`] if the engine's send buffer is full
    /// - [`TlsError::Io`] for terminal transport failures
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.require_active("write")?;
        let Some(conn) = self.connection.as_mut() else {
            return Err(TlsError::Usage("Session has no engine connection".to_string()));
        };

        let accepted = match conn.writer().write(buf) {
            Ok(n) => n,
            Err(e) => return Err(self.fail("write", TlsError::Io(e))),
        };

        if let Err(e) = self.flush() {
            return Err(self.fail("write", e));
        }

        if accepted == 0 && !buf.is_empty() {
            return Err(TlsError::WouldBlock);
        }
        Ok(accepted)
    }

    /// Parameters negotiated by the handshake
    ///
    /// Still available after the session is disconnected.
    ///
    /// # Errors
    ///
    /// Returns [`TlsError::Usage`] if the handshake never completed.
    pub fn session_info(&self) -> Result<SessionInfo> {
        self.negotiated.clone().ok_or_else(|| {
            TlsError::Usage(format!(
                "No session information while the session is {}",
                self.state
            ))
        })
    }

    /// Close the session and release the engine connection
    ///
    /// An active session sends `close_notify` first, best effort. Calling this
    /// again has no effect.
    pub fn disconnect(&mut self) {
        if self.state == SessionState::Disconnected {
            return;
        }

        if let Some(mut conn) = self.connection.take() {
            if self.state == SessionState::Active {
                conn.send_close_notify();
                while conn.wants_write() {
                    match conn.write_tls(&mut PushAdapter(self.transport.as_mut())) {
                        Ok(n) if n > 0 => {}
                        _ => break,
                    }
                }
            }
        }
        self.transition(SessionState::Disconnected);
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether application data may flow
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    /// Which end of the connection this session plays
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// The remote peer
    #[must_use]
    pub fn peer(&self) -> &PeerIdentity {
        &self.peer
    }

    /// Credentials this session presents
    #[must_use]
    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    /// Options the session was created with
    #[must_use]
    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    fn require_active(&self, operation: &str) -> Result<()> {
        if self.state == SessionState::Active {
            Ok(())
        } else {
            Err(TlsError::Usage(format!(
                "Cannot {operation} while the session is {}",
                self.state
            )))
        }
    }

    fn flush(&mut self) -> Result<()> {
        let Some(conn) = self.connection.as_mut() else {
            return Ok(());
        };
        while conn.wants_write() {
            match conn.write_tls(&mut PushAdapter(self.transport.as_mut())) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(TlsError::Io(e)),
            }
        }
        Ok(())
    }

    fn establish(&mut self) {
        if let Some(conn) = self.connection.as_ref() {
            let info = SessionInfo {
                protocol: conn.protocol_version().and_then(|v| match v {
                    rustls::ProtocolVersion::TLSv1_2 => Some(ProtocolVersion::Tls12),
                    rustls::ProtocolVersion::TLSv1_3 => Some(ProtocolVersion::Tls13),
                    _ => None,
                }),
                cipher_suite: conn
                    .negotiated_cipher_suite()
                    .map(|suite| suite_name(&suite))
                    .unwrap_or_default(),
                key_exchange_group: conn.negotiated_key_exchange_group().map(|group| group.name()),
                compression: "null",
                peer_subject: conn
                    .peer_certificates()
                    .and_then(|certs| certs.first())
                    .and_then(|leaf| CertificateSummary::from_der(leaf.as_ref()).ok())
                    .map(|summary| summary.subject),
            };
            tracing::info!("Session with {} established: {}", self.peer, info);
            self.negotiated = Some(info);
        }
        self.transition(SessionState::Active);
    }

    fn transition(&mut self, next: SessionState) {
        if next <= self.state {
            return;
        }
        LoggingTransformer::log_session_event(
            &self.peer.to_string(),
            &format!("{} -> {}", self.state, next),
        );
        self.state = next;
    }

    fn fail(&mut self, operation: &str, error: TlsError) -> TlsError {
        LoggingTransformer::log_session_failure(&self.peer.to_string(), operation, &error);
        self.connection = None;
        self.transition(SessionState::Disconnected);
        error
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn config_error(e: rustls::Error) -> TlsError {
    TlsError::Configuration(e.to_string())
}

pub(crate) fn suite_name(suite: &rustls::SupportedCipherSuite) -> String {
    format!("{:?}", suite.suite())
}

/// Engine provider narrowed to this session's suites and key-exchange groups
fn session_provider(
    base: &CryptoProvider,
    options: &SessionOptions,
    direction: Direction,
    credentials: &Credentials,
) -> Result<CryptoProvider> {
    let mut provider = base.clone();

    if !options.cipher_priority.is_empty() {
        let mut suites = Vec::with_capacity(options.cipher_priority.len());
        for name in &options.cipher_priority {
            match base
                .cipher_suites
                .iter()
                .find(|suite| suite_name(suite).eq_ignore_ascii_case(name))
            {
                Some(suite) => suites.push(*suite),
                None => tracing::warn!("Ignoring unknown cipher suite {}", name),
            }
        }
        if suites.is_empty() {
            return Err(TlsError::Configuration(
                "cipher_priority names no supported cipher suite".to_string(),
            ));
        }
        provider.cipher_suites = suites;
    }

    if let Some(params) = credentials.dh_params() {
        let Some(group) = params.kx_group() else {
            tracing::warn!("Not offering FFDHE; falling back to ECDHE key exchange");
            return Ok(provider);
        };
        match direction {
            Direction::Server => provider.kx_groups.push(group),
            Direction::Client => provider.kx_groups.insert(0, group),
        }
        tracing::debug!(
            "Offering {}-bit FFDHE group {}",
            params.bits(),
            &params.fingerprint()[..16]
        );
    }

    Ok(provider)
}
