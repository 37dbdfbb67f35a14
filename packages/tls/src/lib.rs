//! TLS credential management and session orchestration
//!
//! This crate sits above the `rustls` protocol engine. It loads and caches
//! credential material (certificate chains, private keys and Diffie-Hellman
//! parameters) and drives each connection's handshake, I/O and teardown over a
//! transport supplied by the caller. It never opens sockets itself.
//!
//! ```no_run
//! use cryypt_tls::{Direction, PeerIdentity, Session, SessionOptions, StreamTransport};
//! use std::net::TcpStream;
//!
//! # fn main() -> cryypt_tls::Result<()> {
//! let stream = TcpStream::connect("example.com:443")?;
//! let options = SessionOptions::new().with_verify_peer(true);
//! let mut session = Session::new(
//!     Direction::Client,
//!     StreamTransport::new(stream),
//!     PeerIdentity::new("example.com"),
//!     options,
//! )?;
//! while !session.handshake()? {}
//! assert!(session.verify().is_ok());
//! session.write(b"GET / HTTP/1.0\r\n\r\n")?;
//! session.disconnect();
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod certificate;
pub mod config;
pub mod credentials;
pub mod dh;
pub mod engine;
pub mod error;
pub mod key;
pub mod logging;
pub mod session;
pub mod transport;
pub mod verify;

pub use certificate::{CertificateChain, CertificateChainCache, CertificateSummary};
pub use config::{ProtocolVersion, SessionOptions};
pub use credentials::{CredentialStore, Credentials};
pub use dh::{DhParamCache, DhParams, DhSettings, MAX_REGISTERED_GROUPS, MIN_DH_BITS};
pub use engine::EngineGuard;
pub use error::{Result, TlsError};
pub use key::{encrypt_pkcs8_pem, KeyFormat, PrivateKey, PrivateKeyCache};
pub use logging::LoggingTransformer;
pub use session::{Direction, PeerIdentity, Session, SessionInfo, SessionState};
pub use transport::{HookTransport, MemoryTransport, StreamTransport, Transport};
pub use verify::VerifyStatus;
