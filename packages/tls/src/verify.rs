//! Peer certificate verification
//!
//! The handshake accepts any well-formed peer certificate; handshake
//! signatures are still checked against the presented key. Trust decisions are
//! deferred to [`crate::Session::verify`], which runs the engine's WebPKI
//! verifier and reports the outcome as a [`VerifyStatus`] instead of tearing the
//! connection down.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{
    verify_tls12_signature, verify_tls13_signature, CryptoProvider, WebPkiSupportedAlgorithms,
};
use rustls::pki_types::{CertificateDer, CertificateRevocationListDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::{VerifierBuilderError, WebPkiClientVerifier};
use rustls::{
    CertificateError, DigitallySignedStruct, DistinguishedName, RootCertStore, SignatureScheme,
};

use crate::certificate::CertificateChainCache;
use crate::config::SessionOptions;
use crate::error::{Result, TlsError};
use crate::session::{Direction, PeerIdentity};

/// Outcome of peer verification
///
/// `Ok` is 0; every failure has a distinct negative code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum VerifyStatus {
    /// The peer passed every configured check, or no checks are configured
    Ok = 0,
    /// The session has not completed its handshake
    NotEstablished = -1,
    /// The peer presented no certificate
    NoCertificate = -2,
    /// No trust anchors are available to verify against
    NoTrustAnchors = -3,
    /// The chain does not lead to a trusted anchor
    UnknownIssuer = -4,
    /// A certificate in the chain has expired
    Expired = -5,
    /// A certificate in the chain is not yet valid
    NotValidYet = -6,
    /// A certificate in the chain is revoked
    Revoked = -7,
    /// The leaf is not valid for the peer's name
    NameMismatch = -8,
    /// A chain signature is invalid
    BadSignature = -9,
    /// Any other verification failure
    Invalid = -10,
}

impl VerifyStatus {
    /// Integer status code
    #[must_use]
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Whether verification passed
    #[must_use]
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }

    fn from_engine_error(error: &rustls::Error) -> Self {
        match error {
            rustls::Error::InvalidCertificate(cert_error) => match cert_error {
                CertificateError::UnknownIssuer => Self::UnknownIssuer,
                CertificateError::Expired | CertificateError::ExpiredContext { .. } => {
                    Self::Expired
                }
                CertificateError::NotValidYet | CertificateError::NotValidYetContext { .. } => {
                    Self::NotValidYet
                }
                CertificateError::Revoked => Self::Revoked,
                CertificateError::NotValidForName
                | CertificateError::NotValidForNameContext { .. } => Self::NameMismatch,
                CertificateError::BadSignature => Self::BadSignature,
                _ => Self::Invalid,
            },
            _ => Self::Invalid,
        }
    }
}

impl From<VerifyStatus> for i32 {
    fn from(status: VerifyStatus) -> Self {
        status.code()
    }
}

impl fmt::Display for VerifyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}

/// Everything verification needs from the session
pub(crate) struct VerifyContext<'a> {
    pub(crate) direction: Direction,
    pub(crate) options: &'a SessionOptions,
    pub(crate) peer: &'a PeerIdentity,
    pub(crate) certificates: &'a CertificateChainCache,
    pub(crate) provider: &'a Arc<CryptoProvider>,
}

impl VerifyContext<'_> {
    /// Verify the chain the peer presented, leaf first
    pub(crate) fn verify(&self, presented: &[CertificateDer<'static>]) -> VerifyStatus {
        if !self.options.verify_peer {
            return VerifyStatus::Ok;
        }
        let Some((end_entity, intermediates)) = presented.split_first() else {
            return VerifyStatus::NoCertificate;
        };

        let roots = match self.trust_anchors() {
            Ok(roots) if !roots.is_empty() => Arc::new(roots),
            Ok(_) => return VerifyStatus::NoTrustAnchors,
            Err(e) => {
                tracing::warn!("Trust anchors unavailable for {}: {}", self.peer, e);
                return VerifyStatus::NoTrustAnchors;
            }
        };
        let crls = match self.revocation_lists() {
            Ok(crls) => crls,
            Err(e) => {
                tracing::warn!("Revocation lists unavailable for {}: {}", self.peer, e);
                return VerifyStatus::Invalid;
            }
        };

        let outcome = match self.direction {
            Direction::Client => self.verify_server(roots, crls, end_entity, intermediates),
            Direction::Server => self.verify_client(roots, crls, end_entity, intermediates),
        };

        match outcome {
            Ok(()) => VerifyStatus::Ok,
            Err(status) => {
                tracing::warn!("Peer verification failed for {}: {}", self.peer, status);
                status
            }
        }
    }

    fn verify_server(
        &self,
        roots: Arc<RootCertStore>,
        crls: Vec<CertificateRevocationListDer<'static>>,
        end_entity: &CertificateDer<'static>,
        intermediates: &[CertificateDer<'static>],
    ) -> std::result::Result<(), VerifyStatus> {
        let mut builder =
            WebPkiServerVerifier::builder_with_provider(roots, Arc::clone(self.provider));
        if !crls.is_empty() {
            builder = builder
                .with_crls(crls)
                .only_check_end_entity_revocation()
                .allow_unknown_revocation_status();
        }
        let verifier = builder.build().map_err(builder_status)?;

        let server_name = ServerName::try_from(self.peer.host.clone())
            .map_err(|_| VerifyStatus::NameMismatch)?;
        verifier
            .verify_server_cert(end_entity, intermediates, &server_name, &[], UnixTime::now())
            .map(|_| ())
            .map_err(|e| VerifyStatus::from_engine_error(&e))
    }

    fn verify_client(
        &self,
        roots: Arc<RootCertStore>,
        crls: Vec<CertificateRevocationListDer<'static>>,
        end_entity: &CertificateDer<'static>,
        intermediates: &[CertificateDer<'static>],
    ) -> std::result::Result<(), VerifyStatus> {
        let mut builder =
            WebPkiClientVerifier::builder_with_provider(roots, Arc::clone(self.provider));
        if !crls.is_empty() {
            builder = builder
                .with_crls(crls)
                .only_check_end_entity_revocation()
                .allow_unknown_revocation_status();
        }
        let verifier = builder.build().map_err(builder_status)?;

        verifier
            .verify_client_cert(end_entity, intermediates, UnixTime::now())
            .map(|_| ())
            .map_err(|e| VerifyStatus::from_engine_error(&e))
    }

    fn trust_anchors(&self) -> Result<RootCertStore> {
        match (&self.options.ca_file, self.direction) {
            (Some(path), _) => {
                let chain = self.certificates.from_file(path)?;
                let mut roots = RootCertStore::empty();
                let (added, ignored) =
                    roots.add_parsable_certificates(chain.certificates().iter().cloned());
                if ignored > 0 {
                    tracing::warn!(
                        "Ignored {} unusable trust anchor(s) in {}",
                        ignored,
                        path.display()
                    );
                }
                tracing::debug!("Verifying against {} anchor(s) from {}", added, path.display());
                Ok(roots)
            }
            (None, Direction::Client) => {
                Ok(webpki_roots::TLS_SERVER_ROOTS.iter().cloned().collect())
            }
            (None, Direction::Server) => Ok(RootCertStore::empty()),
        }
    }

    fn revocation_lists(&self) -> Result<Vec<CertificateRevocationListDer<'static>>> {
        match &self.options.crl_file {
            Some(path) => load_crls(path),
            None => Ok(Vec::new()),
        }
    }
}

fn builder_status(error: VerifierBuilderError) -> VerifyStatus {
    match error {
        VerifierBuilderError::NoRootAnchors => VerifyStatus::NoTrustAnchors,
        _ => VerifyStatus::Invalid,
    }
}

fn load_crls(path: &Path) -> Result<Vec<CertificateRevocationListDer<'static>>> {
    let content = std::fs::read(path).map_err(|e| TlsError::from_file_io(path, e))?;
    if content.windows(10).any(|w| w == b"-----BEGIN") {
        let mut reader = content.as_slice();
        rustls_pemfile::crls(&mut reader)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| TlsError::Parse(format!("Failed to parse CRL PEM: {e}")))
    } else if content.is_empty() {
        Err(TlsError::Parse(format!("No CRLs found in {}", path.display())))
    } else {
        Ok(vec![CertificateRevocationListDer::from(content)])
    }
}

/// Server certificate verifier that defers the trust decision
#[derive(Debug)]
pub(crate) struct DeferredServerVerifier {
    algorithms: WebPkiSupportedAlgorithms,
}

impl DeferredServerVerifier {
    pub(crate) fn new(provider: &CryptoProvider) -> Self {
        Self {
            algorithms: provider.signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for DeferredServerVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Client certificate verifier that requests a certificate without requiring
/// one and defers the trust decision
#[derive(Debug)]
pub(crate) struct DeferredClientVerifier {
    algorithms: WebPkiSupportedAlgorithms,
}

impl DeferredClientVerifier {
    pub(crate) fn new(provider: &CryptoProvider) -> Self {
        Self {
            algorithms: provider.signature_verification_algorithms,
        }
    }
}

impl ClientCertVerifier for DeferredClientVerifier {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_are_stable() {
        assert_eq!(VerifyStatus::Ok.code(), 0);
        assert_eq!(i32::from(VerifyStatus::NotEstablished), -1);
        assert_eq!(i32::from(VerifyStatus::UnknownIssuer), -4);
        assert_eq!(VerifyStatus::Invalid.code(), -10);
        assert!(VerifyStatus::Ok.is_ok());
        assert!(!VerifyStatus::Revoked.is_ok());
    }

    #[test]
    fn engine_errors_map_to_statuses() {
        let expired = rustls::Error::InvalidCertificate(CertificateError::Expired);
        assert_eq!(VerifyStatus::from_engine_error(&expired), VerifyStatus::Expired);
        let unknown = rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer);
        assert_eq!(VerifyStatus::from_engine_error(&unknown), VerifyStatus::UnknownIssuer);
        let other = rustls::Error::General("boom".to_string());
        assert_eq!(VerifyStatus::from_engine_error(&other), VerifyStatus::Invalid);
    }
}
