//! Shared fixtures: a small PKI generated with rcgen and written to a temp dir

#![allow(dead_code)]

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use cryypt_tls::{
    encrypt_pkcs8_pem, CredentialStore, DhParams, DhSettings, MemoryTransport, Session, Transport,
};
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};
use tempfile::TempDir;

pub const KEY_PASSWORD: &str = "correct horse battery staple";

/// Certificates and keys on disk
pub struct Pki {
    pub dir: TempDir,
    /// Root CA certificate
    pub root: PathBuf,
    /// Unrelated CA that signed nothing here
    pub other_root: PathBuf,
    /// localhost leaf, intermediate and root, in that order
    pub server_chain: PathBuf,
    /// Server key, plain PKCS#8
    pub server_key: PathBuf,
    /// Server key, encrypted with `KEY_PASSWORD`
    pub server_key_encrypted: PathBuf,
    /// Expired localhost leaf signed by the root
    pub expired_chain: PathBuf,
    pub expired_key: PathBuf,
    /// Client leaf signed by the root
    pub client_chain: PathBuf,
    pub client_key: PathBuf,
}

fn ca_params(name: &str) -> CertificateParams {
    let mut params = CertificateParams::new(Vec::<String>::new()).expect("CA params");
    params.distinguished_name.push(DnType::CommonName, name);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params
}

fn leaf_params(name: &str, usage: ExtendedKeyUsagePurpose) -> CertificateParams {
    let mut params = CertificateParams::new(vec![name.to_string()]).expect("leaf params");
    params.distinguished_name.push(DnType::CommonName, name);
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![usage];
    params
}

pub fn write(dir: &Path, name: &str, contents: impl AsRef<[u8]>) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).expect("write fixture");
    path
}

impl Pki {
    pub fn generate() -> Self {
        let dir = tempfile::tempdir().expect("temp dir");

        let root_key = KeyPair::generate().expect("root key");
        let root_params = ca_params("Test Root");
        let root_cert = root_params.self_signed(&root_key).expect("root cert");
        let root_issuer = Issuer::new(root_params, root_key);

        let other_key = KeyPair::generate().expect("other key");
        let other_cert = ca_params("Other Root").self_signed(&other_key).expect("other cert");

        let inter_key = KeyPair::generate().expect("intermediate key");
        let inter_params = ca_params("Test Intermediate");
        let inter_cert = inter_params
            .signed_by(&inter_key, &root_issuer)
            .expect("intermediate cert");
        let inter_issuer = Issuer::new(inter_params, inter_key);

        let server_key = KeyPair::generate().expect("server key");
        let server_cert = leaf_params("localhost", ExtendedKeyUsagePurpose::ServerAuth)
            .signed_by(&server_key, &inter_issuer)
            .expect("server cert");

        let expired_key = KeyPair::generate().expect("expired key");
        let mut expired_params = leaf_params("localhost", ExtendedKeyUsagePurpose::ServerAuth);
        expired_params.not_before = rcgen::date_time_ymd(2019, 1, 1);
        expired_params.not_after = rcgen::date_time_ymd(2020, 1, 1);
        let expired_cert = expired_params
            .signed_by(&expired_key, &root_issuer)
            .expect("expired cert");

        let client_key = KeyPair::generate().expect("client key");
        let client_cert = leaf_params("client.test", ExtendedKeyUsagePurpose::ClientAuth)
            .signed_by(&client_key, &root_issuer)
            .expect("client cert");

        let encrypted = encrypt_pkcs8_pem(&server_key.serialize_der(), KEY_PASSWORD)
            .expect("encrypt server key");

        let d = dir.path();
        Self {
            root: write(d, "root.pem", root_cert.pem()),
            other_root: write(d, "other-root.pem", other_cert.pem()),
            server_chain: write(
                d,
                "server-chain.pem",
                format!("{}{}{}", server_cert.pem(), inter_cert.pem(), root_cert.pem()),
            ),
            server_key: write(d, "server.key", server_key.serialize_pem()),
            server_key_encrypted: write(d, "server-encrypted.key", encrypted),
            expired_chain: write(d, "expired.pem", expired_cert.pem()),
            expired_key: write(d, "expired.key", expired_key.serialize_pem()),
            client_chain: write(d, "client.pem", client_cert.pem()),
            client_key: write(d, "client.key", client_key.serialize_pem()),
            dir,
        }
    }

    /// Write a freshly generated 256-bit DH parameter file
    pub fn dh_params_file(&self, name: &str) -> PathBuf {
        let params = DhParams::generate(256).expect("DH parameters");
        write(self.dir.path(), name, params.to_pem().expect("DH PEM"))
    }
}

/// Store with small DH parameters so generation stays fast
pub fn test_store() -> Arc<CredentialStore> {
    Arc::new(CredentialStore::new(DhSettings {
        bits: 256,
        ..DhSettings::default()
    }))
}

/// Alternate handshake steps until both ends report completion
pub fn drive(client: &mut Session, server: &mut Session) {
    for _ in 0..100 {
        let client_done = client.handshake().expect("client handshake step");
        let server_done = server.handshake().expect("server handshake step");
        if client_done && server_done {
            return;
        }
    }
    panic!("handshake did not complete");
}

/// Read until `expected.len()` bytes have arrived
pub fn read_exact(session: &mut Session, expected: usize) -> Vec<u8> {
    let mut received = Vec::new();
    let mut buf = [0u8; 1024];
    for _ in 0..100 {
        if received.len() >= expected {
            break;
        }
        match session.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => received.extend_from_slice(&buf[..n]),
            Err(e) if e.is_would_block() => {}
            Err(e) => panic!("read failed: {e}"),
        }
    }
    received
}

/// Memory transport that counts every pull and push
#[derive(Debug, Clone)]
pub struct CountingTransport {
    inner: MemoryTransport,
    pub calls: Arc<AtomicUsize>,
}

impl CountingTransport {
    pub fn new(inner: MemoryTransport) -> Self {
        Self {
            inner,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Transport for CountingTransport {
    fn pull(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.pull(buf)
    }

    fn push(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.push(buf)
    }
}
