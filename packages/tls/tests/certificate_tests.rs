//! Certificate chain loading and caching

mod common;

use std::sync::Arc;

use cryypt_tls::{CertificateChainCache, TlsError};

#[test]
fn chain_keeps_file_order() {
    let pki = common::Pki::generate();
    let cache = CertificateChainCache::default();

    let chain = cache.from_file(&pki.server_chain).expect("load chain");
    assert_eq!(chain.len(), 3);
    let subjects: Vec<_> = chain.summaries().iter().map(|s| s.subject.as_str()).collect();
    assert_eq!(subjects, ["CN=localhost", "CN=Test Intermediate", "CN=Test Root"]);
    assert_eq!(chain.summaries()[0].issuer, "CN=Test Intermediate");
    assert_eq!(chain.leaf(), &chain.certificates()[0]);
}

#[test]
fn empty_file_is_a_parse_error() {
    let pki = common::Pki::generate();
    let empty = common::write(pki.dir.path(), "empty.pem", "");
    let cache = CertificateChainCache::default();

    let err = cache.from_file(&empty).expect_err("empty chain");
    assert!(matches!(err, TlsError::Parse(_)));
    assert!(cache.is_empty());
}

#[test]
fn malformed_certificate_rejects_the_whole_file() {
    let pki = common::Pki::generate();
    let root = std::fs::read_to_string(&pki.root).expect("read root");
    let content = format!("{root}-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n");
    let path = common::write(pki.dir.path(), "bad-chain.pem", content);
    let cache = CertificateChainCache::default();

    assert!(matches!(cache.from_file(&path), Err(TlsError::Parse(_))));
    assert!(cache.is_empty());
}

#[test]
fn missing_file_is_not_found() {
    let pki = common::Pki::generate();
    let cache = CertificateChainCache::default();
    let err = cache
        .from_file(pki.dir.path().join("absent.pem"))
        .expect_err("missing file");
    assert!(matches!(err, TlsError::NotFound { .. }));
}

#[test]
fn repeated_loads_hit_the_cache() {
    let pki = common::Pki::generate();
    let cache = CertificateChainCache::default();

    let first = cache.from_file(&pki.root).expect("load");
    let second = cache.from_file(&pki.root).expect("cached");
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.stats(), (1, 1));

    assert!(cache.evict(&pki.root));
    assert!(cache.is_empty());
}

#[test]
fn reload_replaces_only_on_success() {
    let pki = common::Pki::generate();
    let path = pki.dir.path().join("rotating.pem");
    std::fs::copy(&pki.root, &path).expect("copy");
    let cache = CertificateChainCache::default();
    assert_eq!(cache.from_file(&path).expect("load").len(), 1);

    std::fs::copy(&pki.server_chain, &path).expect("rotate");
    assert_eq!(cache.reload(&path).expect("reload").len(), 3);

    std::fs::write(&path, "").expect("truncate");
    assert!(cache.reload(&path).is_err());
    assert_eq!(cache.from_file(&path).expect("cached").len(), 3);
}

#[test]
fn capacity_bounds_the_cache() {
    let pki = common::Pki::generate();
    let cache = CertificateChainCache::new(2);
    for (i, source) in [&pki.root, &pki.other_root, &pki.client_chain].iter().enumerate() {
        let path = pki.dir.path().join(format!("copy-{i}.pem"));
        std::fs::copy(source, &path).expect("copy");
        cache.from_file(&path).expect("load");
    }
    assert_eq!(cache.len(), 2);
}
