//! One-time engine initialization under concurrent first use

use std::sync::{Arc, Barrier};
use std::thread;

use cryypt_tls::{EngineGuard, LoggingTransformer};

#[test]
fn concurrent_first_calls_initialize_once() {
    LoggingTransformer::init_test();
    const THREADS: usize = 16;
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                EngineGuard::ensure_initialized()
            })
        })
        .collect();

    let providers: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().expect("thread panicked").expect("engine initialization"))
        .collect();

    assert_eq!(EngineGuard::initializations(), 1);
    assert!(EngineGuard::is_initialized());
    for provider in &providers[1..] {
        assert!(Arc::ptr_eq(&providers[0], provider));
    }
}

#[test]
fn provider_offers_suites_and_groups() {
    let provider = EngineGuard::ensure_initialized().expect("engine initialization");
    assert!(!provider.cipher_suites.is_empty());
    assert!(!provider.kx_groups.is_empty());
    assert_eq!(EngineGuard::initializations(), 1);
}
