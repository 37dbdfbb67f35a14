//! Finite-field Diffie-Hellman key exchange over caller-held parameters
//!
//! The engine only negotiates groups it can name, so custom parameter sets are
//! advertised under the RFC 7919 private-use code point. Both ends must hold
//! the same parameters for the group to be selected; otherwise negotiation
//! falls through to the ECDHE groups.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use num_bigint::BigUint;
use once_cell::sync::Lazy;
use rustls::crypto::{ActiveKeyExchange, SharedSecret, SupportedKxGroup};
use rustls::NamedGroup;
use sha2::{Digest, Sha256};

/// Code point used for generated or file-loaded parameter sets
pub const FFDHE_PRIVATE_GROUP: NamedGroup = NamedGroup::Unknown(0x01FC);

// Upper bound on the private exponent size, in bytes
const MAX_EXPONENT_LEN: usize = 64;

/// Most distinct parameter sets ever registered as engine groups
pub const MAX_REGISTERED_GROUPS: usize = 64;

// The engine requires `'static` groups, so registered groups are never freed.
static GROUPS: Lazy<Mutex<HashMap<String, &'static FfdheGroup>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

#[derive(Debug)]
struct GroupParams {
    prime: BigUint,
    generator: BigUint,
    prime_len: usize,
}

/// Key-exchange group over one DH parameter set
#[derive(Debug)]
pub struct FfdheGroup {
    params: Arc<GroupParams>,
    fingerprint: String,
}

/// Hex SHA-256 over the encoded prime and generator
pub(crate) fn fingerprint(prime: &BigUint, generator: &BigUint) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prime.to_bytes_be());
    hasher.update([0u8]);
    hasher.update(generator.to_bytes_be());
    hex::encode(hasher.finalize())
}

fn groups() -> MutexGuard<'static, HashMap<String, &'static FfdheGroup>> {
    match GROUPS.lock() {
        Ok(groups) => groups,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Return the shared group for these parameters, creating it once
///
/// `None` once [`MAX_REGISTERED_GROUPS`] other sets have been registered.
pub(crate) fn intern(prime: &BigUint, generator: &BigUint) -> Option<&'static FfdheGroup> {
    let fingerprint = fingerprint(prime, generator);
    let mut groups = groups();
    if let Some(group) = groups.get(&fingerprint) {
        return Some(*group);
    }
    if groups.len() >= MAX_REGISTERED_GROUPS {
        tracing::warn!(
            "FFDHE group registry is full ({} groups); not registering {}",
            groups.len(),
            &fingerprint[..16]
        );
        return None;
    }

    tracing::debug!("Registering FFDHE group {}", &fingerprint[..16]);
    let group: &'static FfdheGroup = Box::leak(Box::new(FfdheGroup {
        params: Arc::new(GroupParams {
            prime: prime.clone(),
            generator: generator.clone(),
            prime_len: prime.bits().div_ceil(8) as usize,
        }),
        fingerprint: fingerprint.clone(),
    }));
    groups.insert(fingerprint, group);
    Some(group)
}

/// Number of parameter sets registered as engine groups so far
#[must_use]
pub fn registered_groups() -> usize {
    groups().len()
}

impl FfdheGroup {
    /// Fingerprint of the parameter set behind this group
    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl SupportedKxGroup for FfdheGroup {
    fn start(&self) -> Result<Box<dyn ActiveKeyExchange>, rustls::Error> {
        let params = Arc::clone(&self.params);

        let mut bytes = vec![0u8; params.prime_len.min(MAX_EXPONENT_LEN)];
        rand::RngCore::fill_bytes(&mut rand::rng(), &mut bytes);
        // Exponent in [2, p - 2]
        let range = &params.prime - 3u32;
        let exponent = BigUint::from_bytes_be(&bytes) % range + 2u32;

        let public = params.generator.modpow(&exponent, &params.prime);
        let pub_key = left_pad(&public, params.prime_len);

        Ok(Box::new(FfdheKeyExchange {
            params,
            exponent,
            pub_key,
        }))
    }

    fn name(&self) -> NamedGroup {
        FFDHE_PRIVATE_GROUP
    }
}

struct FfdheKeyExchange {
    params: Arc<GroupParams>,
    exponent: BigUint,
    pub_key: Vec<u8>,
}

impl ActiveKeyExchange for FfdheKeyExchange {
    fn complete(self: Box<Self>, peer_pub_key: &[u8]) -> Result<SharedSecret, rustls::Error> {
        let params = &self.params;
        if peer_pub_key.len() != params.prime_len {
            return Err(rustls::Error::General(
                "FFDHE key share has the wrong length".to_string(),
            ));
        }

        let peer = BigUint::from_bytes_be(peer_pub_key);
        let upper = &params.prime - 1u32;
        if peer <= BigUint::from(1u32) || peer >= upper {
            return Err(rustls::Error::General(
                "FFDHE key share out of range".to_string(),
            ));
        }

        let secret = peer.modpow(&self.exponent, &params.prime);
        Ok(SharedSecret::from(left_pad(&secret, params.prime_len)))
    }

    fn pub_key(&self) -> &[u8] {
        &self.pub_key
    }

    fn group(&self) -> NamedGroup {
        FFDHE_PRIVATE_GROUP
    }
}

fn left_pad(value: &BigUint, len: usize) -> Vec<u8> {
    let bytes = value.to_bytes_be();
    let mut out = vec![0u8; len.saturating_sub(bytes.len())];
    out.extend_from_slice(&bytes);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_reuses_groups_and_stops_at_its_bound() {
        let generator = BigUint::from(2u32);
        let first = intern(&BigUint::from(1_000_003u32), &generator).expect("empty registry");
        let again = intern(&BigUint::from(1_000_003u32), &generator).expect("known set");
        assert!(std::ptr::eq(first, again));
        let registered = registered_groups();

        let mut candidate = 2_000_000u32;
        while registered_groups() < MAX_REGISTERED_GROUPS {
            candidate += 1;
            assert!(intern(&BigUint::from(candidate), &generator).is_some());
        }
        assert!(registered_groups() > registered);
        assert!(intern(&BigUint::from(candidate + 1), &generator).is_none());
        assert_eq!(registered_groups(), MAX_REGISTERED_GROUPS);

        // Sets registered before the bound was reached stay available
        let kept = intern(&BigUint::from(1_000_003u32), &generator).expect("still registered");
        assert!(std::ptr::eq(first, kept));
    }
}
