//! Lookup keys: the identity of a cached response
//!
//! A key is `SHA-256(alg id || issuerNameHash || issuerKeyHash || serial)`.
//! Clients may name a certificate with any CertID hash algorithm, so every
//! entry is registered under one key per algorithm; the SHA-256 variant is
//! the entry's primary key.

use num_bigint::BigUint;
use sha2::{Digest, Sha256};
use stapled_proto::{CertId, HashAlgorithm, Issuer};
use std::fmt;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LookupKey([u8; 32]);

impl LookupKey {
    pub fn new(
        alg: HashAlgorithm,
        issuer_name_hash: &[u8],
        issuer_key_hash: &[u8],
        serial: &BigUint,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update([alg.id()]);
        hasher.update(issuer_name_hash);
        hasher.update(issuer_key_hash);
        hasher.update(serial.to_bytes_be());
        Self(hasher.finalize().into())
    }

    /// Key for an incoming request
    pub fn from_cert_id(cert_id: &CertId) -> Self {
        Self::new(
            cert_id.hash_algorithm,
            &cert_id.issuer_name_hash,
            &cert_id.issuer_key_hash,
            &cert_id.serial,
        )
    }

    pub fn for_issuer(issuer: &Issuer, serial: &BigUint, alg: HashAlgorithm) -> Self {
        Self::new(alg, &issuer.name_hash(alg), &issuer.key_hash(alg), serial)
    }

    /// Keys for every supported algorithm
    pub fn all_for(issuer: &Issuer, serial: &BigUint) -> Vec<LookupKey> {
        HashAlgorithm::ALL
            .iter()
            .map(|alg| Self::for_issuer(issuer, serial, *alg))
            .collect()
    }

    pub fn primary(issuer: &Issuer, serial: &BigUint) -> Self {
        Self::for_issuer(issuer, serial, HashAlgorithm::Sha256)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes).ok()?;
        Some(Self(bytes))
    }
}

impl fmt::Display for LookupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for LookupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LookupKey({})", self.to_hex())
    }
}
