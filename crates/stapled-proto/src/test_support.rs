//! Signed fixtures for tests: throwaway Ed25519 authorities, certificates and
//! OCSP responses
//!
//! Only compiled for this crate's own tests or with the `test-support`
//! feature; the daemon never signs anything.

use crate::der::{self, oid};
use crate::issuer::Issuer;
use crate::ocsp::{CertId, CertificateStatus, HashAlgorithm};
use chrono::{DateTime, Duration, Utc};
use num_bigint::BigUint;
use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair};

/// 2.5.29.14
const EXT_SUBJECT_KEY_ID: &[u8] = &[0x55, 0x1D, 0x0E];
/// 2.5.29.35
const EXT_AUTHORITY_KEY_ID: &[u8] = &[0x55, 0x1D, 0x23];
/// 2.5.29.37
const EXT_EXTENDED_KEY_USAGE: &[u8] = &[0x55, 0x1D, 0x25];
/// 1.3.6.1.5.5.7.1.1
const EXT_AUTHORITY_INFO_ACCESS: &[u8] = &[0x2B, 0x06, 0x01, 0x05, 0x05, 0x07, 0x01, 0x01];
/// 1.3.6.1.5.5.7.3.9
const KP_OCSP_SIGNING: &[u8] = &[0x2B, 0x06, 0x01, 0x05, 0x05, 0x07, 0x03, 0x09];

/// Name with a single commonName attribute
pub fn common_name(cn: &str) -> Vec<u8> {
    let mut attr = der::der_oid(oid::COMMON_NAME);
    attr.extend_from_slice(&der::der_utf8_string(cn));
    der::der_sequence(&der::der_set(&der::der_sequence(&attr)))
}

fn ed25519_algorithm() -> Vec<u8> {
    der::der_sequence(&der::der_oid(oid::ED25519))
}

/// An Ed25519 key with a matching issuer identity
pub struct TestAuthority {
    key_pair: Ed25519KeyPair,
    issuer: Issuer,
}

impl TestAuthority {
    pub fn new(cn: &str) -> Self {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).expect("generate Ed25519 key");
        let key_pair = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).expect("load Ed25519 key");

        let mut spki = ed25519_algorithm();
        spki.extend_from_slice(&der::der_bit_string(key_pair.public_key().as_ref()));
        let spki = der::der_sequence(&spki);

        let issuer = Issuer::from_parts(common_name(cn), spki, None, format!("CN={}", cn))
            .expect("valid test issuer");

        Self { key_pair, issuer }
    }

    pub fn issuer(&self) -> &Issuer {
        &self.issuer
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.key_pair.sign(message).as_ref().to_vec()
    }

    /// Wrap `tbs` with this authority's Ed25519 signature
    fn signed(&self, tbs: Vec<u8>) -> Vec<u8> {
        let signature = self.sign(&tbs);
        let mut contents = tbs;
        contents.extend_from_slice(&ed25519_algorithm());
        contents.extend_from_slice(&der::der_bit_string(&signature));
        der::der_sequence(&contents)
    }
}

/// X.509 v3 certificate for a [`TestAuthority`]'s key
pub struct CertificateBuilder {
    subject: Vec<u8>,
    spki: Vec<u8>,
    subject_key_id: Vec<u8>,
    serial: BigUint,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    ocsp_signing: bool,
    ocsp_urls: Vec<String>,
    ca_issuers_urls: Vec<String>,
}

impl CertificateBuilder {
    pub fn new(subject: &TestAuthority) -> Self {
        let now = Utc::now();
        Self {
            subject: subject.issuer().subject().to_vec(),
            spki: subject.issuer().spki().to_vec(),
            subject_key_id: subject.issuer().subject_key_id().to_vec(),
            serial: BigUint::from(1u32),
            not_before: now - Duration::days(1),
            not_after: now + Duration::days(365),
            ocsp_signing: false,
            ocsp_urls: Vec::new(),
            ca_issuers_urls: Vec::new(),
        }
    }

    pub fn serial(mut self, serial: BigUint) -> Self {
        self.serial = serial;
        self
    }

    pub fn ocsp_signing(mut self) -> Self {
        self.ocsp_signing = true;
        self
    }

    pub fn ocsp_url(mut self, url: &str) -> Self {
        self.ocsp_urls.push(url.to_string());
        self
    }

    pub fn ca_issuers_url(mut self, url: &str) -> Self {
        self.ca_issuers_urls.push(url.to_string());
        self
    }

    /// Encode and sign with `issuer`'s key
    pub fn sign(&self, issuer: &TestAuthority) -> Vec<u8> {
        let mut tbs = der::der_explicit_context(0, &der::der_integer(&[2]));
        tbs.extend_from_slice(&der::der_biguint(&self.serial));
        tbs.extend_from_slice(&ed25519_algorithm());
        tbs.extend_from_slice(issuer.issuer().subject());

        let mut validity = utc_time(&self.not_before);
        validity.extend_from_slice(&utc_time(&self.not_after));
        tbs.extend_from_slice(&der::der_sequence(&validity));

        tbs.extend_from_slice(&self.subject);
        tbs.extend_from_slice(&self.spki);
        tbs.extend_from_slice(&der::der_explicit_context(3, &der::der_sequence(&self.extensions(issuer))));

        issuer.signed(der::der_sequence(&tbs))
    }

    fn extensions(&self, issuer: &TestAuthority) -> Vec<u8> {
        let mut extensions = extension(
            EXT_SUBJECT_KEY_ID,
            &der::der_octet_string(&self.subject_key_id),
        );
        // keyIdentifier [0] IMPLICIT OCTET STRING
        let key_id = der::der_tlv(der::context_primitive(0), issuer.issuer().subject_key_id());
        extensions.extend_from_slice(&extension(EXT_AUTHORITY_KEY_ID, &der::der_sequence(&key_id)));

        if self.ocsp_signing {
            extensions.extend_from_slice(&extension(
                EXT_EXTENDED_KEY_USAGE,
                &der::der_sequence(&der::der_oid(KP_OCSP_SIGNING)),
            ));
        }

        if !self.ocsp_urls.is_empty() || !self.ca_issuers_urls.is_empty() {
            let mut descriptions = Vec::new();
            let methods = self
                .ocsp_urls
                .iter()
                .map(|url| (oid::AD_OCSP, url))
                .chain(self.ca_issuers_urls.iter().map(|url| (oid::AD_CA_ISSUERS, url)));
            for (method, url) in methods {
                let mut desc = der::der_oid(method);
                // uniformResourceIdentifier [6] IMPLICIT IA5String
                desc.extend_from_slice(&der::der_tlv(der::context_primitive(6), url.as_bytes()));
                descriptions.extend_from_slice(&der::der_sequence(&desc));
            }
            extensions.extend_from_slice(&extension(
                EXT_AUTHORITY_INFO_ACCESS,
                &der::der_sequence(&descriptions),
            ));
        }

        extensions
    }
}

fn extension(id: &[u8], value: &[u8]) -> Vec<u8> {
    let mut contents = der::der_oid(id);
    contents.extend_from_slice(&der::der_octet_string(value));
    der::der_sequence(&contents)
}

fn utc_time(time: &DateTime<Utc>) -> Vec<u8> {
    der::der_tlv(0x17, time.format("%y%m%d%H%M%SZ").to_string().as_bytes())
}

/// Signed OCSPResponse with one SingleResponse per serial
#[derive(Clone)]
pub struct ResponseBuilder {
    serials: Vec<BigUint>,
    status: CertificateStatus,
    /// Defaults to thisUpdate
    produced_at: Option<DateTime<Utc>>,
    this_update: DateTime<Utc>,
    next_update: Option<DateTime<Utc>>,
    hash_algorithm: HashAlgorithm,
    issuer: Option<Issuer>,
    certs: Vec<Vec<u8>>,
}

impl ResponseBuilder {
    /// Good status, valid from an hour ago until tomorrow
    pub fn new(serial: BigUint) -> Self {
        let now = Utc::now();
        Self {
            serials: vec![serial],
            status: CertificateStatus::Good,
            produced_at: None,
            this_update: now - Duration::hours(1),
            next_update: Some(now + Duration::days(1)),
            hash_algorithm: HashAlgorithm::Sha1,
            issuer: None,
            certs: Vec::new(),
        }
    }

    /// Add a further SingleResponse
    pub fn also_for(mut self, serial: BigUint) -> Self {
        self.serials.push(serial);
        self
    }

    pub fn this_update(mut self, time: DateTime<Utc>) -> Self {
        self.this_update = time;
        self
    }

    pub fn next_update(mut self, time: Option<DateTime<Utc>>) -> Self {
        self.next_update = time;
        self
    }

    pub fn produced_at(mut self, time: DateTime<Utc>) -> Self {
        self.produced_at = Some(time);
        self
    }

    pub fn revoked(mut self, time: DateTime<Utc>, reason: Option<u8>) -> Self {
        self.status = CertificateStatus::Revoked {
            revocation_time: time,
            reason,
        };
        self
    }

    pub fn unknown(mut self) -> Self {
        self.status = CertificateStatus::Unknown;
        self
    }

    /// Identify certificates by this issuer instead of the signer
    pub fn issuer(mut self, issuer: &Issuer) -> Self {
        self.issuer = Some(issuer.clone());
        self
    }

    /// Embed a responder certificate
    pub fn with_cert(mut self, cert_der: Vec<u8>) -> Self {
        self.certs.push(cert_der);
        self
    }

    pub fn sign(&self, signer: &TestAuthority) -> Vec<u8> {
        let issuer = self.issuer.as_ref().unwrap_or_else(|| signer.issuer());

        let mut responses = Vec::new();
        for serial in &self.serials {
            let cert_id = CertId::for_issuer(issuer, serial, self.hash_algorithm);
            let mut single = cert_id.to_der();
            single.extend_from_slice(&self.encode_status());
            single.extend_from_slice(&der::der_generalized_time(&self.this_update));
            if let Some(next) = &self.next_update {
                single.extend_from_slice(&der::der_explicit_context(
                    0,
                    &der::der_generalized_time(next),
                ));
            }
            responses.extend_from_slice(&der::der_sequence(&single));
        }

        // responderID byKey [2]
        let key_hash = signer.issuer().key_hash(HashAlgorithm::Sha1);
        let mut tbs = der::der_explicit_context(2, &der::der_octet_string(&key_hash));
        tbs.extend_from_slice(&der::der_generalized_time(&self.produced_at.unwrap_or(self.this_update)));
        tbs.extend_from_slice(&der::der_sequence(&responses));
        let tbs = der::der_sequence(&tbs);

        let signature = signer.sign(&tbs);
        let mut basic = tbs;
        basic.extend_from_slice(&ed25519_algorithm());
        basic.extend_from_slice(&der::der_bit_string(&signature));
        if !self.certs.is_empty() {
            let certs: Vec<u8> = self.certs.concat();
            basic.extend_from_slice(&der::der_explicit_context(0, &der::der_sequence(&certs)));
        }
        let basic = der::der_sequence(&basic);

        let mut response_bytes = der::der_oid(oid::OCSP_BASIC);
        response_bytes.extend_from_slice(&der::der_octet_string(&basic));

        let mut outer = der::der_enumerated(0);
        outer.extend_from_slice(&der::der_explicit_context(
            0,
            &der::der_sequence(&response_bytes),
        ));
        der::der_sequence(&outer)
    }

    fn encode_status(&self) -> Vec<u8> {
        match &self.status {
            CertificateStatus::Good => vec![der::context_primitive(0), 0x00],
            CertificateStatus::Revoked {
                revocation_time,
                reason,
            } => {
                let mut info = der::der_generalized_time(revocation_time);
                if let Some(reason) = reason {
                    info.extend_from_slice(&der::der_explicit_context(0, &der::der_enumerated(*reason)));
                }
                der::der_tlv(der::context_constructed(1), &info)
            }
            CertificateStatus::Unknown => vec![der::context_primitive(2), 0x00],
        }
    }
}
