//! Issuer identity: the CA whose key signs (or delegates) OCSP responses

use crate::certificate::decode_pem_or_der;
use crate::error::OcspError;
use crate::ocsp::HashAlgorithm;
use sha2::{Digest, Sha256};
use std::path::Path;
use x509_parser::prelude::*;

/// Issuing CA, reduced to what OCSP needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issuer {
    /// Subject Name, raw DER
    subject: Vec<u8>,
    /// SubjectPublicKeyInfo, raw DER
    spki: Vec<u8>,
    /// subjectPublicKey BIT STRING contents
    public_key: Vec<u8>,
    subject_key_id: Vec<u8>,
    /// Human readable subject for logs
    display_name: String,
}

impl Issuer {
    /// Build from a DER certificate
    pub fn from_der(cert_der: &[u8]) -> Result<Self, OcspError> {
        let (_, cert) = parse_x509_certificate(cert_der).map_err(|e| {
            OcspError::Certificate(format!("Failed to parse issuer certificate: {}", e))
        })?;

        let mut subject_key_id = None;
        for ext in cert.extensions() {
            if let ParsedExtension::SubjectKeyIdentifier(kid) = ext.parsed_extension() {
                subject_key_id = Some(kid.0.to_vec());
            }
        }

        let public_key = cert.public_key().subject_public_key.data.to_vec();
        Ok(Self {
            subject: cert.subject().as_raw().to_vec(),
            spki: cert.public_key().raw.to_vec(),
            // RFC 5280 method 1 when the certificate carries no SKI
            subject_key_id: subject_key_id
                .unwrap_or_else(|| HashAlgorithm::Sha1.digest(&public_key)),
            public_key,
            display_name: cert.subject().to_string(),
        })
    }

    /// Build from a PEM or DER certificate
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, OcspError> {
        Self::from_der(&decode_pem_or_der(bytes)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, OcspError> {
        let bytes = std::fs::read(path).map_err(|source| OcspError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_bytes(&bytes)
    }

    /// Build from raw parts when no certificate is at hand
    pub fn from_parts(
        subject: Vec<u8>,
        spki: Vec<u8>,
        subject_key_id: Option<Vec<u8>>,
        display_name: impl Into<String>,
    ) -> Result<Self, OcspError> {
        X509Name::from_der(&subject)
            .map_err(|e| OcspError::Certificate(format!("Invalid issuer Name: {}", e)))?;
        let public_key = SubjectPublicKeyInfo::from_der(&spki)
            .map_err(|e| OcspError::Certificate(format!("Invalid SubjectPublicKeyInfo: {}", e)))?
            .1
            .subject_public_key
            .data
            .to_vec();

        Ok(Self {
            subject_key_id: subject_key_id
                .unwrap_or_else(|| HashAlgorithm::Sha1.digest(&public_key)),
            subject,
            spki,
            public_key,
            display_name: display_name.into(),
        })
    }

    pub fn subject(&self) -> &[u8] {
        &self.subject
    }

    pub fn spki(&self) -> &[u8] {
        &self.spki
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    pub fn subject_key_id(&self) -> &[u8] {
        &self.subject_key_id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Hash of the DER subject Name, as used in CertID
    pub fn name_hash(&self, alg: HashAlgorithm) -> Vec<u8> {
        alg.digest(&self.subject)
    }

    /// Hash of the public key bits, as used in CertID
    pub fn key_hash(&self, alg: HashAlgorithm) -> Vec<u8> {
        alg.digest(&self.public_key)
    }

    /// Identity under which the issuer is cached
    pub fn cache_key(&self) -> [u8; 32] {
        Self::cache_key_for(&self.subject, &self.subject_key_id)
    }

    pub fn cache_key_for(subject: &[u8], subject_key_id: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(subject);
        hasher.update(subject_key_id);
        hasher.finalize().into()
    }
}
