//! Leaf certificate inspection: serial number and AIA locations

use crate::der::oid;
use crate::error::OcspError;
use num_bigint::BigUint;
use std::path::Path;
use x509_parser::prelude::*;

/// What the daemon needs to know about a configured certificate
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    pub der: Vec<u8>,
    pub serial: BigUint,
    pub subject: String,
    pub issuer: String,
    /// Issuer Name, raw DER
    pub issuer_der: Vec<u8>,
    pub authority_key_id: Option<Vec<u8>>,
    /// id-ad-ocsp URIs from the AIA extension
    pub ocsp_urls: Vec<String>,
    /// id-ad-caIssuers URIs from the AIA extension
    pub issuer_urls: Vec<String>,
}

impl CertificateInfo {
    pub fn from_der(cert_der: &[u8]) -> Result<Self, OcspError> {
        let (_, cert) = parse_x509_certificate(cert_der)
            .map_err(|e| OcspError::Certificate(format!("Failed to parse certificate: {}", e)))?;

        let mut ocsp_urls = Vec::new();
        let mut issuer_urls = Vec::new();
        let mut authority_key_id = None;
        for ext in cert.extensions() {
            if let ParsedExtension::AuthorityKeyIdentifier(aki) = ext.parsed_extension() {
                authority_key_id = aki.key_identifier.as_ref().map(|kid| kid.0.to_vec());
            }
            if let ParsedExtension::AuthorityInfoAccess(aia) = ext.parsed_extension() {
                for desc in &aia.accessdescs {
                    let GeneralName::URI(uri) = &desc.access_location else {
                        continue;
                    };
                    let method = desc.access_method.as_bytes();
                    if method == oid::AD_OCSP {
                        ocsp_urls.push(uri.to_string());
                    } else if method == oid::AD_CA_ISSUERS {
                        issuer_urls.push(uri.to_string());
                    }
                }
            }
        }

        Ok(Self {
            serial: BigUint::from_bytes_be(cert.tbs_certificate.raw_serial()),
            subject: cert.subject().to_string(),
            issuer: cert.issuer().to_string(),
            issuer_der: cert.issuer().as_raw().to_vec(),
            authority_key_id,
            ocsp_urls,
            issuer_urls,
            der: cert_der.to_vec(),
        })
    }

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
}

/// Return DER bytes from either a PEM document (first block) or raw DER
pub fn decode_pem_or_der(bytes: &[u8]) -> Result<Vec<u8>, OcspError> {
    let trimmed = bytes.trim_ascii_start();
    if trimmed.starts_with(b"-----BEGIN") {
        let (_, pem) = x509_parser::pem::parse_x509_pem(trimmed)
            .map_err(|e| OcspError::Certificate(format!("Failed to parse PEM: {}", e)))?;
        Ok(pem.contents)
    } else {
        Ok(bytes.to_vec())
    }
}
