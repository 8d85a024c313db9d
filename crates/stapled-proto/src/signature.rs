//! Signature verification for OCSP responses and responder certificates

use crate::der::oid;
use crate::error::OcspError;
use crate::issuer::Issuer;
use ring::signature::{self as ring_sig, UnparsedPublicKey, VerificationAlgorithm};
use x509_parser::prelude::*;

/// Verify `signature` over `message` with the key in `spki_der`
///
/// `algorithm` is the signature AlgorithmIdentifier OID contents.
pub fn verify(
    spki_der: &[u8],
    algorithm: &[u8],
    signature: &[u8],
    message: &[u8],
) -> Result<(), OcspError> {
    let (_, spki) = SubjectPublicKeyInfo::from_der(spki_der)
        .map_err(|e| OcspError::malformed("SubjectPublicKeyInfo", e.to_string()))?;
    // ECDSA keys name their curve in the parameters
    let curve = spki
        .algorithm
        .parameters
        .as_ref()
        .and_then(|params| params.as_oid().ok());

    let verifier = select_algorithm(
        algorithm,
        spki.algorithm.algorithm.as_bytes(),
        curve.as_ref().map(|c| c.as_bytes()),
    )?;
    UnparsedPublicKey::new(verifier, spki.subject_public_key.data.as_ref())
        .verify(message, signature)
        .map_err(|_| OcspError::InvalidSignature("signature does not verify".to_string()))
}

fn select_algorithm(
    sig_oid: &[u8],
    key_oid: &[u8],
    curve: Option<&[u8]>,
) -> Result<&'static dyn VerificationAlgorithm, OcspError> {
    let unsupported = || {
        OcspError::unsupported(
            "signature algorithm",
            format!("{} with key {}", hex::encode(sig_oid), hex::encode(key_oid)),
        )
    };

    if key_oid == oid::RSA_ENCRYPTION {
        let alg: &'static dyn VerificationAlgorithm = if sig_oid == oid::SHA256_WITH_RSA {
            &ring_sig::RSA_PKCS1_2048_8192_SHA256
        } else if sig_oid == oid::SHA384_WITH_RSA {
            &ring_sig::RSA_PKCS1_2048_8192_SHA384
        } else if sig_oid == oid::SHA512_WITH_RSA {
            &ring_sig::RSA_PKCS1_2048_8192_SHA512
        } else if sig_oid == oid::SHA1_WITH_RSA {
            &ring_sig::RSA_PKCS1_1024_8192_SHA1_FOR_LEGACY_USE_ONLY
        } else {
            return Err(unsupported());
        };
        return Ok(alg);
    }

    if key_oid == oid::EC_PUBLIC_KEY {
        let p256 = curve == Some(oid::CURVE_P256);
        let p384 = curve == Some(oid::CURVE_P384);
        let alg: &'static dyn VerificationAlgorithm = match (sig_oid, p256, p384) {
            (s, true, _) if s == oid::ECDSA_WITH_SHA256 => &ring_sig::ECDSA_P256_SHA256_ASN1,
            (s, true, _) if s == oid::ECDSA_WITH_SHA384 => &ring_sig::ECDSA_P256_SHA384_ASN1,
            (s, _, true) if s == oid::ECDSA_WITH_SHA256 => &ring_sig::ECDSA_P384_SHA256_ASN1,
            (s, _, true) if s == oid::ECDSA_WITH_SHA384 => &ring_sig::ECDSA_P384_SHA384_ASN1,
            _ => return Err(unsupported()),
        };
        return Ok(alg);
    }

    if key_oid == oid::ED25519 && sig_oid == oid::ED25519 {
        return Ok(&ring_sig::ED25519);
    }

    Err(unsupported())
}

/// Certificate split into its signed part plus the fields needed to judge a
/// delegated OCSP responder
#[derive(Debug, Clone)]
pub struct SignedCertificate {
    pub tbs: Vec<u8>,
    pub signature_algorithm: Vec<u8>,
    pub signature: Vec<u8>,
    /// Issuer Name, raw DER
    pub issuer: Vec<u8>,
    /// SubjectPublicKeyInfo, raw DER
    pub spki: Vec<u8>,
    pub ocsp_signing: bool,
    pub currently_valid: bool,
}

impl SignedCertificate {
    pub fn parse(cert_der: &[u8]) -> Result<Self, OcspError> {
        let (_, parsed) = parse_x509_certificate(cert_der)
            .map_err(|e| OcspError::Certificate(format!("Failed to parse certificate: {}", e)))?;

        let mut ocsp_signing = false;
        for ext in parsed.extensions() {
            if let ParsedExtension::ExtendedKeyUsage(eku) = ext.parsed_extension() {
                ocsp_signing = eku.ocsp_signing;
            }
        }

        Ok(Self {
            tbs: parsed.tbs_certificate.as_ref().to_vec(),
            signature_algorithm: parsed.signature_algorithm.algorithm.as_bytes().to_vec(),
            signature: parsed.signature_value.data.to_vec(),
            issuer: parsed.issuer().as_raw().to_vec(),
            spki: parsed.public_key().raw.to_vec(),
            ocsp_signing,
            currently_valid: parsed.validity().is_valid(),
        })
    }

    /// Check this certificate is an authorized responder for `issuer`
    pub fn check_delegated_by(&self, issuer: &Issuer) -> Result<(), OcspError> {
        if self.issuer != issuer.subject() {
            return Err(OcspError::InvalidSignature(
                "responder certificate has a different issuer".to_string(),
            ));
        }
        if !self.ocsp_signing {
            return Err(OcspError::InvalidSignature(
                "responder certificate lacks the OCSPSigning extended key usage".to_string(),
            ));
        }
        if !self.currently_valid {
            return Err(OcspError::InvalidSignature(
                "responder certificate is outside its validity period".to_string(),
            ));
        }
        verify(
            issuer.spki(),
            &self.signature_algorithm,
            &self.signature,
            &self.tbs,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{CertificateBuilder, TestAuthority};

    #[test]
    fn test_ed25519_verify() {
        let ca = TestAuthority::new("Signer");
        let message = b"tbs bytes";
        let signature = ca.sign(message);

        verify(ca.issuer().spki(), oid::ED25519, &signature, message).unwrap();
        assert!(verify(ca.issuer().spki(), oid::ED25519, &signature, b"other").is_err());
    }

    #[test]
    fn test_unsupported_algorithm() {
        let ca = TestAuthority::new("Signer");
        let err = verify(ca.issuer().spki(), oid::SHA256_WITH_RSA, &[0u8; 64], b"x").unwrap_err();
        assert!(matches!(err, OcspError::Unsupported { .. }));
    }

    #[test]
    fn test_delegated_responder_checks() {
        let ca = TestAuthority::new("Root");
        let responder = TestAuthority::new("Responder");
        let stranger = TestAuthority::new("Stranger");

        let delegated = CertificateBuilder::new(&responder).ocsp_signing().sign(&ca);
        let parsed = SignedCertificate::parse(&delegated).unwrap();
        assert!(parsed.ocsp_signing);
        parsed.check_delegated_by(ca.issuer()).unwrap();
        assert!(parsed.check_delegated_by(stranger.issuer()).is_err());

        let no_eku = CertificateBuilder::new(&responder).sign(&ca);
        let parsed = SignedCertificate::parse(&no_eku).unwrap();
        assert!(!parsed.ocsp_signing);
        assert!(parsed.check_delegated_by(ca.issuer()).is_err());
    }
}
