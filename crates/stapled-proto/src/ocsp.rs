//! OCSP (Online Certificate Status Protocol) codec - RFC 6960
//!
//! Builds the unsigned requests sent upstream, decodes the requests TLS
//! terminators send us, and decodes and checks BasicOCSPResponses.
//!
//! ```asn1
//! OCSPRequest ::= SEQUENCE {
//!     tbsRequest          TBSRequest,
//!     optionalSignature   [0] EXPLICIT Signature OPTIONAL
//! }
//!
//! TBSRequest ::= SEQUENCE {
//!     version             [0] EXPLICIT Version DEFAULT v1,
//!     requestorName       [1] EXPLICIT GeneralName OPTIONAL,
//!     requestList         SEQUENCE OF Request,
//!     requestExtensions   [2] EXPLICIT Extensions OPTIONAL
//! }
//!
//! CertID ::= SEQUENCE {
//!     hashAlgorithm       AlgorithmIdentifier,
//!     issuerNameHash      OCTET STRING,
//!     issuerKeyHash       OCTET STRING,
//!     serialNumber        INTEGER
//! }
//!
//! OCSPResponse ::= SEQUENCE {
//!     responseStatus      OCSPResponseStatus,
//!     responseBytes       [0] EXPLICIT ResponseBytes OPTIONAL
//! }
//!
//! BasicOCSPResponse ::= SEQUENCE {
//!     tbsResponseData     ResponseData,
//!     signatureAlgorithm  AlgorithmIdentifier,
//!     signature           BIT STRING,
//!     certs               [0] EXPLICIT SEQUENCE OF Certificate OPTIONAL
//! }
//!
//! ResponseData ::= SEQUENCE {
//!     version             [0] EXPLICIT Version DEFAULT v1,
//!     responderID         ResponderID,
//!     producedAt          GeneralizedTime,
//!     responses           SEQUENCE OF SingleResponse,
//!     responseExtensions  [1] EXPLICIT Extensions OPTIONAL
//! }
//!
//! SingleResponse ::= SEQUENCE {
//!     certID              CertID,
//!     certStatus          CertStatus,
//!     thisUpdate          GeneralizedTime,
//!     nextUpdate          [0] EXPLICIT GeneralizedTime OPTIONAL,
//!     singleExtensions    [1] EXPLICIT Extensions OPTIONAL
//! }
//! ```
//!
//! Requests never carry a nonce: a stapled response is shared by every client
//! of a certificate, so it has to be cacheable.

use crate::der::{self, oid};
use crate::error::{OcspError, VerificationError};
use crate::issuer::Issuer;
use crate::signature::{self, SignedCertificate};
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Utc};
use der_parser::der::DerObject;
use num_bigint::BigUint;
use sha2::Digest;

/// Hash algorithms accepted in a CertID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    pub const ALL: [HashAlgorithm; 4] = [
        HashAlgorithm::Sha1,
        HashAlgorithm::Sha256,
        HashAlgorithm::Sha384,
        HashAlgorithm::Sha512,
    ];

    /// Encoded OID contents
    pub fn oid(&self) -> &'static [u8] {
        match self {
            HashAlgorithm::Sha1 => oid::SHA1,
            HashAlgorithm::Sha256 => oid::SHA256,
            HashAlgorithm::Sha384 => oid::SHA384,
            HashAlgorithm::Sha512 => oid::SHA512,
        }
    }

    pub fn from_oid(contents: &[u8]) -> Option<Self> {
        Self::ALL.into_iter().find(|alg| alg.oid() == contents)
    }

    /// Stable one-byte identifier used when deriving lookup keys
    pub fn id(&self) -> u8 {
        match self {
            HashAlgorithm::Sha1 => 1,
            HashAlgorithm::Sha256 => 2,
            HashAlgorithm::Sha384 => 3,
            HashAlgorithm::Sha512 => 4,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha1 => "SHA-1",
            HashAlgorithm::Sha256 => "SHA-256",
            HashAlgorithm::Sha384 => "SHA-384",
            HashAlgorithm::Sha512 => "SHA-512",
        }
    }

    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha1 => sha1::Sha1::digest(data).to_vec(),
            HashAlgorithm::Sha256 => sha2::Sha256::digest(data).to_vec(),
            HashAlgorithm::Sha384 => sha2::Sha384::digest(data).to_vec(),
            HashAlgorithm::Sha512 => sha2::Sha512::digest(data).to_vec(),
        }
    }

    /// AlgorithmIdentifier with NULL parameters
    fn algorithm_identifier(&self) -> Vec<u8> {
        let mut contents = der::der_oid(self.oid());
        contents.extend_from_slice(&der::der_null());
        der::der_sequence(&contents)
    }
}

/// Certificate identifier used in OCSP requests and responses
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CertId {
    pub hash_algorithm: HashAlgorithm,
    pub issuer_name_hash: Vec<u8>,
    pub issuer_key_hash: Vec<u8>,
    pub serial: BigUint,
}

impl CertId {
    /// CertID for `serial` issued by `issuer`, hashed with `alg`
    pub fn for_issuer(issuer: &Issuer, serial: &BigUint, alg: HashAlgorithm) -> Self {
        Self {
            hash_algorithm: alg,
            issuer_name_hash: issuer.name_hash(alg),
            issuer_key_hash: issuer.key_hash(alg),
            serial: serial.clone(),
        }
    }

    pub fn to_der(&self) -> Vec<u8> {
        let mut contents = self.hash_algorithm.algorithm_identifier();
        contents.extend_from_slice(&der::der_octet_string(&self.issuer_name_hash));
        contents.extend_from_slice(&der::der_octet_string(&self.issuer_key_hash));
        contents.extend_from_slice(&der::der_biguint(&self.serial));
        der::der_sequence(&contents)
    }

    pub(crate) fn decode(object: &DerObject<'_>) -> Result<Self, OcspError> {
        let fields = der::sequence(object, "CertID")?;
        if fields.len() < 4 {
            return Err(OcspError::malformed("CertID", "SEQUENCE too short"));
        }

        let alg = der::sequence(&fields[0], "CertID hashAlgorithm")?;
        let alg_oid = alg
            .first()
            .ok_or_else(|| OcspError::malformed("CertID hashAlgorithm", "empty"))?;
        let alg_oid = der::oid_bytes(alg_oid, "CertID hashAlgorithm")?;
        let hash_algorithm = HashAlgorithm::from_oid(alg_oid).ok_or_else(|| {
            OcspError::unsupported("CertID hash algorithm", hex::encode(alg_oid))
        })?;

        Ok(Self {
            hash_algorithm,
            issuer_name_hash: der::octet_string(&fields[1], "issuerNameHash")?.to_vec(),
            issuer_key_hash: der::octet_string(&fields[2], "issuerKeyHash")?.to_vec(),
            serial: der::unsigned(&fields[3], "serialNumber")?,
        })
    }
}

/// A single-certificate OCSP request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OcspRequest {
    pub cert_id: CertId,
}

impl OcspRequest {
    pub fn new(cert_id: CertId) -> Self {
        Self { cert_id }
    }

    /// Request with a SHA-1 CertID, the form every responder understands
    pub fn for_certificate(issuer: &Issuer, serial: &BigUint) -> Self {
        Self::new(CertId::for_issuer(issuer, serial, HashAlgorithm::Sha1))
    }

    /// Encode as an unsigned OCSPRequest
    pub fn to_der(&self) -> Vec<u8> {
        // Request ::= SEQUENCE { reqCert CertID }
        let request = der::der_sequence(&self.cert_id.to_der());
        // requestList SEQUENCE OF Request
        let request_list = der::der_sequence(&request);
        // TBSRequest with implicit v1 version
        let tbs_request = der::der_sequence(&request_list);
        der::der_sequence(&tbs_request)
    }

    /// Unpadded base64url of the DER request, ready to append as a URL path
    /// segment without escaping
    pub fn to_get_path(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.to_der())
    }

    /// Decode a DER OCSPRequest; only the first entry of the request list is used
    pub fn parse(der_bytes: &[u8]) -> Result<Self, OcspError> {
        let outer = der::parse_object(der_bytes, "OCSPRequest")?;
        let outer = der::sequence(&outer, "OCSPRequest")?;
        let tbs = outer
            .first()
            .ok_or_else(|| OcspError::malformed("OCSPRequest", "missing TBSRequest"))?;
        let tbs = der::sequence(tbs, "TBSRequest")?;

        // Skip the optional version [0] and requestorName [1]
        let list = tbs
            .iter()
            .find(|object| !der::is_context(object, 0) && !der::is_context(object, 1))
            .ok_or_else(|| OcspError::malformed("TBSRequest", "missing requestList"))?;
        let requests = der::sequence(list, "requestList")?;
        let request = requests
            .first()
            .ok_or_else(|| OcspError::malformed("requestList", "no requests"))?;
        let cert_id = der::sequence(request, "Request")?
            .first()
            .ok_or_else(|| OcspError::malformed("Request", "missing CertID"))?;

        Ok(Self {
            cert_id: CertId::decode(cert_id)?,
        })
    }

    /// Decode the path component of a GET request
    ///
    /// Accepts percent-encoded standard base64 as well as URL-safe base64,
    /// with or without padding.
    pub fn from_get_path(path: &str) -> Result<Self, OcspError> {
        let decoded = percent_decode(path.trim_start_matches('/'))?;
        let trimmed = decoded.trim();

        let der_bytes = [&STANDARD, &STANDARD_NO_PAD, &URL_SAFE, &URL_SAFE_NO_PAD]
            .iter()
            .find_map(|engine| engine.decode(trimmed).ok())
            .ok_or_else(|| OcspError::malformed("OCSP GET request", "invalid base64"))?;

        Self::parse(&der_bytes)
    }
}

fn percent_decode(input: &str) -> Result<String, OcspError> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex_digits = bytes
                .get(i + 1..i + 3)
                .ok_or_else(|| OcspError::malformed("OCSP GET request", "truncated escape"))?;
            let mut value = [0u8; 1];
            hex::decode_to_slice(hex_digits, &mut value)
                .map_err(|_| OcspError::malformed("OCSP GET request", "invalid escape"))?;
            out.push(value[0]);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| OcspError::malformed("OCSP GET request", "not UTF-8"))
}

/// OCSP response status (RFC 6960 Section 2.3)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OcspResponseStatus {
    /// Response has valid confirmations
    Successful = 0,
    /// Illegal confirmation request
    MalformedRequest = 1,
    /// Internal error in issuer
    InternalError = 2,
    /// Try again later
    TryLater = 3,
    /// Must sign the request
    SigRequired = 5,
    /// Request unauthorized
    Unauthorized = 6,
}

impl OcspResponseStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Successful),
            1 => Some(Self::MalformedRequest),
            2 => Some(Self::InternalError),
            3 => Some(Self::TryLater),
            5 => Some(Self::SigRequired),
            6 => Some(Self::Unauthorized),
            _ => None,
        }
    }

    pub fn code(&self) -> u8 {
        *self as u8
    }

    /// OCSPResponse carrying only this status, as sent for errors
    pub fn to_response_der(&self) -> Vec<u8> {
        der::der_sequence(&der::der_enumerated(self.code()))
    }
}

/// Certificate status in an OCSP response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateStatus {
    /// Certificate is not revoked
    Good,
    /// Certificate has been revoked
    Revoked {
        revocation_time: DateTime<Utc>,
        /// CRLReason, when present
        reason: Option<u8>,
    },
    /// Responder does not know the certificate
    Unknown,
}

impl CertificateStatus {
    fn decode(object: &DerObject<'_>) -> Result<Self, OcspError> {
        // good [0] IMPLICIT NULL
        if der::is_context(object, 0) {
            return Ok(CertificateStatus::Good);
        }
        // unknown [2] IMPLICIT UnknownInfo
        if der::is_context(object, 2) {
            return Ok(CertificateStatus::Unknown);
        }
        if !der::is_context(object, 1) || !object.header.is_constructed() {
            return Err(OcspError::malformed(
                "certStatus",
                format!("unexpected tag {:?}", object.header.tag()),
            ));
        }

        // revoked [1] IMPLICIT RevokedInfo, so the SEQUENCE tag is absent
        let info = der::parse_concatenated(der::context_contents(object, 1, "RevokedInfo")?, "RevokedInfo")?;
        let (time, _) = info
            .first()
            .ok_or_else(|| OcspError::malformed("RevokedInfo", "missing revocationTime"))?;
        let revocation_time = der::generalized_time(time, "revocationTime")?;
        let reason = match info.get(1) {
            Some((wrapper, _)) => Some(der::enumerated(
                &der::explicit(wrapper, 0, "revocationReason")?,
                "revocationReason",
            )?),
            None => None,
        };

        Ok(CertificateStatus::Revoked {
            revocation_time,
            reason,
        })
    }
}

/// Parsed BasicOCSPResponse for one certificate
#[derive(Debug, Clone)]
pub struct OcspResponse {
    pub cert_status: CertificateStatus,
    /// Serial number of the SingleResponse that was selected
    pub serial: BigUint,
    pub produced_at: DateTime<Utc>,
    pub this_update: DateTime<Utc>,
    pub next_update: Option<DateTime<Utc>>,
    /// Signature algorithm OID contents
    pub signature_algorithm: Vec<u8>,
    pub signature: Vec<u8>,
    /// Certificates embedded by a delegated responder
    pub certs: Vec<Vec<u8>>,
    /// Exact bytes the signature covers
    pub tbs_response_data: Vec<u8>,
    pub raw_bytes: Vec<u8>,
}

impl OcspResponse {
    /// Decode a DER OCSPResponse
    ///
    /// The SingleResponse whose serial equals `want_serial` is selected; if
    /// none matches, the first one is used and the serial check in
    /// [`verify_response`] reports the mismatch.
    pub fn parse(der_bytes: &[u8], want_serial: Option<&BigUint>) -> Result<Self, OcspError> {
        let outer = der::parse_object(der_bytes, "OCSPResponse")?;
        let outer = der::sequence(&outer, "OCSPResponse")?;
        let status = outer
            .first()
            .ok_or_else(|| OcspError::malformed("OCSPResponse", "SEQUENCE is empty"))?;
        let code = der::enumerated(status, "responseStatus")?;
        let status = OcspResponseStatus::from_u8(code).ok_or_else(|| {
            OcspError::malformed("responseStatus", format!("unknown status {}", code))
        })?;
        if status != OcspResponseStatus::Successful {
            return Err(OcspError::Unsuccessful(status));
        }

        // responseBytes [0] EXPLICIT ResponseBytes
        let response_bytes = outer
            .get(1)
            .ok_or_else(|| OcspError::malformed("OCSPResponse", "missing responseBytes"))?;
        let response_bytes = der::explicit(response_bytes, 0, "responseBytes")?;
        let response_bytes = der::sequence(&response_bytes, "ResponseBytes")?;
        if response_bytes.len() < 2 {
            return Err(OcspError::malformed("ResponseBytes", "SEQUENCE too short"));
        }
        let response_type = der::oid_bytes(&response_bytes[0], "responseType")?;
        if response_type != oid::OCSP_BASIC {
            return Err(OcspError::unsupported(
                "OCSP response type",
                hex::encode(response_type),
            ));
        }
        let basic_bytes = der::octet_string(&response_bytes[1], "response")?;

        // Walked with raw encodings kept, since the signature covers the
        // exact tbsResponseData bytes
        let basic = der::split_children(basic_bytes, "BasicOCSPResponse")?;
        if basic.len() < 3 {
            return Err(OcspError::malformed("BasicOCSPResponse", "SEQUENCE too short"));
        }
        let (tbs, tbs_raw) = &basic[0];
        let sig_alg = der::sequence(&basic[1].0, "signatureAlgorithm")?;
        let sig_oid = sig_alg
            .first()
            .ok_or_else(|| OcspError::malformed("signatureAlgorithm", "empty"))?;
        let sig_oid = der::oid_bytes(sig_oid, "signatureAlgorithm")?;
        let signature = der::bit_string(&basic[2].0, "signature")?;

        let mut certs = Vec::new();
        if let Some((wrapper, _)) = basic.get(3) {
            // certs [0] EXPLICIT SEQUENCE OF Certificate
            let list = der::context_contents(wrapper, 0, "certs")?;
            for (cert, raw) in der::split_children(list, "certs")? {
                der::sequence(&cert, "certificate")?;
                certs.push(raw.to_vec());
            }
        }

        let tbs = der::sequence(tbs, "tbsResponseData")?;
        // Skip the optional version [0]
        let mut idx = usize::from(tbs.first().is_some_and(|o| der::is_context(o, 0)));
        // responderID
        idx += 1;
        let produced_at = tbs
            .get(idx)
            .ok_or_else(|| OcspError::malformed("ResponseData", "missing producedAt"))?;
        let produced_at = der::generalized_time(produced_at, "producedAt")?;
        let responses = tbs
            .get(idx + 1)
            .ok_or_else(|| OcspError::malformed("ResponseData", "missing responses"))?;
        let responses = der::sequence(responses, "responses")?;

        let mut selected: Option<SingleResponse> = None;
        for response in responses {
            let single = SingleResponse::decode(response)?;
            let matches = want_serial.map_or(false, |want| *want == single.serial);
            if matches {
                selected = Some(single);
                break;
            }
            if selected.is_none() {
                selected = Some(single);
            }
        }
        let single = selected
            .ok_or_else(|| OcspError::malformed("responses", "no SingleResponse"))?;

        Ok(Self {
            cert_status: single.cert_status,
            serial: single.serial,
            produced_at,
            this_update: single.this_update,
            next_update: single.next_update,
            signature_algorithm: sig_oid.to_vec(),
            signature: signature.to_vec(),
            certs,
            tbs_response_data: tbs_raw.to_vec(),
            raw_bytes: der_bytes.to_vec(),
        })
    }

    /// Check the response signature against `issuer`
    ///
    /// Accepts a signature by the issuer key itself, or by an embedded
    /// delegated responder certificate that the issuer signed and that
    /// carries the OCSPSigning extended key usage.
    pub fn verify_signature(&self, issuer: &Issuer) -> Result<(), OcspError> {
        let direct = signature::verify(
            issuer.spki(),
            &self.signature_algorithm,
            &self.signature,
            &self.tbs_response_data,
        );
        if direct.is_ok() {
            return Ok(());
        }

        for cert_der in &self.certs {
            let responder = match SignedCertificate::parse(cert_der) {
                Ok(responder) => responder,
                Err(_) => continue,
            };
            if responder.check_delegated_by(issuer).is_err() {
                continue;
            }
            if signature::verify(
                &responder.spki,
                &self.signature_algorithm,
                &self.signature,
                &self.tbs_response_data,
            )
            .is_ok()
            {
                return Ok(());
            }
        }

        match direct {
            Err(e) if self.certs.is_empty() => Err(e),
            _ => Err(OcspError::InvalidSignature(
                "not signed by the issuer or an authorized responder".to_string(),
            )),
        }
    }

    /// `thisUpdate <= now <= nextUpdate`
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        match self.next_update {
            Some(next) => self.this_update <= now && now <= next,
            None => false,
        }
    }

    pub fn is_revoked(&self) -> bool {
        matches!(self.cert_status, CertificateStatus::Revoked { .. })
    }
}

struct SingleResponse {
    serial: BigUint,
    cert_status: CertificateStatus,
    this_update: DateTime<Utc>,
    next_update: Option<DateTime<Utc>>,
}

impl SingleResponse {
    fn decode(object: &DerObject<'_>) -> Result<Self, OcspError> {
        let fields = der::sequence(object, "SingleResponse")?;
        if fields.len() < 3 {
            return Err(OcspError::malformed("SingleResponse", "SEQUENCE too short"));
        }
        let cert_id = CertId::decode(&fields[0])?;
        let cert_status = CertificateStatus::decode(&fields[1])?;
        let this_update = der::generalized_time(&fields[2], "thisUpdate")?;
        // nextUpdate [0] EXPLICIT, singleExtensions [1] are ignored
        let next_update = match fields.get(3) {
            Some(wrapper) if der::is_context(wrapper, 0) => Some(der::generalized_time(
                &der::explicit(wrapper, 0, "nextUpdate")?,
                "nextUpdate",
            )?),
            _ => None,
        };

        Ok(Self {
            serial: cert_id.serial,
            cert_status,
            this_update,
            next_update,
        })
    }
}

/// Accept a response only if it is current, internally consistent and for
/// `serial`
///
/// A response without nextUpdate cannot be scheduled for refresh and is
/// rejected as stale.
pub fn verify_response(
    now: DateTime<Utc>,
    serial: &BigUint,
    response: &OcspResponse,
) -> Result<(), VerificationError> {
    if response.this_update > now {
        return Err(VerificationError::NotYetValid {
            this_update: response.this_update,
            now,
        });
    }
    if response.this_update > response.produced_at {
        return Err(VerificationError::ProducedBeforeThisUpdate {
            this_update: response.this_update,
            produced_at: response.produced_at,
        });
    }
    match response.next_update {
        Some(next) if next >= now => {}
        next_update => return Err(VerificationError::Stale { next_update, now }),
    }
    if response.serial != *serial {
        return Err(VerificationError::SerialMismatch {
            wanted: serial.clone(),
            got: response.serial.clone(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ResponseBuilder, TestAuthority};
    use chrono::Duration;

    #[test]
    fn test_ocsp_response_status_conversion() {
        assert_eq!(OcspResponseStatus::from_u8(0), Some(OcspResponseStatus::Successful));
        assert_eq!(OcspResponseStatus::from_u8(6), Some(OcspResponseStatus::Unauthorized));
        assert_eq!(OcspResponseStatus::from_u8(4), None);
        assert_eq!(OcspResponseStatus::TryLater.code(), 3);
    }

    #[test]
    fn test_request_encoding_and_parse() {
        let ca = TestAuthority::new("Request CA");
        let serial = BigUint::from(0x1234_5678u64);
        let request = OcspRequest::for_certificate(ca.issuer(), &serial);

        let der_bytes = request.to_der();
        assert_eq!(der_bytes[0], der::TAG_SEQUENCE);
        assert!(OcspRequest::parse(&der_bytes[..der_bytes.len() - 1]).is_err());

        let parsed = OcspRequest::parse(&der_bytes).unwrap();
        assert_eq!(parsed, request);
        assert_eq!(parsed.cert_id.hash_algorithm, HashAlgorithm::Sha1);
        assert_eq!(parsed.cert_id.issuer_name_hash.len(), 20);
    }

    #[test]
    fn test_get_path_decoding() {
        let ca = TestAuthority::new("GET CA");
        for alg in HashAlgorithm::ALL {
            let request = OcspRequest::new(CertId::for_issuer(ca.issuer(), &BigUint::from(99u32), alg));
            let path = request.to_get_path();
            assert_eq!(path, URL_SAFE_NO_PAD.encode(request.to_der()));
            assert!(!path.contains('+') && !path.contains('/') && !path.contains('='));
            assert_eq!(OcspRequest::from_get_path(&path).unwrap(), request);

            // RFC 6960 style: standard base64, URL-escaped
            let escaped = STANDARD
                .encode(request.to_der())
                .replace('+', "%2B")
                .replace('/', "%2F")
                .replace('=', "%3D");
            assert_eq!(OcspRequest::from_get_path(&escaped).unwrap(), request);
        }

        assert!(OcspRequest::from_get_path("not base64!").is_err());
        assert!(OcspRequest::from_get_path("%zz").is_err());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(OcspRequest::parse(&[0x30, 0x00]).is_err());
        assert!(OcspResponse::parse(b"hello", None).is_err());
    }

    #[test]
    fn test_unsuccessful_status() {
        let der_bytes = OcspResponseStatus::TryLater.to_response_der();
        match OcspResponse::parse(&der_bytes, None) {
            Err(OcspError::Unsuccessful(OcspResponseStatus::TryLater)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_parse_and_verify_good_response() {
        let ca = TestAuthority::new("Good CA");
        let serial = BigUint::from(258u32);
        let der_bytes = ResponseBuilder::new(serial.clone()).sign(&ca);

        let response = OcspResponse::parse(&der_bytes, Some(&serial)).unwrap();
        assert_eq!(response.cert_status, CertificateStatus::Good);
        assert_eq!(response.serial, serial);
        assert!(response.next_update.is_some());
        assert!(response.produced_at >= response.this_update);
        assert_eq!(response.raw_bytes, der_bytes);

        response.verify_signature(ca.issuer()).unwrap();
        verify_response(Utc::now(), &serial, &response).unwrap();
        assert!(response.is_fresh(Utc::now()));
    }

    #[test]
    fn test_signature_from_other_issuer_rejected() {
        let ca = TestAuthority::new("Real CA");
        let other = TestAuthority::new("Other CA");
        let serial = BigUint::from(7u32);
        let der_bytes = ResponseBuilder::new(serial.clone()).sign(&other);

        let response = OcspResponse::parse(&der_bytes, Some(&serial)).unwrap();
        assert!(matches!(
            response.verify_signature(ca.issuer()),
            Err(OcspError::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_revoked_status() {
        let ca = TestAuthority::new("Revoking CA");
        let serial = BigUint::from(42u32);
        let revoked_at = Utc::now() - Duration::days(3);
        let der_bytes = ResponseBuilder::new(serial.clone())
            .revoked(revoked_at, Some(1))
            .sign(&ca);

        let response = OcspResponse::parse(&der_bytes, Some(&serial)).unwrap();
        match response.cert_status {
            CertificateStatus::Revoked {
                revocation_time,
                reason,
            } => {
                assert_eq!(revocation_time.timestamp(), revoked_at.timestamp());
                assert_eq!(reason, Some(1));
            }
            other => panic!("expected revoked, got {:?}", other),
        }
        assert!(response.is_revoked());
    }

    #[test]
    fn test_verify_response_kinds() {
        let ca = TestAuthority::new("Timing CA");
        let serial = BigUint::from(258u32);
        let now = Utc::now();

        let stale = ResponseBuilder::new(serial.clone())
            .this_update(now - Duration::hours(3))
            .next_update(Some(now - Duration::hours(1)))
            .sign(&ca);
        let response = OcspResponse::parse(&stale, Some(&serial)).unwrap();
        assert!(matches!(
            verify_response(now, &serial, &response),
            Err(VerificationError::Stale { next_update: Some(_), .. })
        ));

        let future = ResponseBuilder::new(serial.clone())
            .this_update(now + Duration::hours(1))
            .produced_at(now + Duration::hours(1))
            .sign(&ca);
        let response = OcspResponse::parse(&future, Some(&serial)).unwrap();
        assert!(matches!(
            verify_response(now, &serial, &response),
            Err(VerificationError::NotYetValid { .. })
        ));

        let no_next = ResponseBuilder::new(serial.clone()).next_update(None).sign(&ca);
        let response = OcspResponse::parse(&no_next, Some(&serial)).unwrap();
        assert!(matches!(
            verify_response(now, &serial, &response),
            Err(VerificationError::Stale { next_update: None, .. })
        ));

        let backdated = ResponseBuilder::new(serial.clone())
            .produced_at(now - Duration::hours(2))
            .this_update(now - Duration::minutes(5))
            .sign(&ca);
        let response = OcspResponse::parse(&backdated, Some(&serial)).unwrap();
        assert!(matches!(
            verify_response(now, &serial, &response),
            Err(VerificationError::ProducedBeforeThisUpdate { .. })
        ));

        let other = ResponseBuilder::new(BigUint::from(259u32)).sign(&ca);
        let response = OcspResponse::parse(&other, Some(&serial)).unwrap();
        assert!(matches!(
            verify_response(now, &serial, &response),
            Err(VerificationError::SerialMismatch { .. })
        ));
    }

    #[test]
    fn test_selects_matching_single_response() {
        let ca = TestAuthority::new("Multi CA");
        let wanted = BigUint::from(2u32);
        let der_bytes = ResponseBuilder::new(BigUint::from(1u32))
            .also_for(wanted.clone())
            .sign(&ca);

        let response = OcspResponse::parse(&der_bytes, Some(&wanted)).unwrap();
        assert_eq!(response.serial, wanted);

        let first = OcspResponse::parse(&der_bytes, None).unwrap();
        assert_eq!(first.serial, BigUint::from(1u32));
    }
}
