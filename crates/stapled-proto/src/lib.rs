//! OCSP protocol layer for the stapled daemon
//!
//! Encodes and decodes OCSP requests and responses (RFC 6960), verifies
//! response signatures and freshness, and extracts what the daemon needs from
//! issuer and leaf certificates.
//!
//! # Example
//!
//! ```no_run
//! use num_bigint::BigUint;
//! use stapled_proto::{verify_response, Issuer, OcspRequest, OcspResponse};
//!
//! # fn fetch(_url: &str) -> Vec<u8> { Vec::new() }
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let issuer = Issuer::from_file("issuer.pem".as_ref())?;
//! let serial = BigUint::from(258u32);
//!
//! let request = OcspRequest::for_certificate(&issuer, &serial);
//! let body = fetch(&format!("http://ocsp.example.com/{}", request.to_get_path()));
//!
//! let response = OcspResponse::parse(&body, Some(&serial))?;
//! response.verify_signature(&issuer)?;
//! verify_response(chrono::Utc::now(), &serial, &response)?;
//! # Ok(())
//! # }
//! ```

pub mod certificate;
pub mod der;
pub mod error;
pub mod issuer;
pub mod ocsp;
pub mod signature;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use certificate::CertificateInfo;
pub use error::{OcspError, VerificationError};
pub use issuer::Issuer;
pub use ocsp::{
    verify_response, CertId, CertificateStatus, HashAlgorithm, OcspRequest, OcspResponse,
    OcspResponseStatus,
};
