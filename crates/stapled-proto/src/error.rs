//! Error types for OCSP encoding, decoding and verification

use crate::ocsp::OcspResponseStatus;
use chrono::{DateTime, Utc};
use num_bigint::BigUint;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while decoding or checking OCSP and X.509 structures
#[derive(Debug, Error)]
pub enum OcspError {
    #[error("malformed {what}: {reason}")]
    Malformed { what: &'static str, reason: String },

    #[error("unsupported {what}: {detail}")]
    Unsupported { what: &'static str, detail: String },

    #[error("OCSP responder returned status {0:?}")]
    Unsuccessful(OcspResponseStatus),

    #[error("OCSP response signature invalid: {0}")]
    InvalidSignature(String),

    #[error("certificate parse error: {0}")]
    Certificate(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl OcspError {
    pub(crate) fn malformed(what: &'static str, reason: impl Into<String>) -> Self {
        OcspError::Malformed {
            what,
            reason: reason.into(),
        }
    }

    pub(crate) fn unsupported(what: &'static str, detail: impl Into<String>) -> Self {
        OcspError::Unsupported {
            what,
            detail: detail.into(),
        }
    }
}

/// Reasons a well-formed, correctly signed response is still unacceptable
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerificationError {
    #[error("OCSP response is not yet valid: thisUpdate {this_update} is after {now}")]
    NotYetValid {
        this_update: DateTime<Utc>,
        now: DateTime<Utc>,
    },

    #[error("stale OCSP response: nextUpdate {} is before {now}", describe_time(.next_update))]
    Stale {
        next_update: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    },

    #[error("OCSP response thisUpdate {this_update} is after producedAt {produced_at}")]
    ProducedBeforeThisUpdate {
        this_update: DateTime<Utc>,
        produced_at: DateTime<Utc>,
    },

    #[error("OCSP response serial mismatch: wanted {wanted:x}, got {got:x}")]
    SerialMismatch { wanted: BigUint, got: BigUint },
}

fn describe_time(time: &Option<DateTime<Utc>>) -> String {
    match time {
        Some(t) => t.to_rfc3339(),
        None => "(absent)".to_string(),
    }
}
