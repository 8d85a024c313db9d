//! DER helpers
//!
//! Encoding is done by hand against the TLV layout, since OCSP only needs a
//! handful of ASN.1 types. Decoding goes through `der_parser`; the helpers
//! below wrap its `DerObject` accessors with errors that name the field.

use crate::error::OcspError;
use chrono::{DateTime, TimeZone, Utc};
use der_parser::asn1_rs::{Any, FromDer};
use der_parser::ber::{BerObjectContent, Class};
use der_parser::der::DerObject;
use num_bigint::BigUint;

pub const TAG_INTEGER: u8 = 0x02;
pub const TAG_BIT_STRING: u8 = 0x03;
pub const TAG_OCTET_STRING: u8 = 0x04;
pub const TAG_NULL: u8 = 0x05;
pub const TAG_OID: u8 = 0x06;
pub const TAG_ENUMERATED: u8 = 0x0A;
pub const TAG_UTF8_STRING: u8 = 0x0C;
pub const TAG_GENERALIZED_TIME: u8 = 0x18;
pub const TAG_SEQUENCE: u8 = 0x30;
pub const TAG_SET: u8 = 0x31;

/// Context-specific, constructed tag `[n]` (EXPLICIT or IMPLICIT SEQUENCE)
pub const fn context_constructed(n: u8) -> u8 {
    0xA0 | n
}

/// Context-specific, primitive tag `[n]` (IMPLICIT primitive type)
pub const fn context_primitive(n: u8) -> u8 {
    0x80 | n
}

/// Encoded OBJECT IDENTIFIER contents (without tag and length)
pub mod oid {
    /// 1.3.14.3.2.26
    pub const SHA1: &[u8] = &[0x2B, 0x0E, 0x03, 0x02, 0x1A];
    /// 2.16.840.1.101.3.4.2.1
    pub const SHA256: &[u8] = &[0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01];
    /// 2.16.840.1.101.3.4.2.2
    pub const SHA384: &[u8] = &[0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x02];
    /// 2.16.840.1.101.3.4.2.3
    pub const SHA512: &[u8] = &[0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x03];

    /// 1.2.840.113549.1.1.1
    pub const RSA_ENCRYPTION: &[u8] = &[0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x01, 0x01];
    /// 1.2.840.113549.1.1.5
    pub const SHA1_WITH_RSA: &[u8] = &[0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x01, 0x05];
    /// 1.2.840.113549.1.1.11
    pub const SHA256_WITH_RSA: &[u8] = &[0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x01, 0x0B];
    /// 1.2.840.113549.1.1.12
    pub const SHA384_WITH_RSA: &[u8] = &[0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x01, 0x0C];
    /// 1.2.840.113549.1.1.13
    pub const SHA512_WITH_RSA: &[u8] = &[0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x01, 0x0D];

    /// 1.2.840.10045.2.1
    pub const EC_PUBLIC_KEY: &[u8] = &[0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x02, 0x01];
    /// 1.2.840.10045.3.1.7
    pub const CURVE_P256: &[u8] = &[0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x03, 0x01, 0x07];
    /// 1.3.132.0.34
    pub const CURVE_P384: &[u8] = &[0x2B, 0x81, 0x04, 0x00, 0x22];
    /// 1.2.840.10045.4.3.2
    pub const ECDSA_WITH_SHA256: &[u8] = &[0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x04, 0x03, 0x02];
    /// 1.2.840.10045.4.3.3
    pub const ECDSA_WITH_SHA384: &[u8] = &[0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x04, 0x03, 0x03];

    /// 1.3.101.112
    pub const ED25519: &[u8] = &[0x2B, 0x65, 0x70];

    /// 1.3.6.1.5.5.7.48.1.1 (id-pkix-ocsp-basic)
    pub const OCSP_BASIC: &[u8] = &[0x2B, 0x06, 0x01, 0x05, 0x05, 0x07, 0x30, 0x01, 0x01];
    /// 1.3.6.1.5.5.7.48.1 (id-ad-ocsp)
    pub const AD_OCSP: &[u8] = &[0x2B, 0x06, 0x01, 0x05, 0x05, 0x07, 0x30, 0x01];
    /// 1.3.6.1.5.5.7.48.2 (id-ad-caIssuers)
    pub const AD_CA_ISSUERS: &[u8] = &[0x2B, 0x06, 0x01, 0x05, 0x05, 0x07, 0x30, 0x02];

    /// 2.5.4.3 (commonName)
    pub const COMMON_NAME: &[u8] = &[0x55, 0x04, 0x03];
}

// ============================================================================
// Encoding
// ============================================================================

/// Encode a SEQUENCE
pub fn der_sequence(contents: &[u8]) -> Vec<u8> {
    der_tlv(TAG_SEQUENCE, contents)
}

/// Encode a SET
pub fn der_set(contents: &[u8]) -> Vec<u8> {
    der_tlv(TAG_SET, contents)
}

/// Encode an OCTET STRING
pub fn der_octet_string(contents: &[u8]) -> Vec<u8> {
    der_tlv(TAG_OCTET_STRING, contents)
}

/// Encode a BIT STRING with zero unused bits
pub fn der_bit_string(contents: &[u8]) -> Vec<u8> {
    let mut value = Vec::with_capacity(contents.len() + 1);
    value.push(0x00);
    value.extend_from_slice(contents);
    der_tlv(TAG_BIT_STRING, &value)
}

/// Encode a non-negative INTEGER from its big-endian magnitude
pub fn der_integer(value: &[u8]) -> Vec<u8> {
    let start = value.iter().position(|&b| b != 0).unwrap_or(value.len());
    let mut int_value = value[start..].to_vec();
    if int_value.is_empty() {
        int_value.push(0x00);
    } else if int_value[0] & 0x80 != 0 {
        int_value.insert(0, 0x00);
    }
    der_tlv(TAG_INTEGER, &int_value)
}

/// Encode an unsigned big integer as INTEGER
pub fn der_biguint(value: &BigUint) -> Vec<u8> {
    der_integer(&value.to_bytes_be())
}

/// Encode a small ENUMERATED value
pub fn der_enumerated(value: u8) -> Vec<u8> {
    der_tlv(TAG_ENUMERATED, &[value])
}

/// Encode an OBJECT IDENTIFIER from already encoded contents
pub fn der_oid(contents: &[u8]) -> Vec<u8> {
    der_tlv(TAG_OID, contents)
}

/// Encode an OBJECT IDENTIFIER from its arcs
pub fn der_oid_arcs(components: &[u64]) -> Vec<u8> {
    if components.len() < 2 {
        return der_tlv(TAG_OID, &[]);
    }

    let mut encoded = encode_base128(40 * components[0] + components[1]);
    for &component in &components[2..] {
        encoded.extend_from_slice(&encode_base128(component));
    }

    der_tlv(TAG_OID, &encoded)
}

/// Encode NULL
pub fn der_null() -> Vec<u8> {
    vec![TAG_NULL, 0x00]
}

/// Encode a UTF8String
pub fn der_utf8_string(value: &str) -> Vec<u8> {
    der_tlv(TAG_UTF8_STRING, value.as_bytes())
}

/// Encode a GeneralizedTime (`YYYYMMDDHHMMSSZ`, seconds precision)
pub fn der_generalized_time(time: &DateTime<Utc>) -> Vec<u8> {
    let text = time.format("%Y%m%d%H%M%SZ").to_string();
    der_tlv(TAG_GENERALIZED_TIME, text.as_bytes())
}

/// Encode context-specific explicit tag
pub fn der_explicit_context(tag: u8, contents: &[u8]) -> Vec<u8> {
    der_tlv(context_constructed(tag), contents)
}

/// Encode Tag-Length-Value
pub fn der_tlv(tag: u8, contents: &[u8]) -> Vec<u8> {
    let mut result = vec![tag];
    result.extend_from_slice(&der_length(contents.len()));
    result.extend_from_slice(contents);
    result
}

/// Encode DER length
fn der_length(length: usize) -> Vec<u8> {
    if length < 128 {
        vec![length as u8]
    } else {
        let mut length_bytes = Vec::new();
        let mut len = length;
        while len > 0 {
            length_bytes.insert(0, (len & 0xFF) as u8);
            len >>= 8;
        }
        let mut result = vec![0x80 | length_bytes.len() as u8];
        result.extend_from_slice(&length_bytes);
        result
    }
}

/// Encode value in base-128 (for OID components)
fn encode_base128(mut value: u64) -> Vec<u8> {
    let mut result = vec![(value & 0x7F) as u8];
    value >>= 7;
    while value > 0 {
        result.insert(0, (value & 0x7F) as u8 | 0x80);
        value >>= 7;
    }
    result
}

// ============================================================================
// Decoding
// ============================================================================

/// Parse exactly one DER object spanning all of `input`
pub fn parse_object<'a>(input: &'a [u8], what: &'static str) -> Result<DerObject<'a>, OcspError> {
    let (rest, object) = der_parser::parse_der(input)
        .map_err(|e| OcspError::malformed(what, format!("{:?}", e)))?;
    if !rest.is_empty() {
        return Err(OcspError::malformed(
            what,
            format!("{} trailing bytes", rest.len()),
        ));
    }
    Ok(object)
}

/// Children of the constructed element `input`, each with its complete
/// encoding (what signatures are computed over)
pub fn split_children<'a>(
    input: &'a [u8],
    what: &'static str,
) -> Result<Vec<(DerObject<'a>, &'a [u8])>, OcspError> {
    let (rest, any) =
        Any::from_der(input).map_err(|e| OcspError::malformed(what, format!("{:?}", e)))?;
    if !rest.is_empty() {
        return Err(OcspError::malformed(
            what,
            format!("{} trailing bytes", rest.len()),
        ));
    }
    if !any.header.is_constructed() {
        return Err(OcspError::malformed(what, "not a constructed element"));
    }
    parse_concatenated(any.data, what)
}

/// Every object in `input`, back to back, each with its complete encoding
pub fn parse_concatenated<'a>(
    input: &'a [u8],
    what: &'static str,
) -> Result<Vec<(DerObject<'a>, &'a [u8])>, OcspError> {
    let mut objects = Vec::new();
    let mut remaining = input;
    while !remaining.is_empty() {
        let (rest, object) = der_parser::parse_der(remaining)
            .map_err(|e| OcspError::malformed(what, format!("{:?}", e)))?;
        objects.push((object, &remaining[..remaining.len() - rest.len()]));
        remaining = rest;
    }
    Ok(objects)
}

/// Elements of a SEQUENCE
pub fn sequence<'b, 'a>(
    object: &'b DerObject<'a>,
    what: &'static str,
) -> Result<&'b [DerObject<'a>], OcspError> {
    object
        .as_sequence()
        .map(Vec::as_slice)
        .map_err(|_| OcspError::malformed(what, "not a SEQUENCE"))
}

/// Whether `object` carries the context-specific tag `[n]`
pub fn is_context(object: &DerObject<'_>, n: u32) -> bool {
    object.header.class() == Class::ContextSpecific && object.header.tag().0 == n
}

/// Contents of a context-specific `[n]` element, for IMPLICIT types
pub fn context_contents<'a>(
    object: &DerObject<'a>,
    n: u32,
    what: &'static str,
) -> Result<&'a [u8], OcspError> {
    if !is_context(object, n) {
        return Err(OcspError::malformed(
            what,
            format!("expected [{}], found {:?}", n, object.header.tag()),
        ));
    }
    object
        .as_slice()
        .map_err(|_| OcspError::malformed(what, "unreadable tagged value"))
}

/// The object inside an `[n] EXPLICIT` wrapper
pub fn explicit<'a>(
    object: &DerObject<'a>,
    n: u32,
    what: &'static str,
) -> Result<DerObject<'a>, OcspError> {
    if !object.header.is_constructed() {
        return Err(OcspError::malformed(what, "EXPLICIT tag must be constructed"));
    }
    parse_object(context_contents(object, n, what)?, what)
}

/// Encoded contents of an OBJECT IDENTIFIER
pub fn oid_bytes<'b>(object: &'b DerObject<'_>, what: &'static str) -> Result<&'b [u8], OcspError> {
    object
        .as_oid()
        .map(|oid| oid.as_bytes())
        .map_err(|_| OcspError::malformed(what, "not an OBJECT IDENTIFIER"))
}

pub fn octet_string<'a>(object: &DerObject<'a>, what: &'static str) -> Result<&'a [u8], OcspError> {
    match object.content {
        BerObjectContent::OctetString(octets) => Ok(octets),
        _ => Err(OcspError::malformed(what, "not an OCTET STRING")),
    }
}

/// BIT STRING that must not have unused bits
pub fn bit_string<'a>(object: &DerObject<'a>, what: &'static str) -> Result<&'a [u8], OcspError> {
    match &object.content {
        BerObjectContent::BitString(0, bits) => Ok(bits.data),
        BerObjectContent::BitString(unused, _) => Err(OcspError::malformed(
            what,
            format!("{} unused bits", unused),
        )),
        _ => Err(OcspError::malformed(what, "not a BIT STRING")),
    }
}

/// Non-negative INTEGER
pub fn unsigned(object: &DerObject<'_>, what: &'static str) -> Result<BigUint, OcspError> {
    if !matches!(object.content, BerObjectContent::Integer(_)) {
        return Err(OcspError::malformed(what, "not an INTEGER"));
    }
    object
        .as_biguint()
        .map_err(|_| OcspError::malformed(what, "negative INTEGER"))
}

/// ENUMERATED value that fits in a byte
pub fn enumerated(object: &DerObject<'_>, what: &'static str) -> Result<u8, OcspError> {
    match object.content {
        BerObjectContent::Enum(value) => u8::try_from(value)
            .map_err(|_| OcspError::malformed(what, format!("value {} out of range", value))),
        _ => Err(OcspError::malformed(what, "not ENUMERATED")),
    }
}

/// GeneralizedTime; the parser enforces the `Z` suffix DER requires and
/// fractional seconds are dropped
pub fn generalized_time(
    object: &DerObject<'_>,
    what: &'static str,
) -> Result<DateTime<Utc>, OcspError> {
    let time = match &object.content {
        BerObjectContent::GeneralizedTime(time) => time,
        _ => return Err(OcspError::malformed(what, "not a GeneralizedTime")),
    };
    let year = i32::try_from(time.year)
        .map_err(|_| OcspError::malformed(what, format!("year {} out of range", time.year)))?;
    Utc.with_ymd_and_hms(
        year,
        time.month.into(),
        time.day.into(),
        time.hour.into(),
        time.minute.into(),
        time.second.into(),
    )
    .single()
    .ok_or_else(|| OcspError::malformed(what, format!("'{}' is not a valid date", time)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_der_length_long_form() {
        let encoded = der_octet_string(&[0u8; 300]);
        assert_eq!(&encoded[..4], &[0x04, 0x82, 0x01, 0x2C]);

        let object = parse_object(&encoded, "octets").unwrap();
        assert_eq!(octet_string(&object, "octets").unwrap().len(), 300);
    }

    #[test]
    fn test_der_integer_padding() {
        assert_eq!(der_integer(&[0x80]), vec![0x02, 0x02, 0x00, 0x80]);
        assert_eq!(der_integer(&[0x00, 0x00, 0x01]), vec![0x02, 0x01, 0x01]);
        assert_eq!(der_integer(&[]), vec![0x02, 0x01, 0x00]);
    }

    #[test]
    fn test_der_oid_arcs_matches_constants() {
        assert_eq!(der_oid_arcs(&[2, 16, 840, 1, 101, 3, 4, 2, 1]), der_oid(oid::SHA256));
        assert_eq!(der_oid_arcs(&[1, 3, 6, 1, 5, 5, 7, 48, 1, 1]), der_oid(oid::OCSP_BASIC));
        assert_eq!(der_oid_arcs(&[1, 3, 132, 0, 34]), der_oid(oid::CURVE_P384));
    }

    #[test]
    fn test_sequence_walk() {
        let mut inner = der_integer(&[0x01, 0x02]);
        inner.extend_from_slice(&der_oid(oid::SHA1));
        inner.extend_from_slice(&der_explicit_context(0, &der_enumerated(3)));
        let seq = der_sequence(&inner);

        let object = parse_object(&seq, "seq").unwrap();
        let items = sequence(&object, "seq").unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(unsigned(&items[0], "int").unwrap(), BigUint::from(258u32));
        assert_eq!(oid_bytes(&items[1], "oid").unwrap(), oid::SHA1);
        assert!(is_context(&items[2], 0));
        assert!(!is_context(&items[2], 1));
        let wrapped = explicit(&items[2], 0, "tagged").unwrap();
        assert_eq!(enumerated(&wrapped, "enum").unwrap(), 3);

        assert!(octet_string(&items[0], "int").is_err());
        assert!(explicit(&items[2], 1, "tagged").is_err());
    }

    #[test]
    fn test_split_children_keeps_encodings() {
        let first = der_sequence(&der_null());
        let second = der_bit_string(&[0xAA, 0xBB]);
        let mut contents = first.clone();
        contents.extend_from_slice(&second);
        let seq = der_sequence(&contents);

        let children = split_children(&seq, "seq").unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].1, first.as_slice());
        assert_eq!(children[1].1, second.as_slice());
        assert_eq!(bit_string(&children[1].0, "bits").unwrap(), &[0xAA, 0xBB]);

        assert!(split_children(&der_null(), "null").is_err());
    }

    #[test]
    fn test_reject_truncated_and_indefinite() {
        assert!(parse_object(&[0x30, 0x05, 0x01], "seq").is_err());
        assert!(parse_object(&[0x30, 0x80, 0x00, 0x00], "seq").is_err());
        assert!(parse_object(&[0x04, 0x01, 0xAA, 0xBB], "octets").is_err());
        assert!(parse_object(&[], "empty").is_err());
    }

    #[test]
    fn test_generalized_time_round_trip() {
        let time = Utc.with_ymd_and_hms(2024, 2, 29, 23, 59, 58).unwrap();
        let encoded = der_generalized_time(&time);
        let object = parse_object(&encoded, "time").unwrap();
        assert_eq!(generalized_time(&object, "time").unwrap(), time);
    }

    #[test]
    fn test_generalized_time_fraction_and_errors() {
        let encoded = der_tlv(TAG_GENERALIZED_TIME, b"20240101120000.123Z");
        let object = parse_object(&encoded, "time").unwrap();
        assert_eq!(
            generalized_time(&object, "time").unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
        );

        // DER requires UTC
        let local = der_tlv(TAG_GENERALIZED_TIME, b"20240101120000");
        assert!(parse_object(&local, "time").is_err());

        let null_der = der_null();
        let not_time = parse_object(&null_der, "time").unwrap();
        assert!(generalized_time(&not_time, "time").is_err());
    }

    #[test]
    fn test_unsigned_rejects_negative() {
        let negative_der = der_tlv(TAG_INTEGER, &[0xFF]);
        let negative = parse_object(&negative_der, "serial").unwrap();
        assert!(unsigned(&negative, "serial").is_err());

        let padded_der = der_integer(&[0xFF]);
        let padded = parse_object(&padded_der, "serial").unwrap();
        assert_eq!(unsigned(&padded, "serial").unwrap(), BigUint::from(255u32));
    }
}
