//! Placeholder `CERT.RSA` block.
//!
//! The block has the shape of a PKCS#7 `SignedData` (ContentInfo, version,
//! digest algorithm set, detached data content info, one SignerInfo) but
//! carries no certificate and its signature is a SHA-256 expansion of
//! `CERT.SF`. It cannot be verified cryptographically.
//!
//! The encoding uses the following ASN.1 DER tags:
//! - 0x02: INTEGER
//! - 0x04: OCTET STRING
//! - 0x05: NULL
//! - 0x06: OBJECT IDENTIFIER
//! - 0x0c: UTF8String
//! - 0x30: SEQUENCE
//! - 0x31: SET
//! - 0xa0: [0] EXPLICIT

use sha2::{Digest, Sha256};

const DER_TAG_INTEGER: u8 = 0x02;
const DER_TAG_OCTET_STRING: u8 = 0x04;
const DER_TAG_NULL: u8 = 0x05;
const DER_TAG_OID: u8 = 0x06;
const DER_TAG_UTF8STRING: u8 = 0x0c;
const DER_TAG_SEQUENCE: u8 = 0x30;
const DER_TAG_SET: u8 = 0x31;
const DER_TAG_CONTEXT_0: u8 = 0xa0;

/// 1.2.840.113549.1.7.2
pub const OID_SIGNED_DATA: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x07, 0x02];
/// 1.2.840.113549.1.7.1
pub const OID_DATA: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x07, 0x01];
/// 1.3.14.3.2.26
pub const OID_SHA1: &[u8] = &[0x2b, 0x0e, 0x03, 0x02, 0x1a];
/// 1.2.840.113549.1.1.1
pub const OID_RSA_ENCRYPTION: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x01];
/// 2.5.4.3
const OID_COMMON_NAME: &[u8] = &[0x55, 0x04, 0x03];

/// Size of the pseudo-signature, matching a 2048-bit RSA signature.
pub const SIGNATURE_SIZE: usize = 256;

/// Encode a length value in DER format.
///
/// For lengths < 128, uses short form (1 byte).
/// For lengths >= 128, uses long form (1 + n bytes).
fn encode_length(output: &mut Vec<u8>, length: usize) {
    if length < 128 {
        output.push(length as u8);
    } else {
        let bytes_needed = (64 - (length as u64).leading_zeros() as usize).div_ceil(8);
        output.push(0x80 | bytes_needed as u8);
        for i in (0..bytes_needed).rev() {
            output.push(((length >> (i * 8)) & 0xFF) as u8);
        }
    }
}

fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(content.len() + 6);
    output.push(tag);
    encode_length(&mut output, content.len());
    output.extend_from_slice(content);
    output
}

fn constructed(tag: u8, parts: &[Vec<u8>]) -> Vec<u8> {
    tlv(tag, &parts.concat())
}

fn small_integer(value: u8) -> Vec<u8> {
    tlv(DER_TAG_INTEGER, &[value])
}

fn algorithm(oid: &[u8]) -> Vec<u8> {
    constructed(DER_TAG_SEQUENCE, &[tlv(DER_TAG_OID, oid), tlv(DER_TAG_NULL, &[])])
}

/// `CN=<signer>` as a one-attribute X.501 name.
fn name(common_name: &str) -> Vec<u8> {
    let attribute = constructed(
        DER_TAG_SEQUENCE,
        &[
            tlv(DER_TAG_OID, OID_COMMON_NAME),
            tlv(DER_TAG_UTF8STRING, common_name.as_bytes()),
        ],
    );
    constructed(
        DER_TAG_SEQUENCE,
        &[constructed(DER_TAG_SET, &[attribute])],
    )
}

/// Expands SHA-256 of `signed` to [`SIGNATURE_SIZE`] bytes.
fn pseudo_signature(signed: &[u8]) -> Vec<u8> {
    let mut signature = Vec::with_capacity(SIGNATURE_SIZE);
    let mut counter = 0u32;
    while signature.len() < SIGNATURE_SIZE {
        let mut hasher = Sha256::new();
        hasher.update(counter.to_be_bytes());
        hasher.update(signed);
        signature.extend_from_slice(&hasher.finalize());
        counter += 1;
    }
    signature.truncate(SIGNATURE_SIZE);
    signature
}

/// Positive 8-byte serial number derived from `signed`.
fn serial_number(signed: &[u8]) -> Vec<u8> {
    let digest = Sha256::digest(signed);
    let mut serial = digest[..8].to_vec();
    // high bit clear keeps it positive, bit 6 set keeps it minimal
    serial[0] = (serial[0] & 0x7f) | 0x40;
    tlv(DER_TAG_INTEGER, &serial)
}

/// Builds the `CERT.RSA` block for the signature file bytes `signed`.
pub fn signature_block(signed: &[u8], signer: &str) -> Vec<u8> {
    let signer_info = constructed(
        DER_TAG_SEQUENCE,
        &[
            small_integer(1),
            constructed(DER_TAG_SEQUENCE, &[name(signer), serial_number(signed)]),
            algorithm(OID_SHA1),
            algorithm(OID_RSA_ENCRYPTION),
            tlv(DER_TAG_OCTET_STRING, &pseudo_signature(signed)),
        ],
    );
    let signed_data = constructed(
        DER_TAG_SEQUENCE,
        &[
            small_integer(1),
            constructed(DER_TAG_SET, &[algorithm(OID_SHA1)]),
            constructed(DER_TAG_SEQUENCE, &[tlv(DER_TAG_OID, OID_DATA)]),
            constructed(DER_TAG_SET, &[signer_info]),
        ],
    );
    constructed(
        DER_TAG_SEQUENCE,
        &[
            tlv(DER_TAG_OID, OID_SIGNED_DATA),
            constructed(DER_TAG_CONTEXT_0, &[signed_data]),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Returns (tag, content) of the element at the start of `bytes` and
    /// the remaining bytes.
    fn read_tlv(bytes: &[u8]) -> (u8, &[u8], &[u8]) {
        let tag = bytes[0];
        let (len, header) = if bytes[1] < 0x80 {
            (bytes[1] as usize, 2)
        } else {
            let n = (bytes[1] & 0x7f) as usize;
            let len = bytes[2..2 + n]
                .iter()
                .fold(0usize, |acc, b| (acc << 8) | *b as usize);
            (len, 2 + n)
        };
        (tag, &bytes[header..header + len], &bytes[header + len..])
    }

    #[test]
    fn test_encode_length() {
        let mut out = vec![];
        encode_length(&mut out, 5);
        assert_eq!(out, [5]);
        out.clear();
        encode_length(&mut out, 200);
        assert_eq!(out, [0x81, 200]);
        out.clear();
        encode_length(&mut out, 300);
        assert_eq!(out, [0x82, 0x01, 0x2c]);
    }

    #[test]
    fn test_signature_block_shape() {
        let block = signature_block(b"Signature-Version: 1.0\r\n", "apkpack");
        let (tag, content, rest) = read_tlv(&block);
        assert_eq!(tag, DER_TAG_SEQUENCE);
        assert!(rest.is_empty());

        let (tag, oid, rest) = read_tlv(content);
        assert_eq!((tag, oid), (DER_TAG_OID, OID_SIGNED_DATA));
        let (tag, explicit, _) = read_tlv(rest);
        assert_eq!(tag, DER_TAG_CONTEXT_0);

        let (_, signed_data, _) = read_tlv(explicit);
        let (tag, version, rest) = read_tlv(signed_data);
        assert_eq!((tag, version), (DER_TAG_INTEGER, &[1u8][..]));
        let (tag, digest_algorithms, rest) = read_tlv(rest);
        assert_eq!(tag, DER_TAG_SET);
        assert_eq!(digest_algorithms, &algorithm(OID_SHA1)[..]);
        let (_, content_info, rest) = read_tlv(rest);
        assert_eq!(content_info, &tlv(DER_TAG_OID, OID_DATA)[..]);
        let (tag, signer_infos, rest) = read_tlv(rest);
        assert_eq!(tag, DER_TAG_SET);
        assert!(rest.is_empty());

        let (_, signer_info, _) = read_tlv(signer_infos);
        let mut rest = signer_info;
        let mut last = (0, &[][..]);
        while !rest.is_empty() {
            let (tag, content, tail) = read_tlv(rest);
            last = (tag, content);
            rest = tail;
        }
        assert_eq!(last.0, DER_TAG_OCTET_STRING);
        assert_eq!(last.1.len(), SIGNATURE_SIZE);
    }

    #[test]
    fn test_signature_depends_on_signed_bytes() {
        assert_eq!(signature_block(b"a", "x"), signature_block(b"a", "x"));
        assert_ne!(signature_block(b"a", "x"), signature_block(b"b", "x"));
    }
}
