//! su3 container encoding.
//!
//! Layout (all integers big endian):
//!
//! ```text
//!  0..6    magic "I2Psu3"
//!  6       unused
//!  7       file format version (0)
//!  8..10   signature type
//! 10..12   signature length
//! 12       unused
//! 13       version string length (16)
//! 14       unused
//! 15       signer id length
//! 16..24   content length
//! 24       unused
//! 25       file type
//! 26       unused
//! 27       content type (3 = reseed)
//! 28..40   unused
//! 40..56   version: unix seconds as ASCII, NUL padded
//! 56..     signer id, content, signature
//! ```
//!
//! The content is a record list: a `u16` count followed by
//! `u16 key_len | key | u32 payload_len | payload` per record.  The signature
//! covers every byte before it.

use anyhow::{bail, ensure, Context, Result};
use bytes::Bytes;

use super::error::EncodingError;
use crate::netdb::DescriptorRecord;

pub const MAGIC: &[u8; 6] = b"I2Psu3";
pub const FILE_FORMAT_VERSION: u8 = 0;
pub const HEADER_LEN: usize = 40;
pub const VERSION_LEN: usize = 16;
pub const FILE_TYPE_RECORD_LIST: u8 = 0x10;
pub const CONTENT_TYPE_RESEED: u8 = 3;

pub const MAX_RECORD_LEN: usize = 64 * 1024;
pub const MAX_RECORDS: usize = u16::MAX as usize;
pub const MAX_KEY_LEN: usize = u16::MAX as usize;
pub const MAX_SIGNER_ID_LEN: usize = u8::MAX as usize;

/// Offset of the signature type field, which the signer checks.
pub(crate) const SIG_TYPE_OFFSET: usize = 8;
pub(crate) const SIG_LEN_OFFSET: usize = 10;

/// su3 signature type codes this service can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureType {
    /// EdDSA over Ed25519 with a SHA-512 prehash (RFC 8032 Ed25519ph).
    Ed25519ph,
}

impl SignatureType {
    pub const fn code(self) -> u16 {
        match self {
            Self::Ed25519ph => 7,
        }
    }

    pub const fn signature_len(self) -> usize {
        match self {
            Self::Ed25519ph => 64,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            7 => Some(Self::Ed25519ph),
            _ => None,
        }
    }
}

/// Fixed header fields of an su3 file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Su3Header {
    pub signature_type: SignatureType,
    pub signature_len: usize,
    pub file_type: u8,
    pub content_type: u8,
    pub signed_at: u64,
    pub signer_id: String,
    pub content_len: usize,
}

/// Encode `records` into an unsigned su3 body.
///
/// The returned buffer already has capacity for the trailing signature.
/// Identical inputs always produce identical bytes.
pub fn encode(
    signer_id: &str,
    signature_type: SignatureType,
    signed_at: u64,
    records: &[&DescriptorRecord],
) -> Result<Vec<u8>, EncodingError> {
    let signer = signer_id.as_bytes();
    if signer.is_empty() || signer.len() > MAX_SIGNER_ID_LEN {
        return Err(EncodingError::InvalidSignerId {
            len: signer.len(),
            max: MAX_SIGNER_ID_LEN,
        });
    }
    if records.len() > MAX_RECORDS {
        return Err(EncodingError::TooManyRecords {
            count: records.len(),
            max: MAX_RECORDS,
        });
    }

    let mut content_len = 2usize;
    for record in records {
        if record.key.len() > MAX_KEY_LEN {
            return Err(EncodingError::KeyTooLong {
                len: record.key.len(),
                max: MAX_KEY_LEN,
            });
        }
        if record.payload.len() > MAX_RECORD_LEN {
            return Err(EncodingError::RecordTooLarge {
                key: record.key.clone(),
                len: record.payload.len(),
                max: MAX_RECORD_LEN,
            });
        }
        content_len += 2 + record.key.len() + 4 + record.payload.len();
    }

    let total = HEADER_LEN + VERSION_LEN + signer.len() + content_len;
    let mut out = Vec::with_capacity(total + signature_type.signature_len());

    // Fixed header.
    out.extend_from_slice(MAGIC);
    out.push(0);
    out.push(FILE_FORMAT_VERSION);
    out.extend_from_slice(&signature_type.code().to_be_bytes());
    out.extend_from_slice(&(signature_type.signature_len() as u16).to_be_bytes());
    out.push(0);
    out.push(VERSION_LEN as u8);
    out.push(0);
    out.push(signer.len() as u8);
    out.extend_from_slice(&(content_len as u64).to_be_bytes());
    out.push(0);
    out.push(FILE_TYPE_RECORD_LIST);
    out.push(0);
    out.push(CONTENT_TYPE_RESEED);
    out.extend_from_slice(&[0u8; 12]);
    debug_assert_eq!(out.len(), HEADER_LEN);

    out.extend_from_slice(&version_field(signed_at));
    out.extend_from_slice(signer);

    // Content.
    out.extend_from_slice(&(records.len() as u16).to_be_bytes());
    for record in records {
        out.extend_from_slice(&(record.key.len() as u16).to_be_bytes());
        out.extend_from_slice(record.key.as_bytes());
        out.extend_from_slice(&(record.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&record.payload);
    }

    debug_assert_eq!(out.len(), total);
    Ok(out)
}

fn version_field(signed_at: u64) -> [u8; VERSION_LEN] {
    let mut field = [0u8; VERSION_LEN];
    let digits = signed_at.to_string();
    // u64::MAX has 20 digits; keep the most significant ones if it ever
    // overflows the field.
    let n = digits.len().min(VERSION_LEN);
    field[..n].copy_from_slice(&digits.as_bytes()[..n]);
    field
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// A parsed su3 file.  Records are copied out; `signed` and `signature`
/// borrow from the input.
#[derive(Debug, Clone)]
pub struct Su3File<'a> {
    pub header: Su3Header,
    pub records: Vec<DescriptorRecord>,
    /// Bytes covered by the signature.
    pub signed: &'a [u8],
    pub signature: &'a [u8],
}

impl<'a> Su3File<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        ensure!(bytes.len() >= HEADER_LEN, "su3 file shorter than its header");
        ensure!(&bytes[..6] == MAGIC, "bad su3 magic");
        ensure!(
            bytes[7] == FILE_FORMAT_VERSION,
            "unknown su3 format version {}",
            bytes[7]
        );

        let sig_code = u16::from_be_bytes([bytes[SIG_TYPE_OFFSET], bytes[SIG_TYPE_OFFSET + 1]]);
        let signature_type = SignatureType::from_code(sig_code)
            .with_context(|| format!("unsupported signature type {sig_code}"))?;
        let signature_len =
            u16::from_be_bytes([bytes[SIG_LEN_OFFSET], bytes[SIG_LEN_OFFSET + 1]]) as usize;
        let version_len = bytes[13] as usize;
        let signer_len = bytes[15] as usize;
        let content_len = u64::from_be_bytes(bytes[16..24].try_into()?);
        let content_len = usize::try_from(content_len).context("content length overflow")?;
        let file_type = bytes[25];
        let content_type = bytes[27];

        let version_start = HEADER_LEN;
        let signer_start = version_start + version_len;
        let content_start = signer_start + signer_len;
        let signature_start = content_start
            .checked_add(content_len)
            .context("content length overflow")?;
        ensure!(
            bytes.len() == signature_start + signature_len,
            "su3 length mismatch: have {} bytes, header implies {}",
            bytes.len(),
            signature_start + signature_len
        );

        let signed_at = parse_version(&bytes[version_start..signer_start])?;
        let signer_id = std::str::from_utf8(&bytes[signer_start..content_start])
            .context("signer id is not UTF-8")?
            .to_string();

        ensure!(
            file_type == FILE_TYPE_RECORD_LIST,
            "unsupported su3 file type {file_type}"
        );
        let records = parse_records(&bytes[content_start..signature_start])?;

        Ok(Self {
            header: Su3Header {
                signature_type,
                signature_len,
                file_type,
                content_type,
                signed_at,
                signer_id,
                content_len,
            },
            records,
            signed: &bytes[..signature_start],
            signature: &bytes[signature_start..],
        })
    }
}

fn parse_version(field: &[u8]) -> Result<u64> {
    let digits: Vec<u8> = field.iter().copied().take_while(|&b| b != 0).collect();
    let text = std::str::from_utf8(&digits).context("version is not ASCII")?;
    text.parse()
        .with_context(|| format!("version {text:?} is not a timestamp"))
}

fn parse_records(mut content: &[u8]) -> Result<Vec<DescriptorRecord>> {
    let count = take_u16(&mut content)? as usize;
    let mut records = Vec::with_capacity(count);
    for i in 0..count {
        let key_len = take_u16(&mut content)? as usize;
        let key = take(&mut content, key_len).with_context(|| format!("record {i} key"))?;
        let key = std::str::from_utf8(key)
            .with_context(|| format!("record {i} key is not UTF-8"))?
            .to_string();
        let payload_len = take_u32(&mut content)? as usize;
        let payload = take(&mut content, payload_len).with_context(|| format!("record {key}"))?;
        records.push(DescriptorRecord::new(key, Bytes::copy_from_slice(payload)));
    }
    if !content.is_empty() {
        bail!("{} trailing bytes after record list", content.len());
    }
    Ok(records)
}

fn take<'a>(buf: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
    ensure!(buf.len() >= n, "truncated: need {n} bytes, have {}", buf.len());
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

fn take_u16(buf: &mut &[u8]) -> Result<u16> {
    let b = take(buf, 2)?;
    Ok(u16::from_be_bytes([b[0], b[1]]))
}

fn take_u32(buf: &mut &[u8]) -> Result<u32> {
    let b = take(buf, 4)?;
    Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}
