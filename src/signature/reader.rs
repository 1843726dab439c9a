#![forbid(unsafe_code)]

//! Signature file codec.
//!
//! ```text
//! v2     : 0x04 | hash(48) | 0x03 | len:i32 | signature
//! v5, v6 : version:u8 | 1:i32 | hash object | signature object
//!                              | hash object | signature object
//! hash object      : class id:i64 | 1:i32 | digest type:i32 | len:i32 | hash
//! signature object : class id:i64 | 1:i32 | sig type:i32 | len:i32
//!                    | checksum (101 - len):i32 | signature
//! ```
//!
//! All integers are big-endian. The second hash/signature pair covers the
//! file metadata.

use thiserror::Error;

use crate::core::{Hash48, HASH_LEN};

use super::SignatureType;

pub const VERSION_2: u8 = 2;
pub const VERSION_5: u8 = 5;
pub const VERSION_6: u8 = 6;

const V2_HASH_MARKER: u8 = 4;
const V2_SIGNATURE_MARKER: u8 = 3;

const OBJECT_STREAM_SIGNATURE_VERSION: i32 = 1;
const HASH_CLASS_ID: i64 = 0xf422_da83_a251_741e_u64 as i64;
const SIGNATURE_CLASS_ID: i64 = 0x13dc_4b39_9b24_5c69;
const OBJECT_CLASS_VERSION: i32 = 1;
const SHA384_DIGEST_TYPE: i32 = 0x58ff_811b;
const CHECKSUM_BASE: i32 = 101;

/// Longest signature accepted, enough for 8192-bit RSA.
pub const MAX_SIGNATURE_LENGTH: usize = 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureFileError {
    #[error("signature file is empty")]
    Empty,

    #[error("unknown signature file version {0}")]
    UnknownVersion(u8),

    #[error("signature file truncated at offset {offset}")]
    Truncated { offset: usize },

    #[error("expected {what} at offset {offset}, found {found:#x}")]
    UnexpectedValue {
        what: &'static str,
        offset: usize,
        found: i64,
    },

    #[error("unsupported digest type {0:#x}")]
    UnsupportedDigest(i32),

    #[error("{what} length {len} out of range")]
    InvalidLength { what: &'static str, len: i64 },

    #[error("signature checksum {found} does not match length {len}")]
    ChecksumMismatch { len: usize, found: i32 },

    #[error("{0} trailing bytes after the last object")]
    TrailingBytes(usize),
}

/// Decoded content of one node's signature file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignatureFile {
    pub version: u8,
    pub file_hash: Hash48,
    pub file_hash_signature: Vec<u8>,
    pub signature_type: SignatureType,
    pub metadata_hash: Option<Hash48>,
    pub metadata_hash_signature: Option<Vec<u8>>,
}

impl SignatureFile {
    /// Whether the data file this signature covers is gzip-compressed.
    pub fn compressed_data(&self) -> bool {
        self.version >= VERSION_6
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, SignatureFileError> {
        let mut r = ByteReader::new(data);
        let first = *data.first().ok_or(SignatureFileError::Empty)?;

        let file = match first {
            V2_HASH_MARKER => read_v2(&mut r)?,
            VERSION_5 | VERSION_6 => read_v5(&mut r)?,
            other => return Err(SignatureFileError::UnknownVersion(other)),
        };

        if r.remaining() > 0 {
            return Err(SignatureFileError::TrailingBytes(r.remaining()));
        }
        Ok(file)
    }

    /// Encodes the file in its declared version. Metadata fields are written
    /// only by v5 and v6, as empty objects when absent.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        if self.version == VERSION_2 {
            out.push(V2_HASH_MARKER);
            out.extend_from_slice(&self.file_hash);
            out.push(V2_SIGNATURE_MARKER);
            out.extend_from_slice(&(self.file_hash_signature.len() as i32).to_be_bytes());
            out.extend_from_slice(&self.file_hash_signature);
            return out;
        }

        out.push(self.version);
        out.extend_from_slice(&OBJECT_STREAM_SIGNATURE_VERSION.to_be_bytes());
        write_hash_object(&mut out, Some(&self.file_hash));
        write_signature_object(&mut out, self.signature_type, &self.file_hash_signature);
        write_hash_object(&mut out, self.metadata_hash.as_ref());
        write_signature_object(
            &mut out,
            self.signature_type,
            self.metadata_hash_signature.as_deref().unwrap_or_default(),
        );
        out
    }
}

fn read_v2(r: &mut ByteReader<'_>) -> Result<SignatureFile, SignatureFileError> {
    r.expect_u8("hash marker", V2_HASH_MARKER)?;
    let file_hash = r.read_hash()?;
    r.expect_u8("signature marker", V2_SIGNATURE_MARKER)?;
    let len = r.read_length("signature", MAX_SIGNATURE_LENGTH)?;
    let file_hash_signature = r.read_bytes(len)?.to_vec();

    Ok(SignatureFile {
        version: VERSION_2,
        file_hash,
        file_hash_signature,
        signature_type: SignatureType::Sha384WithRsa,
        metadata_hash: None,
        metadata_hash_signature: None,
    })
}

fn read_v5(r: &mut ByteReader<'_>) -> Result<SignatureFile, SignatureFileError> {
    let version = r.read_u8()?;
    let offset = r.offset();
    let stream_version = r.read_i32()?;
    if stream_version != OBJECT_STREAM_SIGNATURE_VERSION {
        return Err(SignatureFileError::UnexpectedValue {
            what: "object stream signature version",
            offset,
            found: i64::from(stream_version),
        });
    }

    let file_hash = read_hash_object(r)?.ok_or(SignatureFileError::InvalidLength { what: "file hash", len: 0 })?;
    let (signature_type, file_hash_signature) = read_signature_object(r)?;
    let metadata_hash = read_hash_object(r)?;
    let (_, metadata_signature) = read_signature_object(r)?;

    Ok(SignatureFile {
        version,
        file_hash,
        file_hash_signature,
        signature_type,
        metadata_hash,
        metadata_hash_signature: (!metadata_signature.is_empty()).then_some(metadata_signature),
    })
}

/// An empty hash object (length 0) decodes to `None`.
fn read_hash_object(r: &mut ByteReader<'_>) -> Result<Option<Hash48>, SignatureFileError> {
    r.expect_i64("hash class id", HASH_CLASS_ID)?;
    r.expect_i32("hash class version", OBJECT_CLASS_VERSION)?;
    let digest_type = r.read_i32()?;
    if digest_type != SHA384_DIGEST_TYPE {
        return Err(SignatureFileError::UnsupportedDigest(digest_type));
    }
    match r.read_length("hash", HASH_LEN)? {
        0 => Ok(None),
        HASH_LEN => Ok(Some(r.read_hash()?)),
        len => Err(SignatureFileError::InvalidLength { what: "hash", len: len as i64 }),
    }
}

fn read_signature_object(r: &mut ByteReader<'_>) -> Result<(SignatureType, Vec<u8>), SignatureFileError> {
    r.expect_i64("signature class id", SIGNATURE_CLASS_ID)?;
    r.expect_i32("signature class version", OBJECT_CLASS_VERSION)?;
    let signature_type = SignatureType::from_code(r.read_i32()?);
    let len = r.read_length("signature", MAX_SIGNATURE_LENGTH)?;
    let checksum = r.read_i32()?;
    if checksum != CHECKSUM_BASE - len as i32 {
        return Err(SignatureFileError::ChecksumMismatch { len, found: checksum });
    }
    Ok((signature_type, r.read_bytes(len)?.to_vec()))
}

fn write_hash_object(out: &mut Vec<u8>, hash: Option<&Hash48>) {
    out.extend_from_slice(&HASH_CLASS_ID.to_be_bytes());
    out.extend_from_slice(&OBJECT_CLASS_VERSION.to_be_bytes());
    out.extend_from_slice(&SHA384_DIGEST_TYPE.to_be_bytes());
    match hash {
        Some(h) => {
            out.extend_from_slice(&(HASH_LEN as i32).to_be_bytes());
            out.extend_from_slice(h);
        }
        None => out.extend_from_slice(&0i32.to_be_bytes()),
    }
}

fn write_signature_object(out: &mut Vec<u8>, signature_type: SignatureType, signature: &[u8]) {
    let len = signature.len() as i32;
    out.extend_from_slice(&SIGNATURE_CLASS_ID.to_be_bytes());
    out.extend_from_slice(&OBJECT_CLASS_VERSION.to_be_bytes());
    out.extend_from_slice(&signature_type.code().to_be_bytes());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&(CHECKSUM_BASE - len).to_be_bytes());
    out.extend_from_slice(signature);
}

/* ===== Bounded reader ===== */

struct ByteReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn offset(&self) -> usize {
        self.offset
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], SignatureFileError> {
        if self.remaining() < len {
            return Err(SignatureFileError::Truncated { offset: self.offset });
        }
        let out = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(out)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], SignatureFileError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    fn read_u8(&mut self) -> Result<u8, SignatureFileError> {
        Ok(self.read_array::<1>()?[0])
    }

    fn read_i32(&mut self) -> Result<i32, SignatureFileError> {
        Ok(i32::from_be_bytes(self.read_array()?))
    }

    fn read_i64(&mut self) -> Result<i64, SignatureFileError> {
        Ok(i64::from_be_bytes(self.read_array()?))
    }

    fn read_hash(&mut self) -> Result<Hash48, SignatureFileError> {
        self.read_array()
    }

    fn read_length(&mut self, what: &'static str, max: usize) -> Result<usize, SignatureFileError> {
        let len = self.read_i32()?;
        if len < 0 || len as usize > max {
            return Err(SignatureFileError::InvalidLength { what, len: i64::from(len) });
        }
        Ok(len as usize)
    }

    fn expect_u8(&mut self, what: &'static str, expected: u8) -> Result<(), SignatureFileError> {
        let offset = self.offset;
        let found = self.read_u8()?;
        if found != expected {
            return Err(SignatureFileError::UnexpectedValue { what, offset, found: i64::from(found) });
        }
        Ok(())
    }

    fn expect_i32(&mut self, what: &'static str, expected: i32) -> Result<(), SignatureFileError> {
        let offset = self.offset;
        let found = self.read_i32()?;
        if found != expected {
            return Err(SignatureFileError::UnexpectedValue { what, offset, found: i64::from(found) });
        }
        Ok(())
    }

    fn expect_i64(&mut self, what: &'static str, expected: i64) -> Result<(), SignatureFileError> {
        let offset = self.offset;
        let found = self.read_i64()?;
        if found != expected {
            return Err(SignatureFileError::UnexpectedValue { what, offset, found });
        }
        Ok(())
    }
}
