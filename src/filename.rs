#![forbid(unsafe_code)]

//! Block stream file naming.
//!
//! Data files are named after the block number, zero padded to 38 digits:
//! `000…0042.blk` or `000…0042.blk.gz`. The matching signature file shares
//! the base name with a `.blk_sig` suffix.

use std::fmt;

use thiserror::Error;

pub const BLOCK_NUMBER_WIDTH: usize = 38;
pub const DATA_SUFFIX: &str = ".blk";
pub const COMPRESSED_SUFFIX: &str = ".gz";
pub const SIGNATURE_SUFFIX: &str = ".blk_sig";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FilenameError {
    #[error("block number must not be negative: {0}")]
    NegativeBlockNumber(i64),

    #[error("not a block stream filename: {0}")]
    Unrecognized(String),
}

/// What a stream file carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FileKind {
    Data { compressed: bool },
    Signature,
}

/// A parsed block stream filename.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StreamFilename {
    block_number: u64,
    kind: FileKind,
}

impl StreamFilename {
    /// Compressed data file for `block_number`.
    pub fn for_block(block_number: i64) -> Result<Self, FilenameError> {
        if block_number < 0 {
            return Err(FilenameError::NegativeBlockNumber(block_number));
        }
        Ok(Self {
            block_number: block_number as u64,
            kind: FileKind::Data { compressed: true },
        })
    }

    /// Compressed data file for a known non-negative block number.
    pub fn from_number(block_number: u64) -> Self {
        Self { block_number, kind: FileKind::Data { compressed: true } }
    }

    pub fn parse(filename: &str) -> Result<Self, FilenameError> {
        let unrecognized = || FilenameError::Unrecognized(filename.to_string());

        let (base, kind) = if let Some(base) = filename.strip_suffix(SIGNATURE_SUFFIX) {
            (base, FileKind::Signature)
        } else if let Some(base) = filename
            .strip_suffix(COMPRESSED_SUFFIX)
            .and_then(|f| f.strip_suffix(DATA_SUFFIX))
        {
            (base, FileKind::Data { compressed: true })
        } else if let Some(base) = filename.strip_suffix(DATA_SUFFIX) {
            (base, FileKind::Data { compressed: false })
        } else {
            return Err(unrecognized());
        };

        if base.len() != BLOCK_NUMBER_WIDTH || !base.bytes().all(|b| b.is_ascii_digit()) {
            return Err(unrecognized());
        }
        let block_number = base.parse::<u64>().map_err(|_| unrecognized())?;

        Ok(Self { block_number, kind })
    }

    pub fn block_number(&self) -> u64 {
        self.block_number
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self.kind, FileKind::Data { compressed: true })
    }

    pub fn signature_filename(&self) -> Self {
        Self { block_number: self.block_number, kind: FileKind::Signature }
    }

    pub fn data_filename(&self, compressed: bool) -> Self {
        Self { block_number: self.block_number, kind: FileKind::Data { compressed } }
    }
}

impl fmt::Display for StreamFilename {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:0width$}", self.block_number, width = BLOCK_NUMBER_WIDTH)?;
        match self.kind {
            FileKind::Data { compressed: true } => write!(f, "{DATA_SUFFIX}{COMPRESSED_SUFFIX}"),
            FileKind::Data { compressed: false } => f.write_str(DATA_SUFFIX),
            FileKind::Signature => f.write_str(SIGNATURE_SUFFIX),
        }
    }
}

/// Compressed data filename for a block number. Negative numbers are rejected.
pub fn block_stream_filename(block_number: i64) -> Result<String, FilenameError> {
    StreamFilename::for_block(block_number).map(|f| f.to_string())
}
