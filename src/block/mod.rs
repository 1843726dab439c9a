//! Parsed block stream files.

pub mod item;
pub mod reader;

use std::collections::BTreeMap;
use std::io::Read;

use flate2::read::GzDecoder;
use thiserror::Error;

use crate::core::Timestamp;
use crate::filename::StreamFilename;
use crate::hash::HashError;

use item::{
    ItemKind, OutputCase, RecordFileItem, SignedTransaction, StateChanges, TraceData,
    TransactionBody, TransactionOutput, TransactionResult,
};

pub use reader::BlockStreamReader;

/// A block stream file that cannot be trusted or decoded. Never retried
/// silently; the file is rejected as a whole.
#[derive(Debug, Error)]
pub enum StreamFileError {
    #[error("{filename}: missing {expected}, found {found}")]
    MissingItem {
        filename: String,
        expected: &'static str,
        found: String,
    },

    #[error("{filename}: unexpected {kind:?} item at position {index}")]
    UnexpectedItem {
        filename: String,
        kind: ItemKind,
        index: usize,
    },

    #[error("{filename}: unsupported hash algorithm {algorithm}")]
    UnsupportedDigest { filename: String, algorithm: String },

    #[error("{filename}: block number {actual} does not match filename")]
    BlockNumberMismatch { filename: String, actual: u64 },

    #[error("{filename}: invalid transaction at position {index}: {source}")]
    InvalidTransaction {
        filename: String,
        index: usize,
        #[source]
        source: bincode::Error,
    },

    #[error("{filename}: transaction at position {index} precedes the one before it")]
    OutOfOrderTimestamp { filename: String, index: usize },

    #[error("truncated item frame at position {index}")]
    Truncated { index: usize },

    #[error("item at position {index} is {len} bytes, over the frame limit")]
    ItemTooLarge { index: usize, len: usize },

    #[error("undecodable item at position {index}: {source}")]
    Codec {
        index: usize,
        #[source]
        source: bincode::Error,
    },

    #[error("failed to decompress {filename}: {source}")]
    Decompress {
        filename: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{filename}: {source}")]
    RootHash {
        filename: String,
        #[source]
        source: HashError,
    },
}

/// Raw bytes of one stream file, as fetched.
#[derive(Clone, Debug)]
pub struct StreamFileData {
    pub filename: StreamFilename,
    pub bytes: Vec<u8>,
}

impl StreamFileData {
    pub fn new(filename: StreamFilename, bytes: Vec<u8>) -> Self {
        Self { filename, bytes }
    }

    /// Uncompressed stream, inflating `.gz` files.
    pub fn decompressed(&self) -> Result<Vec<u8>, StreamFileError> {
        if !self.filename.is_compressed() {
            return Ok(self.bytes.clone());
        }
        let mut out = Vec::with_capacity(self.bytes.len() * 4);
        GzDecoder::new(self.bytes.as_slice())
            .read_to_end(&mut out)
            .map_err(|source| StreamFileError::Decompress {
                filename: self.filename.to_string(),
                source,
            })?;
        Ok(out)
    }
}

/// One transaction as reconstructed from its block items.
#[derive(Clone, Debug)]
pub struct BlockTransaction {
    pub signed_transaction: SignedTransaction,
    pub body: TransactionBody,
    pub result: TransactionResult,
    pub outputs: BTreeMap<OutputCase, TransactionOutput>,
    pub trace_data: Vec<TraceData>,
    pub state_changes: Vec<StateChanges>,
    /// Index of the transaction parsed just before this one.
    pub previous: Option<usize>,
}

impl BlockTransaction {
    pub fn consensus_timestamp(&self) -> Timestamp {
        self.result.consensus_timestamp
    }

    pub fn parent_consensus_timestamp(&self) -> Option<Timestamp> {
        self.result.parent_consensus_timestamp
    }

    pub fn output(&self, case: OutputCase) -> Option<&TransactionOutput> {
        self.outputs.get(&case)
    }
}

/// A fully parsed and hashed block.
#[derive(Clone, Debug)]
pub struct BlockFile {
    pub name: String,
    pub index: u64,
    pub digest_algorithm: &'static str,
    pub hapi_version: item::SemanticVersion,
    pub software_version: item::SemanticVersion,
    pub block_timestamp: Timestamp,
    pub consensus_start: Timestamp,
    pub consensus_end: Timestamp,
    pub round_start: Option<u64>,
    pub round_end: Option<u64>,
    /// Number of items in the stream.
    pub count: usize,
    /// Uncompressed stream size in bytes.
    pub size: usize,
    /// Recomputed root hash, lower-case hex.
    pub hash: String,
    /// Previous block's root hash as declared by this block, lower-case hex;
    /// empty for genesis.
    pub previous_hash: String,
    pub transactions: Vec<BlockTransaction>,
    pub record_file_item: Option<RecordFileItem>,
}

impl BlockFile {
    /// Resolves the parent of transaction `index` by walking back through
    /// earlier transactions until one carries the claimed parent timestamp.
    pub fn parent_of(&self, index: usize) -> Option<&BlockTransaction> {
        let tx = self.transactions.get(index)?;
        let parent_ts = tx.parent_consensus_timestamp()?;
        let mut cursor = tx.previous;
        while let Some(i) = cursor {
            let candidate = self.transactions.get(i)?;
            if candidate.consensus_timestamp() == parent_ts {
                return Some(candidate);
            }
            cursor = candidate.previous;
        }
        None
    }

    pub fn is_record_file(&self) -> bool {
        self.record_file_item.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    #[test]
    fn gz_files_are_inflated() {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"block bytes").unwrap();
        let data = StreamFileData::new(StreamFilename::for_block(1).unwrap(), enc.finish().unwrap());
        assert_eq!(data.decompressed().unwrap(), b"block bytes");
    }

    #[test]
    fn plain_files_pass_through() {
        let name = StreamFilename::for_block(1).unwrap().data_filename(false);
        let data = StreamFileData::new(name, b"raw".to_vec());
        assert_eq!(data.decompressed().unwrap(), b"raw");
    }

    #[test]
    fn corrupt_gzip_is_reported() {
        let data = StreamFileData::new(StreamFilename::for_block(1).unwrap(), b"not gzip".to_vec());
        assert!(matches!(data.decompressed(), Err(StreamFileError::Decompress { .. })));
    }
}
