#![forbid(unsafe_code)]

//! Single-pass block stream parser.
//!
//! Items are pulled from a cursor in stream order. Every consumed item is
//! fed to the block's [`BlockRootHashDigest`] before it is interpreted, so
//! parsing and hashing finish together. All state lives in a per-read
//! context; one reader can serve any number of concurrent files.

use std::collections::{BTreeMap, VecDeque};
use std::iter::Peekable;
use std::vec::IntoIter;

use tracing::{debug, trace};

use crate::core::{sha384, Timestamp};
use crate::hash::BlockRootHashDigest;

use super::item::{
    decode_items, BlockHeader, BlockItem, BlockProof, EncodedBlockItem, HashAlgorithm, ItemKind,
    RecordFileItem, SignedTransaction, TransactionData,
};
use super::{BlockFile, BlockTransaction, StreamFileData, StreamFileError};

pub const DIGEST_ALGORITHM: &str = "SHA-384";

#[derive(Clone, Copy, Debug, Default)]
pub struct BlockStreamReader;

impl BlockStreamReader {
    pub fn new() -> Self {
        Self
    }

    /// Decompresses, decodes and parses one block stream file.
    pub fn read(&self, data: &StreamFileData) -> Result<BlockFile, StreamFileError> {
        let filename = data.filename.to_string();
        let bytes = data.decompressed()?;
        let items = decode_items(&bytes)?;
        self.read_items(&filename, items, bytes.len())
    }

    /// Parses an already decoded item sequence.
    pub fn read_items(
        &self,
        filename: &str,
        items: Vec<EncodedBlockItem>,
        size: usize,
    ) -> Result<BlockFile, StreamFileError> {
        ReaderContext::new(filename, items).read_block(size)
    }
}

/* ===== Cursor ===== */

struct ItemCursor {
    items: Peekable<IntoIter<EncodedBlockItem>>,
    position: usize,
}

impl ItemCursor {
    fn new(items: Vec<EncodedBlockItem>) -> Self {
        Self { items: items.into_iter().peekable(), position: 0 }
    }

    fn peek(&mut self) -> Option<&BlockItem> {
        self.items.peek().map(|e| &e.item)
    }

    fn peek_kind(&mut self) -> Option<ItemKind> {
        self.peek().map(BlockItem::kind)
    }

    fn next(&mut self) -> Option<EncodedBlockItem> {
        let next = self.items.next();
        if next.is_some() {
            self.position += 1;
        }
        next
    }
}

/* ===== Per-file state ===== */

struct ReaderContext<'a> {
    filename: &'a str,
    cursor: ItemCursor,
    digest: BlockRootHashDigest,
    transactions: Vec<BlockTransaction>,
    /// Inner transactions of the last atomic batch, not yet matched to results.
    batch_transactions: VecDeque<Vec<u8>>,
    last_meta_timestamp: Option<Timestamp>,
    round_start: Option<u64>,
    round_end: Option<u64>,
}

impl<'a> ReaderContext<'a> {
    fn new(filename: &'a str, items: Vec<EncodedBlockItem>) -> Self {
        Self {
            filename,
            cursor: ItemCursor::new(items),
            digest: BlockRootHashDigest::new(),
            transactions: Vec::new(),
            batch_transactions: VecDeque::new(),
            last_meta_timestamp: None,
            round_start: None,
            round_end: None,
        }
    }

    fn read_block(mut self, size: usize) -> Result<BlockFile, StreamFileError> {
        let header = match self.advance()? {
            Some(BlockItem::BlockHeader(header)) => header,
            other => return Err(self.missing("block header", other)),
        };
        if header.hash_algorithm != HashAlgorithm::Sha2_384 {
            return Err(StreamFileError::UnsupportedDigest {
                filename: self.filename.to_string(),
                algorithm: format!("{:?}", header.hash_algorithm),
            });
        }

        if self.cursor.peek_kind() == Some(ItemKind::RecordFile) {
            return match self.advance()? {
                Some(BlockItem::RecordFile(record)) => Ok(self.wrapped_record_file(header, record, size)),
                other => Err(self.missing("record file", other)),
            };
        }

        loop {
            match self.cursor.peek_kind() {
                Some(ItemKind::RoundHeader) => self.read_round()?,
                Some(ItemKind::StateChanges) => self.read_system_state_changes()?,
                _ => break,
            }
        }

        if self.cursor.peek_kind() == Some(ItemKind::BlockFooter) {
            self.advance()?;
        }

        let proof = self.read_block_proof()?;
        if let Some(kind) = self.cursor.peek_kind() {
            return Err(self.unexpected(kind));
        }

        let hash = self.digest.digest().map_err(|source| StreamFileError::RootHash {
            filename: self.filename.to_string(),
            source,
        })?;

        let (consensus_start, consensus_end) = match (self.transactions.first(), self.transactions.last()) {
            (Some(first), Some(last)) => (first.consensus_timestamp(), last.consensus_timestamp()),
            _ => {
                let ts = self.last_meta_timestamp.unwrap_or(header.block_timestamp);
                (ts, ts)
            }
        };

        debug!(
            file = self.filename,
            block = header.number,
            transactions = self.transactions.len(),
            items = self.cursor.position,
            %hash,
            "parsed block"
        );

        Ok(BlockFile {
            name: self.filename.to_string(),
            index: header.number,
            digest_algorithm: DIGEST_ALGORITHM,
            hapi_version: header.hapi_version,
            software_version: header.software_version,
            block_timestamp: header.block_timestamp,
            consensus_start,
            consensus_end,
            round_start: self.round_start,
            round_end: self.round_end,
            count: self.cursor.position,
            size,
            hash,
            previous_hash: hex::encode(&proof.previous_block_root_hash),
            transactions: self.transactions,
            record_file_item: None,
        })
    }

    /// A legacy record file carried in a block is returned as is. Its hash is
    /// the SHA-384 of the record file contents.
    fn wrapped_record_file(self, header: BlockHeader, record: RecordFileItem, size: usize) -> BlockFile {
        debug!(file = self.filename, block = header.number, "block wraps a record file");
        BlockFile {
            name: self.filename.to_string(),
            index: header.number,
            digest_algorithm: DIGEST_ALGORITHM,
            hapi_version: record.hapi_version,
            software_version: header.software_version,
            block_timestamp: header.block_timestamp,
            consensus_start: record.creation_time,
            consensus_end: record.creation_time,
            round_start: None,
            round_end: None,
            count: self.cursor.position,
            size,
            hash: hex::encode(sha384(&record.record_file_contents)),
            previous_hash: hex::encode(&record.previous_file_hash),
            transactions: Vec::new(),
            record_file_item: Some(record),
        }
    }

    fn read_round(&mut self) -> Result<(), StreamFileError> {
        if let Some(BlockItem::RoundHeader(round)) = self.advance()? {
            self.round_start.get_or_insert(round.round_number);
            self.round_end = Some(round.round_number);
        }

        loop {
            match self.cursor.peek_kind() {
                Some(ItemKind::StateChanges) => self.read_system_state_changes()?,
                Some(ItemKind::EventHeader) => {
                    self.advance()?;
                    self.read_event()?;
                }
                _ => return Ok(()),
            }
        }
    }

    fn read_event(&mut self) -> Result<(), StreamFileError> {
        while let Some(tx) = self.read_transaction()? {
            self.transactions.push(tx);
        }
        if !self.batch_transactions.is_empty() {
            debug!(
                file = self.filename,
                remaining = self.batch_transactions.len(),
                "atomic batch inner transactions without results"
            );
            self.batch_transactions.clear();
        }
        Ok(())
    }

    /// State changes that belong to no transaction.
    fn read_system_state_changes(&mut self) -> Result<(), StreamFileError> {
        if let Some(BlockItem::StateChanges(changes)) = self.advance()? {
            self.last_meta_timestamp = Some(changes.consensus_timestamp);
        }
        Ok(())
    }

    fn read_transaction(&mut self) -> Result<Option<BlockTransaction>, StreamFileError> {
        let index = self.cursor.position;
        let signed_bytes = match self.cursor.peek_kind() {
            Some(ItemKind::SignedTransaction) => match self.advance()? {
                Some(BlockItem::SignedTransaction(bytes)) => bytes,
                _ => return Ok(None),
            },
            Some(ItemKind::TransactionResult) => match self.batch_transactions.pop_front() {
                Some(bytes) => bytes,
                None => return Ok(None),
            },
            _ => return Ok(None),
        };

        let filename = self.filename;
        let invalid = |source| StreamFileError::InvalidTransaction {
            filename: filename.to_string(),
            index,
            source,
        };
        let signed_transaction = SignedTransaction::from_bytes(&signed_bytes).map_err(invalid)?;
        let body = signed_transaction.body().map_err(invalid)?;

        let result = match self.advance()? {
            Some(BlockItem::TransactionResult(result)) => result,
            other => return Err(self.missing("transaction result", other)),
        };

        let mut outputs = BTreeMap::new();
        while self.cursor.peek_kind() == Some(ItemKind::TransactionOutput) {
            if let Some(BlockItem::TransactionOutput(output)) = self.advance()? {
                outputs.insert(output.case(), output);
            }
        }

        let mut trace_data = Vec::new();
        while self.cursor.peek_kind() == Some(ItemKind::TraceData) {
            if let Some(BlockItem::TraceData(trace)) = self.advance()? {
                trace_data.push(trace);
            }
        }

        let mut state_changes = Vec::new();
        loop {
            let at = match self.cursor.peek() {
                Some(BlockItem::StateChanges(changes)) => changes.consensus_timestamp,
                _ => break,
            };
            if at != result.consensus_timestamp {
                self.last_meta_timestamp = Some(at);
                break;
            }
            if let Some(BlockItem::StateChanges(changes)) = self.advance()? {
                state_changes.push(changes);
            }
        }

        if let Some(last) = self.transactions.last() {
            if result.consensus_timestamp < last.consensus_timestamp() {
                return Err(StreamFileError::OutOfOrderTimestamp {
                    filename: self.filename.to_string(),
                    index,
                });
            }
        }

        if let TransactionData::AtomicBatch { transactions } = &body.data {
            trace!(file = self.filename, inner = transactions.len(), "atomic batch");
            self.batch_transactions.extend(transactions.iter().cloned());
        }

        Ok(Some(BlockTransaction {
            signed_transaction,
            body,
            result,
            outputs,
            trace_data,
            state_changes,
            previous: self.transactions.len().checked_sub(1),
        }))
    }

    fn read_block_proof(&mut self) -> Result<BlockProof, StreamFileError> {
        match self.cursor.peek_kind() {
            Some(ItemKind::BlockProof) => match self.advance()? {
                Some(BlockItem::BlockProof(proof)) => Ok(proof),
                other => Err(self.missing("block proof", other)),
            },
            Some(kind) => Err(self.unexpected(kind)),
            None => Err(self.missing("block proof", None)),
        }
    }

    /// Consumes the next item and adds it to the root hash.
    fn advance(&mut self) -> Result<Option<BlockItem>, StreamFileError> {
        let Some(encoded) = self.cursor.next() else {
            return Ok(None);
        };
        self.digest.add_item(&encoded).map_err(|source| StreamFileError::RootHash {
            filename: self.filename.to_string(),
            source,
        })?;
        Ok(Some(encoded.item))
    }

    fn missing(&self, expected: &'static str, found: Option<BlockItem>) -> StreamFileError {
        StreamFileError::MissingItem {
            filename: self.filename.to_string(),
            expected,
            found: found
                .map(|item| format!("{:?}", item.kind()))
                .unwrap_or_else(|| "end of stream".to_string()),
        }
    }

    fn unexpected(&self, kind: ItemKind) -> StreamFileError {
        StreamFileError::UnexpectedItem {
            filename: self.filename.to_string(),
            kind,
            index: self.cursor.position,
        }
    }
}
