#![forbid(unsafe_code)]

//! Block root hash.
//!
//! ```text
//!                          root
//!              ┌────────────┴────────────┐
//!        H(timestamp)               depth1 right
//!                           ┌────────────┴────────────┐
//!                      depth2 left              depth2 right
//!        (8 leaves: prev block, prev blocks   (8 reserved empty
//!         tree, start state, consensus          leaves)
//!         headers, inputs, outputs, state
//!         changes, trace data)
//! ```
//!
//! Items are routed to category trees as they are read, so a block never
//! has to be buffered to compute its hash.

use std::sync::OnceLock;

use tracing::trace;

use crate::block::item::{BlockItem, EncodedBlockItem};
use crate::core::{empty_hash, sha384, Hash48};

use super::tree::{combine, TreeHasher};
use super::HashError;

/// Number of levels below the depth-2 nodes.
const SUBTREE_DEPTH: usize = 3;

/// Category tree an item's hash lands in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashCategory {
    ConsensusHeaders,
    Inputs,
    Outputs,
    StateChanges,
    TraceData,
}

impl HashCategory {
    /// Routing table. Items that return `None` contribute scalar fields or
    /// nothing at all.
    pub fn of(item: &BlockItem) -> Option<Self> {
        match item {
            BlockItem::RoundHeader(_) | BlockItem::EventHeader(_) => Some(Self::ConsensusHeaders),
            BlockItem::SignedTransaction(_) => Some(Self::Inputs),
            BlockItem::TransactionResult(_) | BlockItem::TransactionOutput(_) => Some(Self::Outputs),
            BlockItem::StateChanges(_) => Some(Self::StateChanges),
            BlockItem::TraceData(_) => Some(Self::TraceData),
            BlockItem::BlockHeader(_)
            | BlockItem::BlockFooter(_)
            | BlockItem::BlockProof(_)
            | BlockItem::RecordFile(_) => None,
        }
    }
}

/// Eight empty leaves folded to a single node; reserved right half of the
/// depth-1 right subtree.
pub fn reserved_subtree_hash() -> &'static Hash48 {
    static RESERVED: OnceLock<Hash48> = OnceLock::new();
    RESERVED.get_or_init(|| {
        let mut node = *empty_hash();
        for _ in 0..SUBTREE_DEPTH {
            node = combine(&node, &node);
        }
        node
    })
}

#[derive(Debug, Default)]
pub struct BlockRootHashDigest {
    consensus_headers: TreeHasher,
    inputs: TreeHasher,
    outputs: TreeHasher,
    state_changes: TreeHasher,
    trace_data: TreeHasher,

    block_timestamp: Option<[u8; 12]>,
    previous_hash: Option<Hash48>,
    previous_block_hashes_tree: Option<Hash48>,
    start_of_block_state_hash: Option<Hash48>,

    finished: bool,
}

impl BlockRootHashDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_item(&mut self, encoded: &EncodedBlockItem) -> Result<(), HashError> {
        if self.finished {
            return Err(HashError::AlreadyDigested);
        }

        if let Some(category) = HashCategory::of(&encoded.item) {
            let leaf = sha384(&encoded.bytes);
            self.hasher_mut(category).add_leaf(leaf)?;
            return Ok(());
        }

        match &encoded.item {
            BlockItem::BlockHeader(header) => {
                self.block_timestamp = Some(header.block_timestamp.to_hash_bytes());
            }
            BlockItem::BlockFooter(footer) => {
                self.set_previous_hash(&footer.previous_block_root_hash)?;
                self.previous_block_hashes_tree = Some(checked_leaf(
                    "previous blocks tree hash",
                    &footer.root_hash_of_all_block_hashes_tree,
                )?);
                self.set_start_of_block_state_hash(&footer.start_of_block_state_root_hash)?;
            }
            BlockItem::BlockProof(proof) => {
                self.set_previous_hash(&proof.previous_block_root_hash)?;
                self.set_start_of_block_state_hash(&proof.start_of_block_state_root_hash)?;
            }
            _ => trace!(kind = ?encoded.kind(), "item not part of the block root hash"),
        }
        Ok(())
    }

    pub fn set_previous_hash(&mut self, hash: &[u8]) -> Result<(), HashError> {
        self.previous_hash = Some(checked_leaf("previous block hash", hash)?);
        Ok(())
    }

    pub fn set_start_of_block_state_hash(&mut self, hash: &[u8]) -> Result<(), HashError> {
        self.start_of_block_state_hash = Some(checked_leaf("start of block state hash", hash)?);
        Ok(())
    }

    /// Root hash as lower-case hex. May be taken once, after the header and
    /// the proof (or footer) have been added.
    pub fn digest(&mut self) -> Result<String, HashError> {
        if self.finished {
            return Err(HashError::AlreadyDigested);
        }
        let timestamp = self.block_timestamp.ok_or(HashError::MissingField("block timestamp"))?;
        let previous = self.previous_hash.ok_or(HashError::MissingField("previous block hash"))?;
        let start_state = self
            .start_of_block_state_hash
            .ok_or(HashError::MissingField("start of block state hash"))?;
        let previous_tree = self.previous_block_hashes_tree.unwrap_or(*empty_hash());
        self.finished = true;

        let mut depth2_left = TreeHasher::new();
        for leaf in [
            previous,
            previous_tree,
            start_state,
            self.consensus_headers.digest(),
            self.inputs.digest(),
            self.outputs.digest(),
            self.state_changes.digest(),
            self.trace_data.digest(),
        ] {
            depth2_left.add_leaf(leaf)?;
        }

        let depth1_right = combine(&depth2_left.digest(), reserved_subtree_hash());
        let depth1_left = sha384(&timestamp);
        Ok(hex::encode(combine(&depth1_left, &depth1_right)))
    }

    fn hasher_mut(&mut self, category: HashCategory) -> &mut TreeHasher {
        match category {
            HashCategory::ConsensusHeaders => &mut self.consensus_headers,
            HashCategory::Inputs => &mut self.inputs,
            HashCategory::Outputs => &mut self.outputs,
            HashCategory::StateChanges => &mut self.state_changes,
            HashCategory::TraceData => &mut self.trace_data,
        }
    }
}

/// Empty means "no hash" (genesis) and maps to the empty-hash leaf.
fn checked_leaf(field: &'static str, bytes: &[u8]) -> Result<Hash48, HashError> {
    if bytes.is_empty() {
        return Ok(*empty_hash());
    }
    crate::core::to_hash48(bytes).ok_or(HashError::InvalidHashLength { field, len: bytes.len() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::item::{BlockHeader, BlockProof, HashAlgorithm, RoundHeader, SemanticVersion};
    use crate::core::Timestamp;

    fn header(ts: Timestamp) -> EncodedBlockItem {
        EncodedBlockItem::new(BlockItem::BlockHeader(BlockHeader {
            hapi_version: SemanticVersion::default(),
            software_version: SemanticVersion::default(),
            number: 0,
            block_timestamp: ts,
            hash_algorithm: HashAlgorithm::Sha2_384,
        }))
        .unwrap()
    }

    fn proof(previous: Vec<u8>) -> EncodedBlockItem {
        EncodedBlockItem::new(BlockItem::BlockProof(BlockProof {
            previous_block_root_hash: previous,
            start_of_block_state_root_hash: vec![7u8; 48],
            ..Default::default()
        }))
        .unwrap()
    }

    #[test]
    fn reserved_subtree_matches_eight_empty_leaves() {
        let mut h = TreeHasher::new();
        for _ in 0..8 {
            h.add_leaf(*empty_hash()).unwrap();
        }
        assert_eq!(h.digest(), *reserved_subtree_hash());
    }

    #[test]
    fn empty_block_root_matches_manual_composition() {
        let ts = Timestamp::new(1_700_000_000, 5);
        let mut digest = BlockRootHashDigest::new();
        digest.add_item(&header(ts)).unwrap();
        digest.add_item(&proof(vec![9u8; 48])).unwrap();
        let root = digest.digest().unwrap();

        let e = *empty_hash();
        let mut left = TreeHasher::new();
        for leaf in [[9u8; 48], e, [7u8; 48], e, e, e, e, e] {
            left.add_leaf(leaf).unwrap();
        }
        let right = combine(&left.digest(), reserved_subtree_hash());
        let expected = combine(&sha384(&ts.to_hash_bytes()), &right);
        assert_eq!(root, hex::encode(expected));
    }

    #[test]
    fn category_items_change_the_root() {
        let ts = Timestamp::new(1, 0);
        let mut plain = BlockRootHashDigest::new();
        plain.add_item(&header(ts)).unwrap();
        plain.add_item(&proof(vec![])).unwrap();

        let mut with_round = BlockRootHashDigest::new();
        with_round.add_item(&header(ts)).unwrap();
        with_round
            .add_item(&EncodedBlockItem::new(BlockItem::RoundHeader(RoundHeader { round_number: 1 })).unwrap())
            .unwrap();
        with_round.add_item(&proof(vec![])).unwrap();

        assert_ne!(plain.digest().unwrap(), with_round.digest().unwrap());
    }

    #[test]
    fn digest_requires_proof_fields_and_runs_once() {
        let mut digest = BlockRootHashDigest::new();
        digest.add_item(&header(Timestamp::new(1, 0))).unwrap();
        assert_eq!(digest.digest(), Err(HashError::MissingField("previous block hash")));

        digest.add_item(&proof(vec![])).unwrap();
        assert!(digest.digest().is_ok());
        assert_eq!(digest.digest(), Err(HashError::AlreadyDigested));
        assert_eq!(digest.add_item(&proof(vec![])), Err(HashError::AlreadyDigested));
    }

    #[test]
    fn wrong_length_hash_is_rejected() {
        let mut digest = BlockRootHashDigest::new();
        let err = digest.add_item(&proof(vec![1, 2, 3])).unwrap_err();
        assert_eq!(err, HashError::InvalidHashLength { field: "previous block hash", len: 3 });
    }
}
