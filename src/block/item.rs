#![forbid(unsafe_code)]

//! Block stream items and their wire codec.
//!
//! A block stream is a flat sequence of frames: `u32 BE length || item`,
//! where `item` is the bincode encoding of [`BlockItem`]. The exact item
//! bytes are kept next to the decoded value because they are what gets
//! hashed into the block root hash.

use serde::{Deserialize, Serialize};

use crate::core::{AccountId, Timestamp};

use super::StreamFileError;

/// Upper bound on a single frame.
pub const MAX_ITEM_SIZE: usize = 64 * 1024 * 1024;

/* ===== Items ===== */

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockItem {
    BlockHeader(BlockHeader),
    RoundHeader(RoundHeader),
    EventHeader(EventHeader),
    /// Serialized [`SignedTransaction`].
    SignedTransaction(Vec<u8>),
    TransactionResult(TransactionResult),
    TransactionOutput(TransactionOutput),
    TraceData(TraceData),
    StateChanges(StateChanges),
    BlockFooter(BlockFooter),
    BlockProof(BlockProof),
    RecordFile(RecordFileItem),
}

/// Discriminant of [`BlockItem`], used for routing and error messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ItemKind {
    BlockHeader,
    RoundHeader,
    EventHeader,
    SignedTransaction,
    TransactionResult,
    TransactionOutput,
    TraceData,
    StateChanges,
    BlockFooter,
    BlockProof,
    RecordFile,
}

impl BlockItem {
    pub fn kind(&self) -> ItemKind {
        match self {
            BlockItem::BlockHeader(_) => ItemKind::BlockHeader,
            BlockItem::RoundHeader(_) => ItemKind::RoundHeader,
            BlockItem::EventHeader(_) => ItemKind::EventHeader,
            BlockItem::SignedTransaction(_) => ItemKind::SignedTransaction,
            BlockItem::TransactionResult(_) => ItemKind::TransactionResult,
            BlockItem::TransactionOutput(_) => ItemKind::TransactionOutput,
            BlockItem::TraceData(_) => ItemKind::TraceData,
            BlockItem::StateChanges(_) => ItemKind::StateChanges,
            BlockItem::BlockFooter(_) => ItemKind::BlockFooter,
            BlockItem::BlockProof(_) => ItemKind::BlockProof,
            BlockItem::RecordFile(_) => ItemKind::RecordFile,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemanticVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashAlgorithm {
    Sha2_384,
    Unrecognized(i32),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub hapi_version: SemanticVersion,
    pub software_version: SemanticVersion,
    pub number: u64,
    pub block_timestamp: Timestamp,
    pub hash_algorithm: HashAlgorithm,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundHeader {
    pub round_number: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHeader {
    pub creator_node_id: u64,
    pub birth_round: u64,
}

/* ===== Transactions ===== */

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignaturePair {
    pub pub_key_prefix: Vec<u8>,
    pub signature: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    /// Serialized [`TransactionBody`].
    pub body_bytes: Vec<u8>,
    pub sig_map: Vec<SignaturePair>,
}

impl SignedTransaction {
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn body(&self) -> Result<TransactionBody, bincode::Error> {
        bincode::deserialize(&self.body_bytes)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionId {
    pub payer: AccountId,
    pub valid_start: Timestamp,
    pub nonce: i32,
    pub scheduled: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountAmount {
    pub account: AccountId,
    pub amount: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionData {
    CryptoTransfer { transfers: Vec<AccountAmount> },
    ConsensusSubmitMessage { topic: AccountId, message: Vec<u8> },
    ContractCall { contract: AccountId, gas: u64, function_parameters: Vec<u8> },
    ContractCreate { initcode: Vec<u8>, gas: u64 },
    EthereumTransaction { ethereum_data: Vec<u8> },
    UtilPrng { range: i32 },
    ScheduleCreate { scheduled_body: Vec<u8> },
    ScheduleSign { schedule: AccountId },
    /// Inner entries are serialized [`SignedTransaction`]s.
    AtomicBatch { transactions: Vec<Vec<u8>> },
}

impl TransactionData {
    pub fn name(&self) -> &'static str {
        match self {
            TransactionData::CryptoTransfer { .. } => "CRYPTOTRANSFER",
            TransactionData::ConsensusSubmitMessage { .. } => "CONSENSUSSUBMITMESSAGE",
            TransactionData::ContractCall { .. } => "CONTRACTCALL",
            TransactionData::ContractCreate { .. } => "CONTRACTCREATEINSTANCE",
            TransactionData::EthereumTransaction { .. } => "ETHEREUMTRANSACTION",
            TransactionData::UtilPrng { .. } => "UTILPRNG",
            TransactionData::ScheduleCreate { .. } => "SCHEDULECREATE",
            TransactionData::ScheduleSign { .. } => "SCHEDULESIGN",
            TransactionData::AtomicBatch { .. } => "ATOMICBATCH",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionBody {
    pub transaction_id: TransactionId,
    pub node_account_id: AccountId,
    pub transaction_fee: u64,
    pub memo: String,
    pub data: TransactionData,
}

impl TransactionBody {
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseCode {
    Success,
    InvalidTransaction,
    InvalidSignature,
    InsufficientPayerBalance,
    ContractRevertExecuted,
    InnerTransactionFailed,
    Unrecognized(i32),
}

impl ResponseCode {
    pub fn is_success(&self) -> bool {
        matches!(self, ResponseCode::Success)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionResult {
    pub status: ResponseCode,
    pub consensus_timestamp: Timestamp,
    pub parent_consensus_timestamp: Option<Timestamp>,
    pub transaction_fee_charged: u64,
    pub transfer_list: Vec<AccountAmount>,
}

/* ===== Outputs ===== */

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionOutput {
    ContractCall { result: Vec<u8>, gas_used: u64 },
    ContractCreate { contract: AccountId, result: Vec<u8>, gas_used: u64 },
    EthereumCall { ethereum_hash: Vec<u8> },
    CryptoTransfer { assessed_custom_fees: Vec<AccountAmount> },
    UtilPrng { prng_bytes: Vec<u8> },
    CreateSchedule { schedule: AccountId, scheduled_transaction_id: Option<TransactionId> },
    SignSchedule { scheduled_transaction_id: Option<TransactionId> },
    SubmitMessage { topic_running_hash: Vec<u8>, sequence_number: u64 },
}

/// Which case of [`TransactionOutput`] an output carries. A transaction
/// holds at most one output per case.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OutputCase {
    ContractCall,
    ContractCreate,
    EthereumCall,
    CryptoTransfer,
    UtilPrng,
    CreateSchedule,
    SignSchedule,
    SubmitMessage,
}

impl TransactionOutput {
    pub fn case(&self) -> OutputCase {
        match self {
            TransactionOutput::ContractCall { .. } => OutputCase::ContractCall,
            TransactionOutput::ContractCreate { .. } => OutputCase::ContractCreate,
            TransactionOutput::EthereumCall { .. } => OutputCase::EthereumCall,
            TransactionOutput::CryptoTransfer { .. } => OutputCase::CryptoTransfer,
            TransactionOutput::UtilPrng { .. } => OutputCase::UtilPrng,
            TransactionOutput::CreateSchedule { .. } => OutputCase::CreateSchedule,
            TransactionOutput::SignSchedule { .. } => OutputCase::SignSchedule,
            TransactionOutput::SubmitMessage { .. } => OutputCase::SubmitMessage,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TraceData {
    Evm { contract: AccountId, initcode: Vec<u8>, storage_reads: Vec<Vec<u8>> },
    AutoAssociate { account: AccountId, token: AccountId },
    SubmitMessage { running_hash_version: u64 },
}

/* ===== State changes ===== */

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateChangeOperation {
    StateAdd,
    StateRemove,
    SingletonUpdate { value: Vec<u8> },
    MapUpdate { key: Vec<u8>, value: Vec<u8> },
    MapDelete { key: Vec<u8> },
    QueuePush { element: Vec<u8> },
    QueuePop,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub state_id: u32,
    pub operation: StateChangeOperation,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChanges {
    pub consensus_timestamp: Timestamp,
    pub state_changes: Vec<StateChange>,
}

/* ===== Footer / proof ===== */

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockFooter {
    pub previous_block_root_hash: Vec<u8>,
    pub root_hash_of_all_block_hashes_tree: Vec<u8>,
    pub start_of_block_state_root_hash: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockProof {
    pub block: u64,
    pub previous_block_root_hash: Vec<u8>,
    pub start_of_block_state_root_hash: Vec<u8>,
    pub block_signature: Vec<u8>,
    pub sibling_hashes: Vec<Vec<u8>>,
}

/// A legacy record stream file carried whole inside a block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFileItem {
    pub creation_time: Timestamp,
    pub hapi_version: SemanticVersion,
    pub previous_file_hash: Vec<u8>,
    pub record_file_contents: Vec<u8>,
    pub sidecar_file_contents: Vec<Vec<u8>>,
}

/* ===== Framing ===== */

/// A decoded item together with the exact bytes it was decoded from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedBlockItem {
    pub item: BlockItem,
    pub bytes: Vec<u8>,
}

impl EncodedBlockItem {
    pub fn new(item: BlockItem) -> Result<Self, bincode::Error> {
        let bytes = item.to_bytes()?;
        Ok(Self { item, bytes })
    }

    pub fn kind(&self) -> ItemKind {
        self.item.kind()
    }
}

/// Splits an uncompressed block stream into items.
pub fn decode_items(data: &[u8]) -> Result<Vec<EncodedBlockItem>, StreamFileError> {
    let mut items = Vec::new();
    let mut rest = data;

    while !rest.is_empty() {
        let index = items.len();
        if rest.len() < 4 {
            return Err(StreamFileError::Truncated { index });
        }
        let (len_bytes, tail) = rest.split_at(4);
        let len = u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;
        if len > MAX_ITEM_SIZE {
            return Err(StreamFileError::ItemTooLarge { index, len });
        }
        if tail.len() < len {
            return Err(StreamFileError::Truncated { index });
        }
        let (bytes, tail) = tail.split_at(len);
        let item = BlockItem::from_bytes(bytes)
            .map_err(|source| StreamFileError::Codec { index, source })?;
        items.push(EncodedBlockItem { item, bytes: bytes.to_vec() });
        rest = tail;
    }

    Ok(items)
}

/// Frames items into an uncompressed block stream.
pub fn encode_items(items: &[BlockItem]) -> Result<Vec<u8>, bincode::Error> {
    let mut out = Vec::new();
    for item in items {
        let bytes = item.to_bytes()?;
        out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        out.extend_from_slice(&bytes);
    }
    Ok(out)
}
