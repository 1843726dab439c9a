//! Shared fixtures: node keys, synthetic blocks, signature files.

#![allow(dead_code)]

use std::io::Write;
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use rsa::pkcs1v15::SigningKey;
use rsa::signature::{SignatureEncoding, Signer};
use rsa::RsaPrivateKey;
use sha2::Sha384;

use mirror_node::block::item::*;
use mirror_node::{
    AccountId, BlockFile, BlockRootHashDigest, BlockSink, Hash48, LocalStreamSource, NodeRegistry,
    SignatureFile, SignatureType, SigningNode, StreamFilename, Timestamp,
};

pub const MAX_NODES: usize = 4;

pub fn keys() -> &'static [RsaPrivateKey] {
    static KEYS: OnceLock<Vec<RsaPrivateKey>> = OnceLock::new();
    KEYS.get_or_init(|| {
        let mut rng = rand::thread_rng();
        (0..MAX_NODES)
            .map(|_| RsaPrivateKey::new(&mut rng, 1024).expect("key generation"))
            .collect()
    })
}

pub fn account(node_id: u64) -> AccountId {
    AccountId::new(0, 0, 3 + node_id)
}

/// Nodes `0..stakes.len()` with the given stakes.
pub fn registry(stakes: &[u64]) -> Arc<NodeRegistry> {
    assert!(stakes.len() <= MAX_NODES);
    let nodes = stakes.iter().enumerate().map(|(i, &stake)| SigningNode {
        node_id: i as u64,
        account_id: account(i as u64),
        public_key: keys()[i].to_public_key(),
        stake,
    });
    Arc::new(NodeRegistry::new(nodes).expect("registry"))
}

pub fn sign(node_id: u64, message: &[u8]) -> Vec<u8> {
    SigningKey::<Sha384>::new(keys()[node_id as usize].clone())
        .sign(message)
        .to_vec()
}

/// Signature file from `node_id` over `file_hash`, in format `version`.
pub fn signature_file(node_id: u64, file_hash: &Hash48, version: u8) -> SignatureFile {
    let metadata_hash = mirror_node::sha384(file_hash);
    let with_metadata = version != 2;
    SignatureFile {
        version,
        file_hash: *file_hash,
        file_hash_signature: sign(node_id, file_hash),
        signature_type: SignatureType::Sha384WithRsa,
        metadata_hash: with_metadata.then_some(metadata_hash),
        metadata_hash_signature: with_metadata.then(|| sign(node_id, &metadata_hash)),
    }
}

/* ===== Blocks ===== */

pub fn ts(seconds: i64, nanos: i32) -> Timestamp {
    Timestamp::new(seconds, nanos)
}

fn transaction(memo: &str) -> Vec<u8> {
    let body = TransactionBody {
        transaction_id: TransactionId {
            payer: AccountId::new(0, 0, 1001),
            valid_start: ts(1_700_000_000, 0),
            nonce: 0,
            scheduled: false,
        },
        node_account_id: AccountId::new(0, 0, 3),
        transaction_fee: 100_000,
        memo: memo.to_string(),
        data: TransactionData::CryptoTransfer {
            transfers: vec![
                AccountAmount { account: AccountId::new(0, 0, 1001), amount: -10 },
                AccountAmount { account: AccountId::new(0, 0, 1002), amount: 10 },
            ],
        },
    };
    SignedTransaction {
        body_bytes: body.to_bytes().expect("body"),
        sig_map: vec![SignaturePair { pub_key_prefix: vec![1], signature: vec![2; 64] }],
    }
    .to_bytes()
    .expect("signed transaction")
}

/// `[header, round, event, (signed tx, result, state changes) * txs, proof]`
/// for block `number`, linked to `previous` (empty for genesis).
pub fn block_items(number: u64, previous: &[u8], txs: usize) -> Vec<BlockItem> {
    let base = 1_700_000_000 + number as i64 * 2;
    let mut items = vec![
        BlockItem::BlockHeader(BlockHeader {
            hapi_version: SemanticVersion { major: 0, minor: 60, patch: 0 },
            software_version: SemanticVersion { major: 0, minor: 60, patch: 0 },
            number,
            block_timestamp: ts(base, 0),
            hash_algorithm: HashAlgorithm::Sha2_384,
        }),
        BlockItem::RoundHeader(RoundHeader { round_number: number * 10 + 1 }),
        BlockItem::EventHeader(EventHeader { creator_node_id: 0, birth_round: number * 10 }),
    ];
    for i in 0..txs {
        let at = ts(base, 1_000 + i as i32);
        items.push(BlockItem::SignedTransaction(transaction(&format!("tx {number}/{i}"))));
        items.push(BlockItem::TransactionResult(TransactionResult {
            status: ResponseCode::Success,
            consensus_timestamp: at,
            parent_consensus_timestamp: None,
            transaction_fee_charged: 50_000,
            transfer_list: vec![],
        }));
        items.push(BlockItem::StateChanges(StateChanges {
            consensus_timestamp: at,
            state_changes: vec![StateChange {
                state_id: 2,
                operation: StateChangeOperation::MapUpdate { key: vec![i as u8], value: vec![1] },
            }],
        }));
    }
    items.push(BlockItem::BlockProof(BlockProof {
        block: number,
        previous_block_root_hash: previous.to_vec(),
        start_of_block_state_root_hash: vec![0x5a; 48],
        block_signature: vec![0; 32],
        sibling_hashes: vec![],
    }));
    items
}

/// Root hash computed straight from the items.
pub fn root_hash(items: &[BlockItem]) -> Hash48 {
    let mut digest = BlockRootHashDigest::new();
    for item in items {
        digest
            .add_item(&EncodedBlockItem::new(item.clone()).expect("encode"))
            .expect("add item");
    }
    let hex_root = digest.digest().expect("digest");
    hex::decode(hex_root).expect("hex").try_into().expect("48 bytes")
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data).expect("gzip");
    enc.finish().expect("gzip")
}

/// Gzipped stream file bytes for `items`.
pub fn stream_file(items: &[BlockItem]) -> Vec<u8> {
    gzip(&encode_items(items).expect("encode"))
}

/* ===== Filesystem network ===== */

/// Writes block `number` and a v6 signature file for each of `signers`
/// into the source. Returns the block's root hash.
pub async fn publish_block(
    source: &LocalStreamSource,
    signers: &[u64],
    number: u64,
    previous: &[u8],
) -> Hash48 {
    let items = block_items(number, previous, 2);
    let hash = root_hash(&items);
    let data = stream_file(&items);
    let name = StreamFilename::from_number(number);
    for &node in signers {
        source.publish(&account(node), &name, &data).await.expect("publish data");
        let sig = signature_file(node, &hash, 6).to_bytes();
        source
            .publish(&account(node), &name.signature_filename(), &sig)
            .await
            .expect("publish signature");
    }
    hash
}

/// Sink that keeps everything it is given.
#[derive(Default)]
pub struct CollectingSink {
    pub blocks: Mutex<Vec<BlockFile>>,
}

impl CollectingSink {
    pub fn indexes(&self) -> Vec<u64> {
        self.blocks.lock().expect("sink lock").iter().map(|b| b.index).collect()
    }
}

#[async_trait]
impl BlockSink for CollectingSink {
    async fn persist(&self, block: &BlockFile) -> anyhow::Result<()> {
        self.blocks.lock().expect("sink lock").push(block.clone());
        Ok(())
    }
}
