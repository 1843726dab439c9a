#![forbid(unsafe_code)]

//! Ingestion orchestrator.
//!
//! Per block: signatures from every node → verification → consensus →
//! matching data copy → parse and rehash → chain link → sink → chain tip.
//! Nothing advances unless every step succeeds.

pub mod local;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::block::{BlockFile, BlockStreamReader, StreamFileData, StreamFileError};
use crate::chain::{ChainError, ChainTip, HashChainState};
use crate::config::MirrorConfig;
use crate::consensus::{ConsensusDecision, ConsensusError, ConsensusValidator};
use crate::filename::StreamFilename;
use crate::registry::{NodeRegistry, SigningNode};
use crate::signature::{FileSignature, NodeSignatureVerifier, SignatureFile, SignatureStatus};

pub use local::LocalStreamSource;

/* ===== Collaborators ===== */

/// Where signature and data files come from. `Ok(None)` means the node has
/// no such file (yet).
#[async_trait]
pub trait StreamSource: Send + Sync {
    async fn signature(
        &self,
        node: &SigningNode,
        filename: &StreamFilename,
    ) -> anyhow::Result<Option<Vec<u8>>>;

    async fn data(&self, node: &SigningNode, filename: &StreamFilename) -> anyhow::Result<Option<Vec<u8>>>;
}

/// Persistence for accepted blocks. Must tolerate seeing the same block twice.
#[async_trait]
pub trait BlockSink: Send + Sync {
    async fn persist(&self, block: &BlockFile) -> anyhow::Result<()>;
}

/* ===== Errors ===== */

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("{filename}: consensus not reached ({verified} verified signatures)")]
    NoConsensus { filename: String, verified: usize },

    #[error("{filename}: no consensus node supplied the data file")]
    NoData { filename: String },

    #[error("{filename}: computed hash {actual} does not match consensus hash {expected}")]
    HashMismatch {
        filename: String,
        expected: String,
        actual: String,
    },

    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error(transparent)]
    StreamFile(#[from] StreamFileError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error("persisting {filename}: {source}")]
    Sink {
        filename: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("verification task failed: {0}")]
    Task(#[from] JoinError),
}

impl IngestError {
    /// Whether a later attempt at the same file may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IngestError::NoConsensus { .. } | IngestError::NoData { .. } | IngestError::Sink { .. }
        )
    }
}

/* ===== Candidate set ===== */

/// All signatures gathered for one block, one per node, ordered by node id,
/// plus the data file once a copy matching the consensus hash is found.
#[derive(Clone, Debug)]
pub struct CandidateFileSet {
    filename: StreamFilename,
    signatures: Vec<FileSignature>,
    data: Option<StreamFileData>,
}

impl CandidateFileSet {
    pub fn new(filename: StreamFilename) -> Self {
        Self { filename, signatures: Vec::new(), data: None }
    }

    pub fn filename(&self) -> &StreamFilename {
        &self.filename
    }

    /// Adds a submission. A real signature replaces a `NotFound` placeholder
    /// for the same node; any other duplicate is dropped. Returns whether the
    /// set changed.
    pub fn add(&mut self, sig: FileSignature) -> bool {
        match self.signatures.binary_search_by_key(&sig.node_id, |s| s.node_id) {
            Err(at) => {
                self.signatures.insert(at, sig);
                true
            }
            Ok(at) => {
                let existing = &mut self.signatures[at];
                if existing.status() == SignatureStatus::NotFound && sig.status() != SignatureStatus::NotFound {
                    *existing = sig;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn signatures(&self) -> &[FileSignature] {
        &self.signatures
    }

    pub fn signatures_mut(&mut self) -> &mut [FileSignature] {
        &mut self.signatures
    }

    pub fn signature_of(&self, node_id: u64) -> Option<&FileSignature> {
        self.signatures
            .binary_search_by_key(&node_id, |s| s.node_id)
            .ok()
            .map(|i| &self.signatures[i])
    }

    /// Keeps the first matching data copy; later ones are dropped.
    pub fn attach_data(&mut self, data: StreamFileData) -> bool {
        if self.data.is_some() {
            return false;
        }
        self.data = Some(data);
        true
    }

    pub fn data(&self) -> Option<&StreamFileData> {
        self.data.as_ref()
    }

    pub fn verified(&self) -> usize {
        self.signatures.iter().filter(|s| s.is_verified()).count()
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }
}

/* ===== Orchestrator ===== */

#[derive(Clone, Debug)]
pub struct IngestOptions {
    /// First block when the chain state is empty.
    pub start_block: u64,
    /// Hash the start block links to, when past genesis.
    pub start_previous_hash: Option<String>,
    pub retry_interval: Duration,
    pub stall_timeout: Duration,
    pub max_blocks: Option<u64>,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self::from(&MirrorConfig::default())
    }
}

impl From<&MirrorConfig> for IngestOptions {
    fn from(cfg: &MirrorConfig) -> Self {
        Self {
            start_block: cfg.start_block.unwrap_or(0),
            start_previous_hash: cfg.start_previous_hash.clone(),
            retry_interval: cfg.retry_interval(),
            stall_timeout: cfg.stall_timeout(),
            max_blocks: cfg.max_blocks,
        }
    }
}

impl IngestOptions {
    /// Chain tip to seed an empty chain state with.
    pub fn start_tip(&self) -> ChainTip {
        match &self.start_previous_hash {
            Some(hash) => ChainTip::before(self.start_block, hash.to_ascii_lowercase()),
            None => ChainTip::default(),
        }
    }
}

/// A file that could not be ingested within the stall timeout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StalledFile {
    pub filename: String,
    pub reason: String,
    pub waited: Duration,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub accepted: u64,
    pub last_block: Option<u64>,
    pub stalled: Option<StalledFile>,
}

pub struct Ingestor {
    registry: Arc<NodeRegistry>,
    source: Arc<dyn StreamSource>,
    sink: Arc<dyn BlockSink>,
    chain: Arc<HashChainState>,
    verifier: NodeSignatureVerifier,
    validator: ConsensusValidator,
    reader: BlockStreamReader,
    options: IngestOptions,
}

impl Ingestor {
    pub fn new(
        registry: Arc<NodeRegistry>,
        validator: ConsensusValidator,
        source: Arc<dyn StreamSource>,
        sink: Arc<dyn BlockSink>,
        chain: Arc<HashChainState>,
        options: IngestOptions,
    ) -> Self {
        Self {
            verifier: NodeSignatureVerifier::new(registry.clone()),
            registry,
            source,
            sink,
            chain,
            validator,
            reader: BlockStreamReader::new(),
            options,
        }
    }

    pub fn from_config(
        cfg: &MirrorConfig,
        registry: Arc<NodeRegistry>,
        source: Arc<dyn StreamSource>,
        sink: Arc<dyn BlockSink>,
        chain: Arc<HashChainState>,
    ) -> Self {
        let validator = ConsensusValidator::new(registry.clone(), cfg.consensus_ratio, cfg.consensus_mode);
        Self::new(registry, validator, source, sink, chain, IngestOptions::from(cfg))
    }

    pub fn chain(&self) -> &HashChainState {
        &self.chain
    }

    /// The block after the chain tip, or the configured start block.
    pub async fn next_filename(&self) -> StreamFilename {
        let tip = self.chain.tip().await;
        StreamFilename::from_number(tip.next_block_number().unwrap_or(self.options.start_block))
    }

    /// Seeds an empty chain state from the configured start block.
    async fn seed_chain(&self) -> Result<(), IngestError> {
        self.chain.seed(self.options.start_tip()).await?;
        Ok(())
    }

    pub async fn ingest_next(&self) -> Result<BlockFile, IngestError> {
        self.seed_chain().await?;
        let filename = self.next_filename().await;
        self.ingest(&filename).await
    }

    /// Runs one block through the whole pipeline.
    pub async fn ingest(&self, filename: &StreamFilename) -> Result<BlockFile, IngestError> {
        let mut candidates = self.collect_signatures(filename).await;

        let verifier = self.verifier.clone();
        let mut candidates = tokio::task::spawn_blocking(move || {
            verifier.verify(candidates.signatures_mut());
            candidates
        })
        .await?;

        let Some(decision) = self.validator.validate(candidates.signatures_mut())? else {
            return Err(IngestError::NoConsensus {
                filename: filename.to_string(),
                verified: candidates.verified(),
            });
        };

        let block = self.fetch_matching_block(filename, &mut candidates, &decision).await?;
        debug!(
            file = %filename,
            bytes = candidates.data().map_or(0, |d| d.bytes.len()),
            "matching data copy attached"
        );

        self.chain.check(&block).await?;
        self.sink
            .persist(&block)
            .await
            .map_err(|source| IngestError::Sink { filename: block.name.clone(), source })?;
        self.chain.accept(&block).await?;

        info!(
            block = block.index,
            hash = %block.hash,
            transactions = block.transactions.len(),
            signers = decision.nodes.len(),
            "block accepted"
        );
        Ok(block)
    }

    /// Fetches every node's signature file concurrently. Missing or
    /// unreadable files become `NotFound` placeholders.
    async fn collect_signatures(&self, filename: &StreamFilename) -> CandidateFileSet {
        let sig_name = filename.signature_filename();
        let mut tasks = JoinSet::new();
        for node in self.registry.nodes().cloned() {
            let source = self.source.clone();
            let sig_name = sig_name.clone();
            tasks.spawn(async move {
                let fetched = source.signature(&node, &sig_name).await;
                (node, fetched)
            });
        }

        let mut candidates = CandidateFileSet::new(filename.clone());
        while let Some(joined) = tasks.join_next().await {
            let (node, fetched) = match joined {
                Ok(done) => done,
                Err(e) => {
                    warn!(error = %e, "signature fetch task failed");
                    continue;
                }
            };
            let sig = match fetched {
                Ok(Some(bytes)) => match SignatureFile::from_bytes(&bytes) {
                    Ok(file) => FileSignature::from_file(node.node_id, node.account_id, filename, file),
                    Err(e) => {
                        warn!(node = node.node_id, file = %sig_name, error = %e, "unreadable signature file");
                        FileSignature::not_found(node.node_id, node.account_id, filename)
                    }
                },
                Ok(None) => {
                    debug!(node = node.node_id, file = %sig_name, "no signature file");
                    FileSignature::not_found(node.node_id, node.account_id, filename)
                }
                Err(e) => {
                    warn!(node = node.node_id, file = %sig_name, error = %e, "signature fetch failed");
                    FileSignature::not_found(node.node_id, node.account_id, filename)
                }
            };
            candidates.add(sig);
        }
        candidates
    }

    /// Tries the data copy of each consensus node in turn until one parses
    /// and rehashes to the consensus hash. The winning copy is attached to
    /// `candidates`.
    async fn fetch_matching_block(
        &self,
        filename: &StreamFilename,
        candidates: &mut CandidateFileSet,
        decision: &ConsensusDecision,
    ) -> Result<BlockFile, IngestError> {
        let expected = decision.file_hash_hex();
        let mut mismatch: Option<String> = None;
        let mut structural: Option<StreamFileError> = None;

        for &node_id in &decision.nodes {
            let (Some(node), Some(sig)) = (self.registry.node(node_id), candidates.signature_of(node_id)) else {
                continue;
            };
            let data_name = sig.filename.clone();
            let bytes = match self.source.data(node, &data_name).await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => {
                    debug!(node = node_id, file = %data_name, "no data file");
                    continue;
                }
                Err(e) => {
                    warn!(node = node_id, file = %data_name, error = %e, "data fetch failed");
                    continue;
                }
            };

            let data = StreamFileData::new(data_name.clone(), bytes);
            let block = match self.parse(filename, &data) {
                Ok(block) => block,
                Err(e) => {
                    warn!(node = node_id, file = %data_name, error = %e, "data file rejected");
                    structural.get_or_insert(e);
                    continue;
                }
            };
            if !block.hash.eq_ignore_ascii_case(&expected) {
                warn!(node = node_id, file = %data_name, computed = %block.hash, %expected, "data file hash mismatch");
                mismatch.get_or_insert(block.hash);
                continue;
            }
            candidates.attach_data(data);
            return Ok(block);
        }

        let filename = filename.to_string();
        let err = match (mismatch, structural) {
            (Some(actual), _) => IngestError::HashMismatch { filename, expected, actual },
            (None, Some(e)) => IngestError::StreamFile(e),
            (None, None) => IngestError::NoData { filename },
        };
        Err(err)
    }

    fn parse(&self, filename: &StreamFilename, data: &StreamFileData) -> Result<BlockFile, StreamFileError> {
        let block = self.reader.read(data)?;
        if block.index != filename.block_number() {
            return Err(StreamFileError::BlockNumberMismatch {
                filename: data.filename.to_string(),
                actual: block.index,
            });
        }
        Ok(block)
    }

    /// Ingests blocks until `max_blocks`, a fatal error, or a file stays
    /// unavailable past the stall timeout.
    pub async fn run(&self) -> Result<RunSummary, IngestError> {
        self.seed_chain().await?;
        let mut summary = RunSummary::default();
        let mut waiting: Option<(StreamFilename, Instant)> = None;

        loop {
            if self.options.max_blocks.is_some_and(|max| summary.accepted >= max) {
                break;
            }

            let filename = self.next_filename().await;
            match self.ingest(&filename).await {
                Ok(block) => {
                    summary.accepted += 1;
                    summary.last_block = Some(block.index);
                    waiting = None;
                }
                Err(e) if e.is_retryable() => {
                    let since = match &waiting {
                        Some((name, since)) if *name == filename => *since,
                        _ => {
                            let now = Instant::now();
                            waiting = Some((filename.clone(), now));
                            now
                        }
                    };
                    let waited = since.elapsed();
                    if waited >= self.options.stall_timeout {
                        warn!(file = %filename, waited_ms = waited.as_millis() as u64, error = %e, "ingestion stalled");
                        summary.stalled = Some(StalledFile {
                            filename: filename.to_string(),
                            reason: e.to_string(),
                            waited,
                        });
                        break;
                    }
                    debug!(file = %filename, error = %e, "not ready, retrying");
                    tokio::time::sleep(self.options.retry_interval).await;
                }
                Err(e) => {
                    error!(file = %filename, error = %e, "ingestion halted");
                    return Err(e);
                }
            }
        }

        info!(accepted = summary.accepted, last = ?summary.last_block, "ingestion run finished");
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::AccountId;
    use crate::signature::SignatureType;

    fn name() -> StreamFilename {
        StreamFilename::from_number(3)
    }

    fn downloaded(node_id: u64, hash: u8) -> FileSignature {
        let file = SignatureFile {
            version: 6,
            file_hash: [hash; 48],
            file_hash_signature: vec![1],
            signature_type: SignatureType::Sha384WithRsa,
            metadata_hash: None,
            metadata_hash_signature: None,
        };
        FileSignature::from_file(node_id, AccountId::new(0, 0, 3 + node_id), &name(), file)
    }

    #[test]
    fn candidate_set_collapses_duplicates() {
        let mut set = CandidateFileSet::new(name());
        assert!(set.add(FileSignature::not_found(1, AccountId::new(0, 0, 4), &name())));
        assert!(set.add(downloaded(0, 1)));
        assert!(set.add(downloaded(1, 1)));
        assert!(!set.add(downloaded(1, 2)));
        assert!(!set.add(FileSignature::not_found(0, AccountId::new(0, 0, 3), &name())));

        assert_eq!(set.len(), 2);
        let ids: Vec<u64> = set.signatures().iter().map(|s| s.node_id).collect();
        assert_eq!(ids, vec![0, 1]);
        assert_eq!(set.signature_of(1).unwrap().file_hash, Some([1u8; 48]));
        assert_eq!(set.signature_of(1).unwrap().status(), SignatureStatus::Downloaded);
    }

    #[test]
    fn retryable_errors() {
        assert!(IngestError::NoConsensus { filename: "f".into(), verified: 0 }.is_retryable());
        assert!(IngestError::NoData { filename: "f".into() }.is_retryable());
        assert!(!IngestError::HashMismatch {
            filename: "f".into(),
            expected: "a".into(),
            actual: "b".into()
        }
        .is_retryable());
        assert!(!IngestError::Chain(ChainError::OutOfSequence { expected: 1, actual: 2 }).is_retryable());
    }

    #[test]
    fn candidate_set_keeps_first_matching_copy() {
        let mut set = CandidateFileSet::new(name());
        assert!(set.data().is_none());
        assert!(set.attach_data(StreamFileData::new(name(), vec![1, 2, 3])));
        assert!(!set.attach_data(StreamFileData::new(name(), vec![9])));
        assert_eq!(set.data().unwrap().bytes, vec![1, 2, 3]);
    }

    #[test]
    fn options_follow_config() {
        let cfg = MirrorConfig {
            start_block: Some(9),
            start_previous_hash: Some("AB".repeat(48)),
            max_blocks: Some(1),
            ..Default::default()
        };
        let opts = IngestOptions::from(&cfg);
        assert_eq!(opts.start_block, 9);
        assert_eq!(opts.max_blocks, Some(1));
        assert_eq!(opts.retry_interval, Duration::from_millis(500));
        assert_eq!(opts.start_tip(), ChainTip { block_number: Some(8), hash: "ab".repeat(48) });

        assert!(IngestOptions::default().start_tip().is_empty());
    }
}
