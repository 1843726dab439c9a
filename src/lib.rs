//! Mirror node stream ingestion.
//!
//! Verifies block stream files signed by the network's consensus nodes and
//! decodes them into typed blocks:
//! - core: SHA-384 helpers, timestamps, account ids
//! - filename: block stream file naming
//! - hash: perfect binary tree hasher and the block root hash
//! - block: block item codec and the single-pass block parser
//! - signature: signature file codec and RSA verification per node
//! - registry: signing nodes and their weights
//! - consensus: stake-weighted quorum over claimed file hashes
//! - chain: previous-hash linkage and the persisted chain tip
//! - ingest: orchestration over pluggable sources and sinks
//! - config: JSON configuration

#![forbid(unsafe_code)]

pub mod block;
pub mod chain;
pub mod config;
pub mod consensus;
pub mod core;
pub mod filename;
pub mod hash;
pub mod ingest;
pub mod registry;
pub mod signature;

// Re-export main types for convenience
pub use block::{BlockFile, BlockStreamReader, BlockTransaction, StreamFileData, StreamFileError};
pub use chain::{ChainError, ChainTip, HashChainState, HashChainValidator};
pub use config::MirrorConfig;
pub use consensus::{ConsensusDecision, ConsensusError, ConsensusMode, ConsensusRatio, ConsensusValidator};
pub use crate::core::{empty_hash, sha384, AccountId, Hash48, Timestamp};
pub use filename::{block_stream_filename, FilenameError, StreamFilename};
pub use hash::{BlockRootHashDigest, HashError, TreeHasher};
pub use ingest::{
    BlockSink, CandidateFileSet, IngestError, IngestOptions, Ingestor, LocalStreamSource, RunSummary,
    StalledFile, StreamSource,
};
pub use registry::{NodeRegistry, RegistryError, SigningNode};
pub use signature::{
    FileSignature, NodeSignatureVerifier, SignatureError, SignatureFile, SignatureFileError,
    SignatureStatus, SignatureType,
};
