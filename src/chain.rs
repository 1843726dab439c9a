#![forbid(unsafe_code)]

//! Hash chain linkage between consecutive accepted blocks.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::block::BlockFile;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("block {block}: previous hash {declared:?} does not link to {expected:?}")]
    Mismatch {
        block: u64,
        declared: String,
        expected: String,
    },

    #[error("block {actual} is out of sequence, expected {expected}")]
    OutOfSequence { expected: u64, actual: u64 },

    #[error("chain state {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("chain state {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

pub struct HashChainValidator;

impl HashChainValidator {
    /// Both empty (genesis) or equal as bytes.
    pub fn verify(declared_previous: &str, expected_previous: &str) -> bool {
        match (declared_previous.is_empty(), expected_previous.is_empty()) {
            (true, true) => true,
            (false, false) => declared_previous.eq_ignore_ascii_case(expected_previous),
            _ => false,
        }
    }

    pub fn verify_block(block: &BlockFile, expected_previous: &str) -> bool {
        Self::verify(&block.previous_hash, expected_previous)
    }
}

/// Last accepted block. An empty hash means nothing accepted yet.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTip {
    pub block_number: Option<u64>,
    pub hash: String,
}

impl ChainTip {
    /// Tip just before `block_number`, whose previous hash must be `hash`.
    /// Block 0 has nothing before it.
    pub fn before(block_number: u64, hash: impl Into<String>) -> Self {
        match block_number.checked_sub(1) {
            Some(n) => Self { block_number: Some(n), hash: hash.into() },
            None => Self::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.block_number.is_none()
    }

    pub fn next_block_number(&self) -> Option<u64> {
        self.block_number.map(|n| n + 1)
    }
}

/// Process-wide chain state. Accepting a block checks the link and moves the
/// tip under one lock, so files are accepted strictly in sequence.
#[derive(Debug)]
pub struct HashChainState {
    tip: Mutex<ChainTip>,
    path: Option<PathBuf>,
}

impl Default for HashChainState {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl HashChainState {
    pub fn in_memory() -> Self {
        Self::starting_at(ChainTip::default())
    }

    pub fn starting_at(tip: ChainTip) -> Self {
        Self { tip: Mutex::new(tip), path: None }
    }

    /// Loads the tip from `path`, creating an empty state file if missing.
    pub async fn open(p: impl AsRef<Path>) -> Result<Self, ChainError> {
        let path = p.as_ref().to_path_buf();
        let display = path.display().to_string();

        let tip = match tokio::fs::read(&path).await {
            Ok(buf) => serde_json::from_slice(&buf)
                .map_err(|source| ChainError::Json { path: display.clone(), source })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let tip = ChainTip::default();
                save(&path, &tip).await?;
                tip
            }
            Err(source) => return Err(ChainError::Io { path: display, source }),
        };
        debug!(path = %path.display(), ?tip, "chain state loaded");
        Ok(Self { tip: Mutex::new(tip), path: Some(path) })
    }

    pub async fn tip(&self) -> ChainTip {
        self.tip.lock().await.clone()
    }

    /// Sets the tip when nothing has been accepted yet, persisting it when
    /// backed by a file. Returns whether the tip changed.
    pub async fn seed(&self, start: ChainTip) -> Result<bool, ChainError> {
        let mut tip = self.tip.lock().await;
        if !tip.is_empty() || start.is_empty() {
            return Ok(false);
        }
        if let Some(path) = &self.path {
            save(path, &start).await?;
        }
        info!(after = ?start.block_number, hash = %start.hash, "chain seeded");
        *tip = start;
        Ok(true)
    }

    /// Whether `block` would link onto the current tip.
    pub async fn check(&self, block: &BlockFile) -> Result<(), ChainError> {
        link(&*self.tip.lock().await, block)
    }

    /// Links `block` onto the tip and advances it, persisting when backed by
    /// a file. Leaves the tip untouched on any failure.
    pub async fn accept(&self, block: &BlockFile) -> Result<(), ChainError> {
        let mut tip = self.tip.lock().await;
        link(&tip, block)?;

        let next = ChainTip { block_number: Some(block.index), hash: block.hash.clone() };
        if let Some(path) = &self.path {
            save(path, &next).await?;
        }
        *tip = next;
        info!(block = block.index, hash = %block.hash, "chain advanced");
        Ok(())
    }
}

fn link(tip: &ChainTip, block: &BlockFile) -> Result<(), ChainError> {
    if let Some(expected) = tip.next_block_number() {
        if block.index != expected {
            return Err(ChainError::OutOfSequence { expected, actual: block.index });
        }
    }
    if !HashChainValidator::verify_block(block, &tip.hash) {
        error!(
            block = block.index,
            declared = %block.previous_hash,
            expected = %tip.hash,
            "hash chain broken"
        );
        return Err(ChainError::Mismatch {
            block: block.index,
            declared: block.previous_hash.clone(),
            expected: tip.hash.clone(),
        });
    }
    Ok(())
}

async fn save(path: &Path, tip: &ChainTip) -> Result<(), ChainError> {
    let display = || path.display().to_string();
    let buf = serde_json::to_vec_pretty(tip)
        .map_err(|source| ChainError::Json { path: display(), source })?;
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, buf)
        .await
        .map_err(|source| ChainError::Io { path: display(), source })?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|source| ChainError::Io { path: display(), source })
}
