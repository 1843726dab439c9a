#![forbid(unsafe_code)]

//! Ingestion configuration, read from JSON.
//!
//! Every field has a default, so `{}` is a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use serde::{Deserialize, Serialize};

use crate::consensus::{ConsensusMode, ConsensusRatio};
use crate::core::HASH_LEN;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MirrorConfig {
    /// Root of the per-node stream directories.
    pub stream_dir: PathBuf,
    pub address_book: PathBuf,
    /// Chain state file; kept in memory only when unset.
    pub chain_state: Option<PathBuf>,
    pub consensus_ratio: ConsensusRatio,
    pub consensus_mode: ConsensusMode,
    pub retry_interval_ms: u64,
    pub stall_timeout_ms: u64,
    /// First block to ingest when the chain state is empty.
    pub start_block: Option<u64>,
    /// Root hash of the block before `start_block`, which it must link to.
    /// Required when starting past genesis.
    pub start_previous_hash: Option<String>,
    pub max_blocks: Option<u64>,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            stream_dir: PathBuf::from("./streams"),
            address_book: PathBuf::from("./address_book.json"),
            chain_state: None,
            consensus_ratio: ConsensusRatio::ONE_THIRD,
            consensus_mode: ConsensusMode::Stake,
            retry_interval_ms: 500,
            stall_timeout_ms: 30_000,
            start_block: None,
            start_previous_hash: None,
            max_blocks: None,
        }
    }
}

impl MirrorConfig {
    pub fn load(p: impl AsRef<Path>) -> Result<Self> {
        let path = p.as_ref();
        let buf = std::fs::read(path).with_context(|| format!("reading config {}", path.display()))?;
        let cfg: Self = serde_json::from_slice(&buf)
            .with_context(|| format!("parsing config {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.retry_interval_ms > 0, "retry_interval_ms must be positive");
        ensure!(
            self.stall_timeout_ms >= self.retry_interval_ms,
            "stall_timeout_ms ({}) is shorter than retry_interval_ms ({})",
            self.stall_timeout_ms,
            self.retry_interval_ms
        );
        match (self.start_block.unwrap_or(0), &self.start_previous_hash) {
            (0, Some(_)) => bail!("start_previous_hash is only used with a start_block after genesis"),
            (n, None) if n > 0 => bail!("start_block {n} needs start_previous_hash"),
            (_, Some(hash)) => ensure!(
                hash.len() == 2 * HASH_LEN && hash.bytes().all(|b| b.is_ascii_hexdigit()),
                "start_previous_hash must be {} hex characters",
                2 * HASH_LEN
            ),
            _ => {}
        }
        Ok(())
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }
}
