//! Mirror node CLI: ingest verified block streams, inspect stream files.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use mirror_node::filename::FileKind;
use mirror_node::{
    block_stream_filename, BlockFile, BlockSink, BlockStreamReader, HashChainState, Ingestor,
    LocalStreamSource, MirrorConfig, NodeRegistry, SignatureFile, StreamFileData, StreamFilename,
};

#[derive(Parser, Debug)]
#[command(name = "mirror", version)]
#[command(about = "Verified block stream ingestion")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Ingest blocks from the stream directory until stalled or stopped
    Ingest {
        /// JSON configuration file
        #[arg(long, default_value = "./mirror.json")]
        config: PathBuf,

        /// Override the configured maximum number of blocks
        #[arg(long)]
        max_blocks: Option<u64>,
    },

    /// Decode a block (.blk, .blk.gz) or signature (.blk_sig) file
    Inspect {
        file: PathBuf,
    },

    /// Print the block stream filename for a block number
    Filename {
        #[arg(allow_negative_numbers = true)]
        block_number: i64,
    },
}

/// Accepted blocks only go to the log.
struct LogSink;

#[async_trait]
impl BlockSink for LogSink {
    async fn persist(&self, block: &BlockFile) -> Result<()> {
        info!(
            block = block.index,
            hash = %block.hash,
            start = %block.consensus_start,
            end = %block.consensus_end,
            transactions = block.transactions.len(),
            "block persisted"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    match cli.cmd {
        Cmd::Ingest { config, max_blocks } => ingest(&config, max_blocks).await,
        Cmd::Inspect { file } => inspect(&file),
        Cmd::Filename { block_number } => {
            println!("{}", block_stream_filename(block_number)?);
            Ok(())
        }
    }
}

async fn ingest(config: &Path, max_blocks: Option<u64>) -> Result<()> {
    let mut cfg = MirrorConfig::load(config)?;
    if max_blocks.is_some() {
        cfg.max_blocks = max_blocks;
    }

    let registry = Arc::new(NodeRegistry::load(&cfg.address_book)?);
    let chain = Arc::new(match &cfg.chain_state {
        Some(path) => HashChainState::open(path).await?,
        None => HashChainState::in_memory(),
    });
    info!(
        nodes = registry.len(),
        ratio = %cfg.consensus_ratio,
        mode = ?cfg.consensus_mode,
        tip = ?chain.tip().await,
        "starting ingestion"
    );

    let source = Arc::new(LocalStreamSource::new(&cfg.stream_dir));
    let ingestor = Ingestor::from_config(&cfg, registry, source, Arc::new(LogSink), chain);

    tokio::select! {
        summary = ingestor.run() => {
            let summary = summary?;
            println!("accepted: {}", summary.accepted);
            if let Some(last) = summary.last_block {
                println!("last block: {last}");
            }
            if let Some(stalled) = summary.stalled {
                println!("stalled on {} after {:?}: {}", stalled.filename, stalled.waited, stalled.reason);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!(tip = ?ingestor.chain().tip().await, "interrupted");
        }
    }
    Ok(())
}

fn inspect(file: &Path) -> Result<()> {
    let name = file
        .file_name()
        .and_then(|n| n.to_str())
        .context("file has no name")?;
    let filename = StreamFilename::parse(name)?;
    let bytes = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;

    match filename.kind() {
        FileKind::Signature => {
            let sig = SignatureFile::from_bytes(&bytes)?;
            println!("version:            {}", sig.version);
            println!("signature type:     {}", sig.signature_type);
            println!("file hash:          {}", hex::encode(sig.file_hash));
            println!("signature length:   {}", sig.file_hash_signature.len());
            if let Some(m) = sig.metadata_hash {
                println!("metadata hash:      {}", hex::encode(m));
            }
            println!("data file:          {}", filename.data_filename(sig.compressed_data()));
        }
        FileKind::Data { .. } => {
            let block = BlockStreamReader::new().read(&StreamFileData::new(filename.clone(), bytes))?;
            if block.index != filename.block_number() {
                bail!("{}: header block number {} does not match filename", name, block.index);
            }
            println!("block:              {}", block.index);
            println!("hash:               {}", block.hash);
            println!("previous hash:      {}", block.previous_hash);
            println!("consensus start:    {}", block.consensus_start);
            println!("consensus end:      {}", block.consensus_end);
            println!("items:              {}", block.count);
            println!("size:               {}", block.size);
            println!("transactions:       {}", block.transactions.len());
            for (i, tx) in block.transactions.iter().enumerate() {
                let parent = block
                    .parent_of(i)
                    .map(|p| format!(" parent={}", p.consensus_timestamp()))
                    .unwrap_or_default();
                println!(
                    "  {} {} {:?}{}",
                    tx.consensus_timestamp(),
                    tx.body.data.name(),
                    tx.result.status,
                    parent
                );
            }
            if block.is_record_file() {
                println!("wraps a record file");
            }
        }
    }
    Ok(())
}
