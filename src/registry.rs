#![forbid(unsafe_code)]

//! Signing node registry (address book).
//!
//! ```json
//! { "nodes": [ { "node_id": 0, "account_id": "0.0.3",
//!                "public_key": "<hex DER SubjectPublicKeyInfo>", "stake": 100 } ] }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use rsa::pkcs8::DecodePublicKey;
use rsa::RsaPublicKey;
use serde::Deserialize;
use thiserror::Error;

use crate::consensus::ConsensusMode;
use crate::core::AccountId;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read address book {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed address book: {0}")]
    Json(#[from] serde_json::Error),

    #[error("address book has no nodes")]
    Empty,

    #[error("node {0} appears more than once")]
    DuplicateNode(u64),

    #[error("node {node_id}: {reason}")]
    InvalidAccountId { node_id: u64, reason: String },

    #[error("node {node_id}: invalid public key: {reason}")]
    InvalidKey { node_id: u64, reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SigningNode {
    pub node_id: u64,
    pub account_id: AccountId,
    pub public_key: RsaPublicKey,
    pub stake: u64,
}

#[derive(Deserialize)]
struct AddressBook {
    nodes: Vec<AddressBookEntry>,
}

#[derive(Deserialize)]
struct AddressBookEntry {
    node_id: u64,
    account_id: String,
    public_key: String,
    #[serde(default)]
    stake: u64,
}

impl AddressBookEntry {
    fn into_node(self) -> Result<SigningNode, RegistryError> {
        let node_id = self.node_id;
        let account_id = self
            .account_id
            .parse()
            .map_err(|reason| RegistryError::InvalidAccountId { node_id, reason })?;
        let der = hex::decode(self.public_key.trim())
            .map_err(|e| RegistryError::InvalidKey { node_id, reason: e.to_string() })?;
        let public_key = RsaPublicKey::from_public_key_der(&der)
            .map_err(|e| RegistryError::InvalidKey { node_id, reason: e.to_string() })?;
        Ok(SigningNode { node_id, account_id, public_key, stake: self.stake })
    }
}

/// Immutable set of signing nodes ordered by node id.
#[derive(Clone, Debug)]
pub struct NodeRegistry {
    nodes: BTreeMap<u64, SigningNode>,
}

impl NodeRegistry {
    pub fn new(nodes: impl IntoIterator<Item = SigningNode>) -> Result<Self, RegistryError> {
        let mut map = BTreeMap::new();
        for node in nodes {
            let id = node.node_id;
            if map.insert(id, node).is_some() {
                return Err(RegistryError::DuplicateNode(id));
            }
        }
        if map.is_empty() {
            return Err(RegistryError::Empty);
        }
        Ok(Self { nodes: map })
    }

    pub fn from_json(json: &str) -> Result<Self, RegistryError> {
        let book: AddressBook = serde_json::from_str(json)?;
        let nodes = book
            .nodes
            .into_iter()
            .map(AddressBookEntry::into_node)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(nodes)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| RegistryError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn node(&self, node_id: u64) -> Option<&SigningNode> {
        self.nodes.get(&node_id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &SigningNode> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn total_stake(&self) -> u128 {
        self.nodes.values().map(|n| u128::from(n.stake)).sum()
    }

    /// Voting weight of one node. Unknown nodes weigh nothing.
    pub fn weight(&self, node_id: u64, mode: ConsensusMode) -> u128 {
        let Some(node) = self.node(node_id) else {
            return 0;
        };
        match mode {
            ConsensusMode::Stake if self.total_stake() > 0 => u128::from(node.stake),
            _ => 1,
        }
    }

    pub fn total_weight(&self, mode: ConsensusMode) -> u128 {
        match mode {
            ConsensusMode::Stake if self.total_stake() > 0 => self.total_stake(),
            _ => self.nodes.len() as u128,
        }
    }
}
