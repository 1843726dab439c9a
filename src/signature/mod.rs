#![forbid(unsafe_code)]

//! Per-node signature files and their verification state.

pub mod reader;
pub mod verifier;

use std::cmp::Ordering;
use std::fmt;

use crate::core::{AccountId, Hash48};
use crate::filename::StreamFilename;

pub use reader::{SignatureFile, SignatureFileError};
pub use verifier::{NodeSignatureVerifier, SignatureError};

/* ===== Algorithm identifiers ===== */

/// Signature scheme declared inside a signature file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SignatureType {
    Sha384WithRsa,
    Unrecognized(i32),
}

impl SignatureType {
    pub const SHA384_WITH_RSA: i32 = 1;

    pub fn from_code(code: i32) -> Self {
        match code {
            Self::SHA384_WITH_RSA => Self::Sha384WithRsa,
            other => Self::Unrecognized(other),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            Self::Sha384WithRsa => Self::SHA384_WITH_RSA,
            Self::Unrecognized(code) => *code,
        }
    }
}

impl fmt::Display for SignatureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha384WithRsa => f.write_str("SHA384withRSA"),
            Self::Unrecognized(code) => write!(f, "unrecognized({code})"),
        }
    }
}

/* ===== Status ===== */

/// `Downloaded → Verified → ConsensusReached`, or `Downloaded → NotFound`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SignatureStatus {
    Downloaded,
    Verified,
    ConsensusReached,
    NotFound,
}

impl SignatureStatus {
    pub fn can_advance_to(self, next: SignatureStatus) -> bool {
        use SignatureStatus::*;
        matches!(
            (self, next),
            (Downloaded, Verified) | (Verified, ConsensusReached) | (Downloaded, NotFound)
        )
    }
}

/* ===== FileSignature ===== */

/// One node's signature over one stream file.
///
/// Equality and ordering look only at `(filename, node_id)`: two submissions
/// from the same node for the same file are the same logical record.
#[derive(Clone, Debug)]
pub struct FileSignature {
    pub node_id: u64,
    pub node_account_id: AccountId,
    /// Data file the signature covers.
    pub filename: StreamFilename,
    pub version: Option<u8>,
    pub file_hash: Option<Hash48>,
    pub file_hash_signature: Option<Vec<u8>>,
    pub metadata_hash: Option<Hash48>,
    pub metadata_hash_signature: Option<Vec<u8>>,
    pub signature_type: Option<SignatureType>,
    status: SignatureStatus,
}

impl FileSignature {
    /// Builds a `Downloaded` record from a decoded signature file. The data
    /// filename follows the file version: v6 signs the compressed file.
    pub fn from_file(
        node_id: u64,
        node_account_id: AccountId,
        block: &StreamFilename,
        file: SignatureFile,
    ) -> Self {
        Self {
            node_id,
            node_account_id,
            filename: block.data_filename(file.compressed_data()),
            version: Some(file.version),
            file_hash: Some(file.file_hash),
            file_hash_signature: Some(file.file_hash_signature),
            metadata_hash: file.metadata_hash,
            metadata_hash_signature: file.metadata_hash_signature,
            signature_type: Some(file.signature_type),
            status: SignatureStatus::Downloaded,
        }
    }

    /// Placeholder for a node whose signature file could not be fetched.
    pub fn not_found(node_id: u64, node_account_id: AccountId, block: &StreamFilename) -> Self {
        Self {
            node_id,
            node_account_id,
            filename: block.data_filename(true),
            version: None,
            file_hash: None,
            file_hash_signature: None,
            metadata_hash: None,
            metadata_hash_signature: None,
            signature_type: None,
            status: SignatureStatus::NotFound,
        }
    }

    pub fn status(&self) -> SignatureStatus {
        self.status
    }

    /// Moves the record forward. Returns `false` and leaves the status
    /// untouched for any transition the state machine does not allow.
    pub fn advance(&mut self, next: SignatureStatus) -> bool {
        if self.status.can_advance_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }

    pub fn is_verified(&self) -> bool {
        matches!(self.status, SignatureStatus::Verified | SignatureStatus::ConsensusReached)
    }

    pub fn file_hash_hex(&self) -> Option<String> {
        self.file_hash.map(hex::encode)
    }

    fn key(&self) -> (u64, u64) {
        (self.filename.block_number(), self.node_id)
    }
}

impl PartialEq for FileSignature {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for FileSignature {}

impl PartialOrd for FileSignature {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FileSignature {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn file(version: u8) -> SignatureFile {
        SignatureFile {
            version,
            file_hash: [1u8; 48],
            file_hash_signature: vec![2u8; 16],
            signature_type: SignatureType::Sha384WithRsa,
            metadata_hash: None,
            metadata_hash_signature: None,
        }
    }

    fn block() -> StreamFilename {
        StreamFilename::for_block(7).unwrap()
    }

    #[test]
    fn status_only_moves_forward() {
        let mut sig = FileSignature::from_file(0, AccountId::new(0, 0, 3), &block(), file(6));
        assert!(!sig.advance(SignatureStatus::ConsensusReached));
        assert!(sig.advance(SignatureStatus::Verified));
        assert!(!sig.advance(SignatureStatus::Downloaded));
        assert!(!sig.advance(SignatureStatus::NotFound));
        assert!(sig.advance(SignatureStatus::ConsensusReached));
        assert_eq!(sig.status(), SignatureStatus::ConsensusReached);
    }

    #[test]
    fn not_found_is_terminal() {
        let mut sig = FileSignature::not_found(1, AccountId::new(0, 0, 4), &block());
        assert!(!sig.advance(SignatureStatus::Verified));
        assert_eq!(sig.status(), SignatureStatus::NotFound);
    }

    #[test]
    fn version_selects_data_file() {
        let v6 = FileSignature::from_file(0, AccountId::new(0, 0, 3), &block(), file(6));
        let v5 = FileSignature::from_file(0, AccountId::new(0, 0, 3), &block(), file(5));
        assert!(v6.filename.is_compressed());
        assert!(!v5.filename.is_compressed());
    }

    #[test]
    fn duplicates_collapse_on_node_and_file() {
        let a = FileSignature::from_file(0, AccountId::new(0, 0, 3), &block(), file(6));
        let mut b = a.clone();
        b.file_hash = Some([9u8; 48]);
        let c = FileSignature::from_file(1, AccountId::new(0, 0, 4), &block(), file(6));

        let set: BTreeSet<_> = [a.clone(), b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
        assert_eq!(set.iter().next().unwrap().file_hash, a.file_hash);
    }
}
