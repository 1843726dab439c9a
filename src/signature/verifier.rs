#![forbid(unsafe_code)]

//! Node signature verification.
//!
//! Each record is checked on its own against its node's RSA key; a failure
//! only ever affects that record. Records fan out across the rayon pool.

use std::sync::Arc;

use rayon::prelude::*;
use rsa::pkcs1v15::{Signature, VerifyingKey};
use rsa::signature::Verifier;
use rsa::RsaPublicKey;
use sha2::Sha384;
use thiserror::Error;
use tracing::{debug, warn};

use crate::registry::NodeRegistry;

use super::{FileSignature, SignatureStatus, SignatureType};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("node {0} is not in the address book")]
    UnknownNode(u64),

    #[error("no signature type declared")]
    MissingSignatureType,

    #[error("unsupported signature type {0}")]
    UnsupportedSignatureType(SignatureType),

    #[error("no file hash")]
    MissingFileHash,

    #[error("no file hash signature")]
    MissingSignature,

    #[error("metadata hash present without its signature")]
    MissingMetadataSignature,

    #[error("{0} signature does not verify")]
    Invalid(&'static str),
}

/// RSA PKCS#1 v1.5 with SHA-384 over `message`.
pub fn verify_sha384_with_rsa(
    key: &RsaPublicKey,
    message: &[u8],
    signature: &[u8],
    what: &'static str,
) -> Result<(), SignatureError> {
    let signature = Signature::try_from(signature).map_err(|_| SignatureError::Invalid(what))?;
    VerifyingKey::<Sha384>::new(key.clone())
        .verify(message, &signature)
        .map_err(|_| SignatureError::Invalid(what))
}

#[derive(Clone, Debug)]
pub struct NodeSignatureVerifier {
    registry: Arc<NodeRegistry>,
}

impl NodeSignatureVerifier {
    pub fn new(registry: Arc<NodeRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// Checks a single record without touching its status.
    pub fn check(&self, sig: &FileSignature) -> Result<(), SignatureError> {
        let node = self
            .registry
            .node(sig.node_id)
            .ok_or(SignatureError::UnknownNode(sig.node_id))?;

        match sig.signature_type.ok_or(SignatureError::MissingSignatureType)? {
            SignatureType::Sha384WithRsa => {}
            other => return Err(SignatureError::UnsupportedSignatureType(other)),
        }
        let file_hash = sig.file_hash.as_ref().ok_or(SignatureError::MissingFileHash)?;
        let file_sig = sig
            .file_hash_signature
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or(SignatureError::MissingSignature)?;
        verify_sha384_with_rsa(&node.public_key, file_hash, file_sig, "file hash")?;

        if let Some(metadata_hash) = &sig.metadata_hash {
            let metadata_sig = sig
                .metadata_hash_signature
                .as_deref()
                .filter(|s| !s.is_empty())
                .ok_or(SignatureError::MissingMetadataSignature)?;
            verify_sha384_with_rsa(&node.public_key, metadata_hash, metadata_sig, "metadata hash")?;
        }
        Ok(())
    }

    /// Verifies every `Downloaded` record in parallel, moving the good ones
    /// to `Verified`. Returns how many were verified.
    pub fn verify(&self, signatures: &mut [FileSignature]) -> usize {
        signatures
            .par_iter_mut()
            .filter(|sig| sig.status() == SignatureStatus::Downloaded)
            .map(|sig| match self.check(sig) {
                Ok(()) => {
                    sig.advance(SignatureStatus::Verified);
                    debug!(node = sig.node_id, file = %sig.filename, "signature verified");
                    1
                }
                Err(e) => {
                    warn!(node = sig.node_id, file = %sig.filename, error = %e, "signature rejected");
                    0
                }
            })
            .sum()
    }
}
