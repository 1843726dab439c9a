#![forbid(unsafe_code)]

//! Stake-weighted consensus over the file hashes claimed by signing nodes.
//!
//! A claimed hash is accepted when the nodes that verifiably signed it hold
//! at least `ratio` of the total weight. All arithmetic is exact (192-bit
//! cross-multiplication of `u128` weights by `u64` ratio terms); no floating
//! point is involved.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::core::Hash48;
use crate::registry::NodeRegistry;
use crate::signature::{FileSignature, SignatureStatus};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("invalid consensus ratio '{0}': expected n/d with 0 <= n <= d and d > 0")]
    InvalidRatio(String),

    #[error("hashes {first} and {second} both reached consensus with weight {weight}")]
    Ambiguous {
        first: String,
        second: String,
        weight: u128,
    },
}

/// How node weight is counted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsensusMode {
    /// Every node counts once.
    Equal,
    /// Nodes count by stake; equal when no node has stake.
    #[default]
    Stake,
}

/* ===== Ratio ===== */

/// Fraction of total weight required to accept a hash, e.g. `1/3`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ConsensusRatio {
    numerator: u64,
    denominator: u64,
}

impl ConsensusRatio {
    pub const ONE_THIRD: Self = Self { numerator: 1, denominator: 3 };

    pub fn new(numerator: u64, denominator: u64) -> Result<Self, ConsensusError> {
        if denominator == 0 || numerator > denominator {
            return Err(ConsensusError::InvalidRatio(format!("{numerator}/{denominator}")));
        }
        Ok(Self { numerator, denominator })
    }

    pub fn numerator(&self) -> u64 {
        self.numerator
    }

    pub fn denominator(&self) -> u64 {
        self.denominator
    }

    /// `weight / total >= ratio`. Zero weight never reaches consensus.
    pub fn is_met(&self, weight: u128, total: u128) -> bool {
        weight > 0 && total > 0 && widening_mul(weight, self.denominator) >= widening_mul(total, self.numerator)
    }
}

/// `a * b` as `(high, low)` with value `high * 2^64 + low`. Never overflows:
/// `high <= (2^64 - 1)^2 + (2^64 - 1) < 2^128`.
fn widening_mul(a: u128, b: u64) -> (u128, u64) {
    const LOW: u128 = u64::MAX as u128;
    let b = u128::from(b);
    let low = (a & LOW) * b;
    let high = (a >> 64) * b + (low >> 64);
    (high, low as u64)
}

impl Default for ConsensusRatio {
    fn default() -> Self {
        Self::ONE_THIRD
    }
}

impl fmt::Display for ConsensusRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.numerator, self.denominator)
    }
}

impl FromStr for ConsensusRatio {
    type Err = ConsensusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConsensusError::InvalidRatio(s.to_string());
        let (n, d) = match s.trim().split_once('/') {
            Some((n, d)) => (n.trim(), d.trim()),
            None => (s.trim(), "1"),
        };
        let n = n.parse::<u64>().map_err(|_| invalid())?;
        let d = d.parse::<u64>().map_err(|_| invalid())?;
        Self::new(n, d).map_err(|_| invalid())
    }
}

impl TryFrom<String> for ConsensusRatio {
    type Error = ConsensusError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ConsensusRatio> for String {
    fn from(r: ConsensusRatio) -> Self {
        r.to_string()
    }
}

/* ===== Validator ===== */

/// The accepted hash for one file and who backed it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsensusDecision {
    pub file_hash: Hash48,
    pub weight: u128,
    pub total_weight: u128,
    /// Node ids in ascending order.
    pub nodes: Vec<u64>,
}

impl ConsensusDecision {
    pub fn file_hash_hex(&self) -> String {
        hex::encode(self.file_hash)
    }
}

#[derive(Default)]
struct Tally {
    weight: u128,
    nodes: BTreeSet<u64>,
    records: Vec<usize>,
}

#[derive(Clone, Debug)]
pub struct ConsensusValidator {
    registry: Arc<NodeRegistry>,
    ratio: ConsensusRatio,
    mode: ConsensusMode,
}

impl ConsensusValidator {
    pub fn new(registry: Arc<NodeRegistry>, ratio: ConsensusRatio, mode: ConsensusMode) -> Self {
        Self { registry, ratio, mode }
    }

    pub fn ratio(&self) -> ConsensusRatio {
        self.ratio
    }

    /// Tallies verified records by claimed hash. On consensus, every record
    /// behind the winning hash moves to `ConsensusReached`. `Ok(None)` means
    /// not enough weight yet, which is retryable.
    pub fn validate(
        &self,
        signatures: &mut [FileSignature],
    ) -> Result<Option<ConsensusDecision>, ConsensusError> {
        let total = self.registry.total_weight(self.mode);
        let mut tallies: BTreeMap<Hash48, Tally> = BTreeMap::new();

        for (i, sig) in signatures.iter().enumerate() {
            if sig.status() != SignatureStatus::Verified {
                continue;
            }
            let Some(hash) = sig.file_hash else { continue };
            let tally = tallies.entry(hash).or_default();
            if tally.nodes.insert(sig.node_id) {
                tally.weight += self.registry.weight(sig.node_id, self.mode);
            }
            tally.records.push(i);
        }

        let mut reached: Vec<(Hash48, Tally)> = tallies
            .into_iter()
            .filter(|(_, t)| self.ratio.is_met(t.weight, total))
            .collect();
        reached.sort_by(|a, b| b.1.weight.cmp(&a.1.weight));

        let mut reached = reached.into_iter();
        let Some((file_hash, winner)) = reached.next() else {
            debug!(signatures = signatures.len(), total, ratio = %self.ratio, "consensus not reached");
            return Ok(None);
        };
        if let Some((other, runner_up)) = reached.next() {
            if runner_up.weight == winner.weight {
                warn!(weight = winner.weight, "conflicting hashes with equal weight");
                return Err(ConsensusError::Ambiguous {
                    first: hex::encode(file_hash),
                    second: hex::encode(other),
                    weight: winner.weight,
                });
            }
            warn!(
                accepted = %hex::encode(file_hash),
                rejected = %hex::encode(other),
                "more than one hash reached consensus; taking the heavier"
            );
        }

        for &i in &winner.records {
            signatures[i].advance(SignatureStatus::ConsensusReached);
        }
        info!(
            hash = %hex::encode(file_hash),
            weight = winner.weight,
            total,
            nodes = winner.nodes.len(),
            "consensus reached"
        );

        Ok(Some(ConsensusDecision {
            file_hash,
            weight: winner.weight,
            total_weight: total,
            nodes: winner.nodes.into_iter().collect(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::AccountId;
    use crate::filename::StreamFilename;
    use crate::registry::SigningNode;
    use crate::signature::{SignatureFile, SignatureType};
    use rsa::{RsaPrivateKey, RsaPublicKey};
    use std::sync::OnceLock;

    fn key() -> RsaPublicKey {
        static KEY: OnceLock<RsaPublicKey> = OnceLock::new();
        KEY.get_or_init(|| {
            RsaPrivateKey::new(&mut rand::thread_rng(), 512)
                .unwrap()
                .to_public_key()
        })
        .clone()
    }

    fn registry(stakes: &[u64]) -> Arc<NodeRegistry> {
        let nodes = stakes.iter().enumerate().map(|(i, &stake)| SigningNode {
            node_id: i as u64,
            account_id: AccountId::new(0, 0, 3 + i as u64),
            public_key: key(),
            stake,
        });
        Arc::new(NodeRegistry::new(nodes).unwrap())
    }

    fn record(node_id: u64, hash: u8, verified: bool) -> FileSignature {
        let file = SignatureFile {
            version: 6,
            file_hash: [hash; 48],
            file_hash_signature: vec![1],
            signature_type: SignatureType::Sha384WithRsa,
            metadata_hash: None,
            metadata_hash_signature: None,
        };
        let mut sig = FileSignature::from_file(
            node_id,
            AccountId::new(0, 0, 3 + node_id),
            &StreamFilename::for_block(1).unwrap(),
            file,
        );
        if verified {
            sig.advance(SignatureStatus::Verified);
        }
        sig
    }

    fn equal(n: usize) -> ConsensusValidator {
        ConsensusValidator::new(registry(&vec![1; n]), ConsensusRatio::ONE_THIRD, ConsensusMode::Equal)
    }

    #[test]
    fn ceil_third_of_equal_nodes_is_enough() {
        for n in 1..=12usize {
            let needed = n.div_ceil(3);
            let v = equal(n);

            let mut sigs: Vec<_> = (0..n as u64).map(|i| record(i, 1, (i as usize) < needed)).collect();
            assert!(v.validate(&mut sigs).unwrap().is_some(), "n={n}");

            let mut sigs: Vec<_> = (0..n as u64).map(|i| record(i, 1, (i as usize) + 1 < needed)).collect();
            assert!(v.validate(&mut sigs).unwrap().is_none(), "n={n}");
        }
    }

    #[test]
    fn winners_are_marked() {
        let v = equal(3);
        let mut sigs = vec![record(0, 1, true), record(1, 1, true), record(2, 1, false)];
        let decision = v.validate(&mut sigs).unwrap().unwrap();
        assert_eq!(decision.file_hash, [1u8; 48]);
        assert_eq!(decision.nodes, vec![0, 1]);
        assert_eq!((decision.weight, decision.total_weight), (2, 3));
        assert_eq!(sigs[0].status(), SignatureStatus::ConsensusReached);
        assert_eq!(sigs[1].status(), SignatureStatus::ConsensusReached);
        assert_eq!(sigs[2].status(), SignatureStatus::Downloaded);
    }

    #[test]
    fn stake_weighting() {
        let reg = registry(&[10, 10, 80]);
        let v = ConsensusValidator::new(reg.clone(), ConsensusRatio::ONE_THIRD, ConsensusMode::Stake);
        let mut sigs = vec![record(0, 1, true), record(1, 1, true)];
        assert!(v.validate(&mut sigs).unwrap().is_none());

        let mut sigs = vec![record(0, 1, true), record(2, 2, true)];
        let d = v.validate(&mut sigs).unwrap().unwrap();
        assert_eq!(d.file_hash, [2u8; 48]);
        assert_eq!(d.weight, 80);
    }

    #[test]
    fn heavier_hash_wins_and_ties_are_ambiguous() {
        let v = ConsensusValidator::new(registry(&[1; 6]), ConsensusRatio::new(1, 6).unwrap(), ConsensusMode::Equal);

        let mut sigs = vec![record(0, 1, true), record(1, 2, true), record(2, 2, true)];
        let d = v.validate(&mut sigs).unwrap().unwrap();
        assert_eq!(d.file_hash, [2u8; 48]);
        assert_eq!(sigs[0].status(), SignatureStatus::Verified);

        let mut sigs = vec![record(0, 1, true), record(1, 2, true)];
        assert!(matches!(v.validate(&mut sigs), Err(ConsensusError::Ambiguous { weight: 1, .. })));
    }

    #[test]
    fn duplicate_node_counts_once() {
        let v = equal(3);
        let mut sigs = vec![record(0, 1, true), record(0, 1, true)];
        assert!(v.validate(&mut sigs).unwrap().is_some());

        let v = ConsensusValidator::new(registry(&[1; 3]), ConsensusRatio::new(2, 3).unwrap(), ConsensusMode::Equal);
        let mut sigs = vec![record(0, 1, true), record(0, 1, true)];
        assert!(v.validate(&mut sigs).unwrap().is_none());
    }

    #[test]
    fn ratio_parsing() {
        assert_eq!("1/3".parse::<ConsensusRatio>().unwrap(), ConsensusRatio::ONE_THIRD);
        assert_eq!(" 2 / 3 ".parse::<ConsensusRatio>().unwrap(), ConsensusRatio::new(2, 3).unwrap());
        assert_eq!("1".parse::<ConsensusRatio>().unwrap(), ConsensusRatio::new(1, 1).unwrap());
        assert_eq!("0".parse::<ConsensusRatio>().unwrap(), ConsensusRatio::new(0, 1).unwrap());
        for bad in ["4/3", "1/0", "a/b", "-1/3", ""] {
            assert!(bad.parse::<ConsensusRatio>().is_err(), "{bad}");
        }
    }

    #[test]
    fn ratio_serde_as_string() {
        let json = serde_json::to_string(&ConsensusRatio::ONE_THIRD).unwrap();
        assert_eq!(json, "\"1/3\"");
        let back: ConsensusRatio = serde_json::from_str("\"2/5\"").unwrap();
        assert_eq!(back, ConsensusRatio::new(2, 5).unwrap());
        assert!(serde_json::from_str::<ConsensusRatio>("\"3/2\"").is_err());
    }

    #[test]
    fn ratio_check_is_exact_past_u64_stakes() {
        let max = u128::from(u64::MAX);
        let nearly_all = ConsensusRatio::new(u64::MAX - 1, u64::MAX).unwrap();
        assert!(!nearly_all.is_met(max, 2 * max));
        assert!(nearly_all.is_met(2 * max - 2, 2 * max));
        assert!(!nearly_all.is_met(2 * max - 3, 2 * max));

        let half = ConsensusRatio::new(1, 2).unwrap();
        assert!(half.is_met(max, 2 * max));
        assert!(!half.is_met(max - 1, 2 * max));

        let all = ConsensusRatio::new(u64::MAX, u64::MAX).unwrap();
        assert!(all.is_met(u128::MAX, u128::MAX));
        assert!(!all.is_met(u128::MAX - 1, u128::MAX));
        assert!(ConsensusRatio::new(0, u64::MAX).unwrap().is_met(1, u128::MAX));
    }

    #[test]
    fn max_stake_registry_needs_both_signers() {
        let reg = registry(&[u64::MAX, u64::MAX]);
        let v = ConsensusValidator::new(reg, ConsensusRatio::new(u64::MAX - 1, u64::MAX).unwrap(), ConsensusMode::Stake);

        let mut sigs = vec![record(0, 1, true), record(1, 1, false)];
        assert!(v.validate(&mut sigs).unwrap().is_none());

        let mut sigs = vec![record(0, 1, true), record(1, 1, true)];
        let d = v.validate(&mut sigs).unwrap().unwrap();
        assert_eq!(d.total_weight, 2 * u128::from(u64::MAX));
    }

    #[test]
    fn zero_ratio_still_needs_a_signer() {
        let v = ConsensusValidator::new(registry(&[1; 3]), ConsensusRatio::new(0, 1).unwrap(), ConsensusMode::Equal);
        let mut sigs = vec![record(0, 1, false)];
        assert!(v.validate(&mut sigs).unwrap().is_none());
        let mut sigs = vec![record(0, 1, true)];
        assert!(v.validate(&mut sigs).unwrap().is_some());
    }
}
