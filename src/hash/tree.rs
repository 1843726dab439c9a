#![forbid(unsafe_code)]

//! Perfect binary tree hasher.
//!
//! Leaves are appended in order; the root is computed by padding the leaf
//! list on the right with [`empty_hash`] up to the next power of two and
//! folding adjacent pairs with `SHA-384(left || right)` until one node is
//! left.

use crate::core::{empty_hash, sha384_concat, Hash48};

use super::HashError;

/// Parent node of two children.
#[inline]
pub fn combine(left: &Hash48, right: &Hash48) -> Hash48 {
    sha384_concat(&[left, right])
}

#[derive(Clone, Debug, Default)]
pub struct TreeHasher {
    leaves: Vec<Hash48>,
    root: Option<Hash48>,
}

impl TreeHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a leaf. Fails once the root has been taken.
    pub fn add_leaf(&mut self, leaf: Hash48) -> Result<&mut Self, HashError> {
        if self.root.is_some() {
            return Err(HashError::AlreadyDigested);
        }
        self.leaves.push(leaf);
        Ok(self)
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    /// Root of the tree. Seals the hasher; repeated calls return the same root.
    pub fn digest(&mut self) -> Hash48 {
        if let Some(root) = self.root {
            return root;
        }
        let root = root_of(std::mem::take(&mut self.leaves));
        self.root = Some(root);
        root
    }
}

fn root_of(mut level: Vec<Hash48>) -> Hash48 {
    if level.is_empty() {
        return *empty_hash();
    }

    level.resize(level.len().next_power_of_two(), *empty_hash());

    while level.len() > 1 {
        level = level
            .chunks_exact(2)
            .map(|pair| combine(&pair[0], &pair[1]))
            .collect();
    }
    level[0]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::sha384;
    use proptest::prelude::*;

    fn leaf(i: u8) -> Hash48 {
        sha384(&[i])
    }

    fn digest_of(leaves: &[Hash48]) -> Hash48 {
        let mut h = TreeHasher::new();
        for l in leaves {
            h.add_leaf(*l).unwrap();
        }
        h.digest()
    }

    #[test]
    fn empty_tree_is_empty_hash() {
        assert_eq!(TreeHasher::new().digest(), *empty_hash());
    }

    #[test]
    fn single_leaf_is_its_own_root() {
        assert_eq!(digest_of(&[leaf(1)]), leaf(1));
    }

    #[test]
    fn three_leaves_pad_with_empty() {
        let (a, b, c) = (leaf(1), leaf(2), leaf(3));
        let expected = combine(&combine(&a, &b), &combine(&c, empty_hash()));
        assert_eq!(digest_of(&[a, b, c]), expected);
    }

    #[test]
    fn add_after_digest_fails_and_digest_is_stable() {
        let mut h = TreeHasher::new();
        h.add_leaf(leaf(1)).unwrap().add_leaf(leaf(2)).unwrap();
        let first = h.digest();
        assert_eq!(h.digest(), first);
        assert!(matches!(h.add_leaf(leaf(3)), Err(HashError::AlreadyDigested)));
    }

    fn arb_leaves() -> impl Strategy<Value = Vec<Hash48>> {
        prop::collection::vec(any::<u8>(), 0..24)
            .prop_map(|seeds| seeds.into_iter().map(leaf).collect())
    }

    proptest! {
        #[test]
        fn digest_is_deterministic(leaves in arb_leaves()) {
            prop_assert_eq!(digest_of(&leaves), digest_of(&leaves));
        }

        #[test]
        fn padding_to_power_of_two_is_transparent(leaves in arb_leaves()) {
            prop_assume!(!leaves.is_empty() && !leaves.len().is_power_of_two());
            let mut padded = leaves.clone();
            padded.resize(leaves.len().next_power_of_two(), *empty_hash());
            prop_assert_eq!(digest_of(&leaves), digest_of(&padded));
        }

        #[test]
        fn swapping_distinct_leaves_changes_root(
            leaves in prop::collection::vec(any::<u8>(), 2..24),
            i in any::<prop::sample::Index>(),
            j in any::<prop::sample::Index>(),
        ) {
            let leaves: Vec<Hash48> = leaves.into_iter().map(leaf).collect();
            let (i, j) = (i.index(leaves.len()), j.index(leaves.len()));
            prop_assume!(leaves[i] != leaves[j]);
            let mut swapped = leaves.clone();
            swapped.swap(i, j);
            prop_assert_ne!(digest_of(&leaves), digest_of(&swapped));
        }
    }
}
