//! Merkle tree commitments over transaction hashes
//!
//! Every level with an odd number of nodes (the leaf level included, even
//! when it holds a single leaf) duplicates its last node before pairing.
//! Proofs carry one step per level, duplicated siblings included, so they
//! can be checked with [`verify_proof`] without the tree.

use std::fmt::Write as _;

use thiserror::Error;

use super::hash::sha256;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MerkleError {
    #[error("Cannot build a merkle tree from an empty leaf set")]
    EmptyInput,
    #[error("Leaf index {index} out of range for {leaves} leaves")]
    IndexOutOfRange { index: usize, leaves: usize },
}

/// Hash two child nodes into their parent
pub fn hash_pair(left: &[u8], right: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(left.len() + right.len());
    data.extend_from_slice(left);
    data.extend_from_slice(right);
    sha256(&data)
}

/// One step of an inclusion proof
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofStep {
    pub sibling: Vec<u8>,
    /// Whether the sibling sits to the left of the running hash
    pub sibling_is_left: bool,
}

/// Merkle proof for verifying transaction inclusion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleProof {
    /// Steps ordered from the leaf level up to just below the root
    pub steps: Vec<ProofStep>,
}

impl MerkleProof {
    /// Verify the proof against a root hash
    pub fn verify(&self, leaf_hash: &[u8], root_hash: &[u8]) -> bool {
        verify_proof(leaf_hash, self, root_hash)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// An immutable merkle tree, stored level by level
#[derive(Debug, Clone)]
pub struct MerkleTree {
    /// `levels[0]` is the padded leaf level, the last level holds the root
    levels: Vec<Vec<Vec<u8>>>,
    leaf_count: usize,
}

impl MerkleTree {
    /// Build a tree from leaf hashes
    pub fn build(leaves: &[Vec<u8>]) -> Result<Self, MerkleError> {
        if leaves.is_empty() {
            return Err(MerkleError::EmptyInput);
        }

        let mut current = leaves.to_vec();
        pad_odd(&mut current);
        let mut levels = vec![current];

        loop {
            let current = &levels[levels.len() - 1];
            if current.len() == 1 {
                break;
            }

            let mut next: Vec<Vec<u8>> = current
                .chunks(2)
                .map(|pair| hash_pair(&pair[0], &pair[1]))
                .collect();
            if next.len() > 1 {
                pad_odd(&mut next);
            }
            levels.push(next);
        }

        Ok(Self {
            levels,
            leaf_count: leaves.len(),
        })
    }

    /// The root hash
    pub fn root(&self) -> &[u8] {
        &self.levels[self.levels.len() - 1][0]
    }

    pub fn root_hex(&self) -> String {
        hex::encode(self.root())
    }

    /// Number of leaves the tree was built from, before padding
    pub fn leaf_count(&self) -> usize {
        self.leaf_count
    }

    pub fn levels(&self) -> &[Vec<Vec<u8>>] {
        &self.levels
    }

    /// Inclusion proof for the leaf at `index`
    pub fn proof(&self, index: usize) -> Result<MerkleProof, MerkleError> {
        if index >= self.leaf_count {
            return Err(MerkleError::IndexOutOfRange {
                index,
                leaves: self.leaf_count,
            });
        }

        let mut steps = Vec::with_capacity(self.levels.len() - 1);
        let mut position = index;

        for level in &self.levels[..self.levels.len() - 1] {
            let current_is_left = position % 2 == 0;
            let sibling_index = if current_is_left {
                position + 1
            } else {
                position - 1
            };
            steps.push(ProofStep {
                sibling: level[sibling_index].clone(),
                sibling_is_left: !current_is_left,
            });
            position /= 2;
        }

        Ok(MerkleProof { steps })
    }

    /// Render each level with shortened hashes
    pub fn visualize(&self) -> String {
        let mut out = String::new();
        for (depth, level) in self.levels.iter().enumerate() {
            let nodes: Vec<String> = level
                .iter()
                .map(|h| {
                    let full = hex::encode(h);
                    format!("{}...", &full[..full.len().min(8)])
                })
                .collect();
            let _ = writeln!(out, "Level {}: [{}]", depth, nodes.join(", "));
        }
        out
    }
}

fn pad_odd(level: &mut Vec<Vec<u8>>) {
    if level.len() % 2 == 1 {
        if let Some(last) = level.last().cloned() {
            level.push(last);
        }
    }
}

/// Recombine `leaf_hash` with each proof step and compare against `root_hash`
pub fn verify_proof(leaf_hash: &[u8], proof: &MerkleProof, root_hash: &[u8]) -> bool {
    let mut current = leaf_hash.to_vec();

    for step in &proof.steps {
        current = if step.sibling_is_left {
            hash_pair(&step.sibling, &current)
        } else {
            hash_pair(&current, &step.sibling)
        };
    }

    current == root_hash
}

/// Merkle root of a list of hashes; the empty list maps to `sha256("")`
pub fn calculate_merkle_root(hashes: &[Vec<u8>]) -> Vec<u8> {
    match MerkleTree::build(hashes) {
        Ok(tree) => tree.root().to_vec(),
        Err(_) => sha256(b""),
    }
}

/// Merkle root from hex-encoded hashes
pub fn calculate_merkle_root_hex(hex_hashes: &[String]) -> String {
    let hashes: Vec<Vec<u8>> = hex_hashes
        .iter()
        .map(|h| hex::decode(h).unwrap_or_else(|_| h.as_bytes().to_vec()))
        .collect();
    hex::encode(calculate_merkle_root(&hashes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(n: usize) -> Vec<Vec<u8>> {
        (0..n).map(|i| sha256(format!("tx{}", i).as_bytes())).collect()
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(MerkleTree::build(&[]).unwrap_err(), MerkleError::EmptyInput);
        assert_eq!(calculate_merkle_root(&[]), sha256(b""));
    }

    #[test]
    fn test_single_leaf_is_duplicated() {
        let l = leaves(1);
        let tree = MerkleTree::build(&l).unwrap();
        assert_eq!(tree.root(), hash_pair(&l[0], &l[0]).as_slice());
        assert_eq!(tree.leaf_count(), 1);
    }

    #[test]
    fn test_four_leaves() {
        let l = leaves(4);
        let tree = MerkleTree::build(&l).unwrap();
        let expected = hash_pair(&hash_pair(&l[0], &l[1]), &hash_pair(&l[2], &l[3]));
        assert_eq!(tree.root(), expected.as_slice());
    }

    #[test]
    fn test_three_leaves_duplicates_last() {
        let l = leaves(3);
        let tree = MerkleTree::build(&l).unwrap();
        let expected = hash_pair(&hash_pair(&l[0], &l[1]), &hash_pair(&l[2], &l[2]));
        assert_eq!(tree.root(), expected.as_slice());
    }

    #[test]
    fn test_odd_upper_level_is_padded() {
        // 6 leaves -> 3 parents -> padded to 4
        let l = leaves(6);
        let tree = MerkleTree::build(&l).unwrap();
        let a = hash_pair(&l[0], &l[1]);
        let b = hash_pair(&l[2], &l[3]);
        let c = hash_pair(&l[4], &l[5]);
        let expected = hash_pair(&hash_pair(&a, &b), &hash_pair(&c, &c));
        assert_eq!(tree.root(), expected.as_slice());
    }

    #[test]
    fn test_every_proof_verifies() {
        for n in 1..=9 {
            let l = leaves(n);
            let tree = MerkleTree::build(&l).unwrap();
            for (i, leaf) in l.iter().enumerate() {
                let proof = tree.proof(i).unwrap();
                assert!(verify_proof(leaf, &proof, tree.root()), "n={} i={}", n, i);
            }
        }
    }

    #[test]
    fn test_flipped_proof_byte_fails() {
        let l = leaves(5);
        let tree = MerkleTree::build(&l).unwrap();
        let proof = tree.proof(2).unwrap();

        for step in 0..proof.len() {
            for byte in 0..proof.steps[step].sibling.len() {
                let mut tampered = proof.clone();
                tampered.steps[step].sibling[byte] ^= 0x01;
                assert!(!tampered.verify(&l[2], tree.root()));
            }
        }
    }

    #[test]
    fn test_proof_for_wrong_leaf_fails() {
        let l = leaves(4);
        let tree = MerkleTree::build(&l).unwrap();
        let proof = tree.proof(0).unwrap();
        assert!(!verify_proof(&l[1], &proof, tree.root()));
    }

    #[test]
    fn test_proof_index_out_of_range() {
        let tree = MerkleTree::build(&leaves(3)).unwrap();
        assert_eq!(
            tree.proof(3).unwrap_err(),
            MerkleError::IndexOutOfRange {
                index: 3,
                leaves: 3
            }
        );
    }

    #[test]
    fn test_visualize_lists_levels() {
        let tree = MerkleTree::build(&leaves(4)).unwrap();
        let text = tree.visualize();
        assert!(text.contains("Level 0"));
        assert!(text.contains("Level 2"));
        assert!(!text.contains("Level 3"));
    }
}
