//! Cryptographic utilities for the ledger
//!
//! This module provides:
//! - SHA-256 and HASH160 hashing
//! - secp256k1 key management and the [`Signer`] contract
//! - Merkle trees and inclusion proofs

pub mod hash;
pub mod keys;
pub mod merkle;

pub use hash::{double_sha256, double_sha256_hex, hash160, meets_difficulty, sha256, sha256_hex};
pub use keys::{
    address_from_public_key_hex, public_key_from_hex, public_key_to_address, sign_message,
    verify_raw, verify_signature, KeyError, KeyPair, Signer,
};
pub use merkle::{
    calculate_merkle_root, calculate_merkle_root_hex, verify_proof, MerkleError, MerkleProof,
    MerkleTree, ProofStep,
};
