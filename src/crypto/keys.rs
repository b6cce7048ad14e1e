//! secp256k1 key pairs, addresses and the signing contract
//!
//! The ledger never creates key material on its own. Anything able to sign
//! for an address implements [`Signer`]; [`KeyPair`] is the stock
//! implementation used by wallets and tests.

use rand::rngs::OsRng;
use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1, SecretKey};
use thiserror::Error;

use super::hash::{double_sha256, hash160, sha256};

/// Errors that can occur during key operations
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Invalid private key")]
    InvalidPrivateKey,
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Secp256k1 error: {0}")]
    Secp256k1Error(#[from] secp256k1::Error),
}

/// Something that owns an address and can sign for it.
pub trait Signer {
    /// Address derived from the signer's public key
    fn address(&self) -> String;

    /// Compressed public key, hex encoded
    fn public_key_hex(&self) -> String;

    /// Compact signature over `message`
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, KeyError>;
}

/// A key pair consisting of a private key and its corresponding public key
#[derive(Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let (secret_key, public_key) = secp.generate_keypair(&mut OsRng);
        Self {
            secret_key,
            public_key,
        }
    }

    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let public_key = PublicKey::from_secret_key(&secp, &secret_key);
        Self {
            secret_key,
            public_key,
        }
    }

    /// Create a key pair from a hex-encoded private key
    pub fn from_private_key_hex(hex_key: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_key).map_err(|_| KeyError::InvalidPrivateKey)?;
        let secret_key = SecretKey::from_slice(&bytes).map_err(|_| KeyError::InvalidPrivateKey)?;
        Ok(Self::from_secret_key(secret_key))
    }

    pub fn private_key_hex(&self) -> String {
        hex::encode(self.secret_key.secret_bytes())
    }

    /// Compressed SEC1 encoding of the public key
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.public_key.serialize().to_vec()
    }

    /// HASH160 of the compressed public key
    pub fn public_key_hash(&self) -> Vec<u8> {
        hash160(&self.public_key.serialize())
    }

    /// Verify a signature against this key pair's public key
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<bool, KeyError> {
        verify_signature(&self.public_key, message, signature)
    }
}

impl Signer for KeyPair {
    fn address(&self) -> String {
        public_key_to_address(&self.public_key)
    }

    fn public_key_hex(&self) -> String {
        hex::encode(self.public_key.serialize())
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, KeyError> {
        sign_message(&self.secret_key, message)
    }
}

/// Base58Check(0x00 || HASH160(pubkey))
pub fn public_key_to_address(public_key: &PublicKey) -> String {
    let mut address_bytes = vec![0x00];
    address_bytes.extend_from_slice(&hash160(&public_key.serialize()));

    let checksum = double_sha256(&address_bytes);
    address_bytes.extend_from_slice(&checksum[..4]);

    bs58::encode(address_bytes).into_string()
}

/// Address for a hex-encoded public key
pub fn address_from_public_key_hex(hex_key: &str) -> Result<String, KeyError> {
    Ok(public_key_to_address(&public_key_from_hex(hex_key)?))
}

/// Parse a public key from hex string
pub fn public_key_from_hex(hex_key: &str) -> Result<PublicKey, KeyError> {
    let bytes = hex::decode(hex_key).map_err(|_| KeyError::InvalidPublicKey)?;
    PublicKey::from_slice(&bytes).map_err(|_| KeyError::InvalidPublicKey)
}

// Messages that are not already a 32-byte digest are hashed first.
fn message_digest(message: &[u8]) -> Result<Message, KeyError> {
    let digest = if message.len() == 32 {
        message.to_vec()
    } else {
        sha256(message)
    };
    Ok(Message::from_digest_slice(&digest)?)
}

/// Sign a message with a secret key
pub fn sign_message(secret_key: &SecretKey, message: &[u8]) -> Result<Vec<u8>, KeyError> {
    let secp = Secp256k1::new();
    let signature = secp.sign_ecdsa(&message_digest(message)?, secret_key);
    Ok(signature.serialize_compact().to_vec())
}

/// Verify a compact signature against a public key
pub fn verify_signature(
    public_key: &PublicKey,
    message: &[u8],
    signature: &[u8],
) -> Result<bool, KeyError> {
    let secp = Secp256k1::new();
    let sig = Signature::from_compact(signature).map_err(|_| KeyError::InvalidSignature)?;
    Ok(secp
        .verify_ecdsa(&message_digest(message)?, &sig, public_key)
        .is_ok())
}

/// Verify raw key and signature bytes; anything malformed is simply `false`
pub fn verify_raw(public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    match PublicKey::from_slice(public_key) {
        Ok(key) => verify_signature(&key, message, signature).unwrap_or(false),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_pair_generation() {
        let kp = KeyPair::generate();
        assert_eq!(kp.private_key_hex().len(), 64);
        assert_eq!(kp.public_key_hex().len(), 66);
        assert!(!kp.address().is_empty());
    }

    #[test]
    fn test_sign_and_verify() {
        let kp = KeyPair::generate();
        let message = b"abc:0:2024-01-01T00:00:00Z";

        let signature = kp.sign(message).unwrap();
        assert!(kp.verify(message, &signature).unwrap());
        assert!(!kp.verify(b"another message", &signature).unwrap());
    }

    #[test]
    fn test_verify_raw_rejects_garbage() {
        let kp = KeyPair::generate();
        let signature = kp.sign(b"msg").unwrap();
        assert!(verify_raw(&kp.public_key_bytes(), b"msg", &signature));
        assert!(!verify_raw(b"not a key", b"msg", &signature));
        assert!(!verify_raw(&kp.public_key_bytes(), b"msg", b"short"));
    }

    #[test]
    fn test_key_pair_from_hex() {
        let kp1 = KeyPair::generate();
        let kp2 = KeyPair::from_private_key_hex(&kp1.private_key_hex()).unwrap();
        assert_eq!(kp1.public_key_hex(), kp2.public_key_hex());
        assert_eq!(kp1.address(), kp2.address());
        assert!(KeyPair::from_private_key_hex("zz").is_err());
    }

    #[test]
    fn test_address_format() {
        let kp = KeyPair::generate();
        let address = kp.address();
        assert!(address.starts_with('1'));
        assert_eq!(
            address_from_public_key_hex(&kp.public_key_hex()).unwrap(),
            address
        );
    }
}
