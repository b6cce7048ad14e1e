//! Wallet implementation for the ledger
//!
//! Provides key management and payment creation.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{Amount, Blockchain, Transaction, TransactionError, UTXO};
use crate::crypto::{KeyError, KeyPair, Signer};

/// Wallet-related errors
#[derive(Error, Debug)]
pub enum WalletError {
    #[error("Transaction error: {0}")]
    TransactionError(#[from] TransactionError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Crypto error: {0}")]
    CryptoError(#[from] KeyError),
}

/// Serializable wallet data for persistence
#[derive(Debug, Serialize, Deserialize)]
struct WalletData {
    private_key_hex: String,
    address: String,
    label: Option<String>,
}

/// A key pair with an optional label
pub struct Wallet {
    key_pair: KeyPair,
    pub label: Option<String>,
}

impl Wallet {
    /// Create a new wallet with a fresh key pair
    pub fn new() -> Self {
        Self {
            key_pair: KeyPair::generate(),
            label: None,
        }
    }

    pub fn with_label(label: &str) -> Self {
        Self {
            key_pair: KeyPair::generate(),
            label: Some(label.to_string()),
        }
    }

    /// Import a wallet from a private key
    pub fn from_private_key(private_key_hex: &str) -> Result<Self, WalletError> {
        Ok(Self {
            key_pair: KeyPair::from_private_key_hex(private_key_hex)?,
            label: None,
        })
    }

    /// Get the wallet's public key (hex)
    pub fn public_key(&self) -> String {
        self.key_pair.public_key_hex()
    }

    /// Get the wallet's private key (hex)
    /// WARNING: Keep this secret!
    pub fn private_key(&self) -> String {
        self.key_pair.private_key_hex()
    }

    pub fn balance(&self, blockchain: &Blockchain) -> Amount {
        blockchain.get_balance(&self.address())
    }

    /// Get UTXOs owned by this wallet
    pub fn utxos(&self, blockchain: &Blockchain) -> Vec<UTXO> {
        blockchain.get_utxos(&self.address())
    }

    /// Build and sign a payment without submitting it
    pub fn create_transaction(
        &self,
        blockchain: &Blockchain,
        recipient: &str,
        amount: Amount,
        fee: Amount,
    ) -> Result<Transaction, WalletError> {
        Ok(blockchain.create_transaction(self, recipient, amount, fee)?)
    }

    /// Pay `amount` to `recipient` and put the payment in the mempool.
    /// Returns the transaction id.
    pub fn send(
        &self,
        blockchain: &mut Blockchain,
        recipient: &str,
        amount: Amount,
        fee: Amount,
    ) -> Result<String, WalletError> {
        let tx = self.create_transaction(blockchain, recipient, amount, fee)?;
        Ok(blockchain.add_transaction(tx)?)
    }

    /// Save wallet to file
    pub fn save(&self, path: &Path) -> Result<(), WalletError> {
        let data = WalletData {
            private_key_hex: self.private_key(),
            address: self.address(),
            label: self.label.clone(),
        };

        let json = serde_json::to_string_pretty(&data)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Load wallet from file
    pub fn load(path: &Path) -> Result<Self, WalletError> {
        let json = fs::read_to_string(path)?;
        let data: WalletData = serde_json::from_str(&json)?;

        let mut wallet = Self::from_private_key(&data.private_key_hex)?;
        wallet.label = data.label;
        Ok(wallet)
    }

    /// Export wallet info (without private key)
    pub fn export_public_info(&self) -> WalletInfo {
        WalletInfo {
            address: self.address(),
            public_key: self.public_key(),
            label: self.label.clone(),
        }
    }
}

impl Signer for Wallet {
    fn address(&self) -> String {
        self.key_pair.address()
    }

    fn public_key_hex(&self) -> String {
        self.key_pair.public_key_hex()
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, KeyError> {
        self.key_pair.sign(message)
    }
}

impl Default for Wallet {
    fn default() -> Self {
        Self::new()
    }
}

/// Public wallet information (safe to share)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletInfo {
    pub address: String,
    pub public_key: String,
    pub label: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{BLOCK_SUBSIDY, COIN};

    #[test]
    fn test_wallet_creation() {
        let wallet = Wallet::new();
        assert!(wallet.address().starts_with('1'));
        assert_eq!(wallet.public_key().len(), 66);
        assert_eq!(wallet.private_key().len(), 64);
    }

    #[test]
    fn test_wallet_import() {
        let wallet1 = Wallet::new();
        let wallet2 = Wallet::from_private_key(&wallet1.private_key()).unwrap();
        assert_eq!(wallet1.address(), wallet2.address());
        assert!(Wallet::from_private_key("zz").is_err());
    }

    #[test]
    fn test_wallet_save_load() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("test_wallet.json");

        let wallet1 = Wallet::with_label("Test Wallet");
        wallet1.save(&path).unwrap();

        let wallet2 = Wallet::load(&path).unwrap();
        assert_eq!(wallet1.address(), wallet2.address());
        assert_eq!(wallet1.label, wallet2.label);
        assert_eq!(wallet2.export_public_info().public_key, wallet1.public_key());
    }

    #[test]
    fn test_send() {
        let mut blockchain = Blockchain::with_difficulty(1);
        let alice = Wallet::with_label("alice");
        let bob = Wallet::with_label("bob");

        blockchain.mine_block(&alice.address()).unwrap();
        assert_eq!(alice.balance(&blockchain), BLOCK_SUBSIDY);
        assert_eq!(alice.utxos(&blockchain).len(), 1);

        let id = alice
            .send(&mut blockchain, &bob.address(), COIN, 1_000)
            .unwrap();
        assert!(blockchain.mempool().contains(&id));

        blockchain.mine_block(&alice.address()).unwrap();
        assert_eq!(bob.balance(&blockchain), COIN);
        assert_eq!(
            alice.balance(&blockchain),
            2 * BLOCK_SUBSIDY - COIN
        );
    }

    #[test]
    fn test_send_insufficient_funds() {
        let mut blockchain = Blockchain::with_difficulty(1);
        let alice = Wallet::new();
        let err = alice
            .send(&mut blockchain, "bob", COIN, 0)
            .unwrap_err();
        assert!(matches!(
            err,
            WalletError::TransactionError(TransactionError::InsufficientFunds { have: 0, .. })
        ));
    }
}
