//! Transaction handling for the ledger
//!
//! Implements a UTXO-based transaction model with digital signatures.
//! - amounts are integer base units ([`COIN`] units per coin)
//! - a transaction with no inputs is a coinbase
//! - the id is a SHA-256 over inputs, outputs, timestamp and contracts,
//!   so signing an input changes the id
//! - contracts ride along as an optional list and are checked by
//!   validation

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::utxo::{OutPoint, UTXO};
use crate::contract::{ScriptContext, SmartContract};
use crate::crypto::{public_key_from_hex, sha256, sha256_hex, verify_signature, Signer};
use crate::mining::mempool::MempoolError;

// =============================================================================
// Constants
// =============================================================================

/// Value in base units
pub type Amount = u64;

/// Base units per coin
pub const COIN: Amount = 100_000_000;

/// Prefix of output recipients locked by a contract
pub const CONTRACT_ADDRESS_PREFIX: &str = "contract:";

// =============================================================================
// Error Types
// =============================================================================

/// Reasons a transaction is rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("Transaction has no outputs")]
    NoOutputs,
    #[error("Output {0}: amount must be positive")]
    NonPositiveOutput(usize),
    #[error("Coinbase must have exactly one output, found {0}")]
    CoinbaseOutputCount(usize),
    #[error("Coinbase transactions are only valid inside a block")]
    CoinbaseNotAllowed,
    #[error("Input {index}: UTXO not found ({outpoint})")]
    UtxoNotFound { index: usize, outpoint: OutPoint },
    #[error("Double spend in same transaction: {0}")]
    DuplicateInput(OutPoint),
    #[error("Input {0}: Invalid signature")]
    InvalidSignature(usize),
    #[error("Input {0}: public key does not own the referenced output")]
    NotOwner(usize),
    #[error("Insufficient funds: {have} < {need}")]
    InsufficientFunds { have: Amount, need: Amount },
    #[error("Amount overflow")]
    AmountOverflow,
    #[error("Smart contract {0} validation failed")]
    ContractFailed(usize),
    #[error("Transaction id does not match its contents")]
    IdMismatch,
    #[error("Output {0} already exists and is unspent")]
    OutputExists(OutPoint),
    #[error("Input index {0} out of range")]
    InputIndexOutOfRange(usize),
    #[error("Signing failed: {0}")]
    Signing(String),
    #[error(transparent)]
    Mempool(#[from] MempoolError),
}

// =============================================================================
// Transaction Input
// =============================================================================

/// Transaction input (reference to previous output)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransactionInput {
    /// Transaction ID of the previous transaction
    pub tx_id: String,
    /// Index of the output in the previous transaction
    pub output_index: u32,
    /// Hex signature, empty until signed
    #[serde(default)]
    pub signature: String,
    /// Hex public key of the signer, empty until signed
    #[serde(default)]
    pub public_key: String,
}

impl TransactionInput {
    /// An unsigned input spending `tx_id:output_index`
    pub fn new(tx_id: &str, output_index: u32) -> Self {
        Self {
            tx_id: tx_id.to_string(),
            output_index,
            signature: String::new(),
            public_key: String::new(),
        }
    }

    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.tx_id.clone(), self.output_index)
    }

    pub fn is_signed(&self) -> bool {
        !self.signature.is_empty() && !self.public_key.is_empty()
    }
}

// =============================================================================
// Transaction Output
// =============================================================================

/// Transaction output
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransactionOutput {
    pub amount: Amount,
    pub recipient: String,
}

impl TransactionOutput {
    pub fn new(amount: Amount, recipient: &str) -> Self {
        Self {
            amount,
            recipient: recipient.to_string(),
        }
    }

    /// Check if this output belongs to the given address
    pub fn is_owned_by(&self, address: &str) -> bool {
        self.recipient == address
    }
}

// =============================================================================
// Transaction
// =============================================================================

/// A ledger transaction
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    /// Hash of the transaction contents
    pub id: String,
    pub inputs: Vec<TransactionInput>,
    pub outputs: Vec<TransactionOutput>,
    pub timestamp: DateTime<Utc>,
    /// Spend conditions checked during validation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contracts: Vec<SmartContract>,
}

// Field order here fixes the hash input.
#[derive(Serialize)]
struct HashedFields<'a> {
    inputs: &'a [TransactionInput],
    outputs: &'a [TransactionOutput],
    timestamp: &'a DateTime<Utc>,
    contracts: &'a [SmartContract],
}

#[derive(Serialize)]
struct DigestFields<'a> {
    inputs: Vec<&'a OutPoint>,
    outputs: &'a [TransactionOutput],
    timestamp: &'a DateTime<Utc>,
}

impl Transaction {
    /// Create a new unsigned transaction stamped with the current time
    pub fn new(inputs: Vec<TransactionInput>, outputs: Vec<TransactionOutput>) -> Self {
        Self::with_timestamp(inputs, outputs, Utc::now())
    }

    pub fn with_timestamp(
        inputs: Vec<TransactionInput>,
        outputs: Vec<TransactionOutput>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let mut tx = Self {
            id: String::new(),
            inputs,
            outputs,
            timestamp,
            contracts: Vec::new(),
        };
        tx.id = tx.calculate_hash();
        tx
    }

    /// Create a coinbase (mining reward) transaction
    pub fn coinbase(recipient: &str, amount: Amount) -> Self {
        Self::coinbase_at(recipient, amount, Utc::now())
    }

    pub fn coinbase_at(recipient: &str, amount: Amount, timestamp: DateTime<Utc>) -> Self {
        Self::with_timestamp(
            Vec::new(),
            vec![TransactionOutput::new(amount, recipient)],
            timestamp,
        )
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Hash over inputs, outputs, timestamp and contracts
    pub fn calculate_hash(&self) -> String {
        let fields = HashedFields {
            inputs: &self.inputs,
            outputs: &self.outputs,
            timestamp: &self.timestamp,
            contracts: &self.contracts,
        };
        sha256_hex(&serde_json::to_vec(&fields).unwrap_or_default())
    }

    /// Whether the stored id matches the contents
    pub fn has_valid_id(&self) -> bool {
        self.id == self.calculate_hash()
    }

    /// Message signed for the input spending `utxo`
    pub fn signing_message(&self, utxo: &UTXO) -> String {
        format!(
            "{}:{}:{}",
            utxo.tx_id,
            utxo.output_index,
            self.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true)
        )
    }

    /// Sign input `input_index`, which spends `utxo`, then refresh the id
    pub fn sign<S: Signer + ?Sized>(
        &mut self,
        input_index: usize,
        signer: &S,
        utxo: &UTXO,
    ) -> Result<(), TransactionError> {
        if input_index >= self.inputs.len() {
            return Err(TransactionError::InputIndexOutOfRange(input_index));
        }

        let message = self.signing_message(utxo);
        let signature = signer
            .sign(message.as_bytes())
            .map_err(|e| TransactionError::Signing(e.to_string()))?;

        let input = &mut self.inputs[input_index];
        input.signature = hex::encode(signature);
        input.public_key = signer.public_key_hex();

        self.id = self.calculate_hash();
        Ok(())
    }

    /// Check the stored signature of input `input_index` against `utxo`.
    /// Malformed keys or signatures are `false`.
    pub fn verify_signature(&self, input_index: usize, utxo: &UTXO) -> bool {
        let Some(input) = self.inputs.get(input_index) else {
            return false;
        };
        if !input.is_signed() {
            return false;
        }

        let Ok(public_key) = public_key_from_hex(&input.public_key) else {
            return false;
        };
        let Ok(signature) = hex::decode(&input.signature) else {
            return false;
        };

        let message = self.signing_message(utxo);
        verify_signature(&public_key, message.as_bytes(), &signature).unwrap_or(false)
    }

    /// Get total output amount, `None` on overflow
    pub fn total_output(&self) -> Option<Amount> {
        self.outputs
            .iter()
            .try_fold(0 as Amount, |acc, o| acc.checked_add(o.amount))
    }

    pub fn outpoints(&self) -> impl Iterator<Item = OutPoint> + '_ {
        self.inputs.iter().map(|i| i.outpoint())
    }

    // =========================================================================
    // Contracts
    // =========================================================================

    /// Digest that contract signatures commit to.
    ///
    /// Covers the spent outpoints, outputs and timestamp but not input
    /// signatures or contracts, so unlocking scripts can be filled in
    /// after signing.
    pub fn contract_digest(&self) -> Vec<u8> {
        let outpoints: Vec<OutPoint> = self.outpoints().collect();
        let fields = DigestFields {
            inputs: outpoints.iter().collect(),
            outputs: &self.outputs,
            timestamp: &self.timestamp,
        };
        sha256(&serde_json::to_vec(&fields).unwrap_or_default())
    }

    /// Context a contract on this transaction runs with.
    /// Lock time is the transaction's own timestamp in Unix seconds.
    pub fn script_context(&self) -> ScriptContext {
        ScriptContext::new(
            self.contract_digest(),
            self.timestamp.timestamp().max(0) as u64,
        )
    }

    /// Add an output locked by `contract`, returning its index
    pub fn add_contract_output(&mut self, amount: Amount, contract: SmartContract) -> usize {
        let recipient = format!(
            "{}{}",
            CONTRACT_ADDRESS_PREFIX,
            contract.locking_script.to_hex()
        );
        self.outputs.push(TransactionOutput::new(amount, &recipient));
        self.contracts.push(contract);
        self.id = self.calculate_hash();
        self.outputs.len() - 1
    }

    /// Attach an unlocking script to contract `index`
    pub fn set_unlocking_script(
        &mut self,
        index: usize,
        script: crate::contract::Script,
    ) -> Result<(), TransactionError> {
        let contract = self
            .contracts
            .get_mut(index)
            .ok_or(TransactionError::ContractFailed(index))?;
        contract.unlocking_script = script;
        self.id = self.calculate_hash();
        Ok(())
    }

    pub fn has_contracts(&self) -> bool {
        !self.contracts.is_empty()
    }

    /// Run every attached contract
    pub fn validate_contracts(&self) -> Result<(), TransactionError> {
        let context = self.script_context();
        for (index, contract) in self.contracts.iter().enumerate() {
            if !contract.validate(&context) {
                return Err(TransactionError::ContractFailed(index));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    fn owned_utxo(owner: &KeyPair, amount: Amount) -> UTXO {
        UTXO {
            tx_id: sha256_hex(b"funding"),
            output_index: 0,
            amount,
            recipient: owner.address(),
            is_coinbase: true,
        }
    }

    fn spend(utxo: &UTXO, to: &str, amount: Amount) -> Transaction {
        Transaction::new(
            vec![TransactionInput::new(&utxo.tx_id, utxo.output_index)],
            vec![TransactionOutput::new(amount, to)],
        )
    }

    #[test]
    fn test_coinbase_shape() {
        let tx = Transaction::coinbase("miner", 625_000_000);
        assert!(tx.is_coinbase());
        assert_eq!(tx.outputs.len(), 1);
        assert_eq!(tx.total_output(), Some(625_000_000));
        assert!(tx.has_valid_id());
    }

    #[test]
    fn test_sign_changes_id_and_verifies() {
        let kp = KeyPair::generate();
        let utxo = owned_utxo(&kp, 10 * COIN);
        let mut tx = spend(&utxo, "bob", 5 * COIN);
        let unsigned_id = tx.id.clone();

        tx.sign(0, &kp, &utxo).unwrap();
        assert_ne!(tx.id, unsigned_id);
        assert!(tx.has_valid_id());
        assert!(tx.verify_signature(0, &utxo));
    }

    #[test]
    fn test_verify_fails_for_other_utxo() {
        let kp = KeyPair::generate();
        let utxo = owned_utxo(&kp, 10 * COIN);
        let mut tx = spend(&utxo, "bob", 5 * COIN);
        tx.sign(0, &kp, &utxo).unwrap();

        let mut other = utxo.clone();
        other.output_index = 1;
        assert!(!tx.verify_signature(0, &other));
    }

    #[test]
    fn test_verify_malformed_is_false() {
        let kp = KeyPair::generate();
        let utxo = owned_utxo(&kp, COIN);
        let mut tx = spend(&utxo, "bob", COIN);
        assert!(!tx.verify_signature(0, &utxo));
        assert!(!tx.verify_signature(5, &utxo));

        tx.sign(0, &kp, &utxo).unwrap();
        tx.inputs[0].signature = "not-hex".to_string();
        assert!(!tx.verify_signature(0, &utxo));

        tx.sign(0, &kp, &utxo).unwrap();
        tx.inputs[0].public_key = "02abcd".to_string();
        assert!(!tx.verify_signature(0, &utxo));
    }

    #[test]
    fn test_sign_out_of_range() {
        let kp = KeyPair::generate();
        let utxo = owned_utxo(&kp, COIN);
        let mut tx = spend(&utxo, "bob", COIN);
        assert_eq!(
            tx.sign(3, &kp, &utxo),
            Err(TransactionError::InputIndexOutOfRange(3))
        );
    }

    #[test]
    fn test_serde_roundtrip_preserves_id() {
        let kp = KeyPair::generate();
        let utxo = owned_utxo(&kp, COIN);
        let mut tx = spend(&utxo, "bob", COIN / 2);
        tx.sign(0, &kp, &utxo).unwrap();

        let json = serde_json::to_string(&tx).unwrap();
        let back: Transaction = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tx);
        assert_eq!(back.calculate_hash(), tx.id);
        assert!(back.verify_signature(0, &utxo));
    }

    #[test]
    fn test_tampering_breaks_id() {
        let mut tx = Transaction::coinbase("miner", 50);
        tx.outputs[0].amount = 51;
        assert!(!tx.has_valid_id());
    }

    #[test]
    fn test_contract_output_and_validation() {
        let owner = KeyPair::generate();
        let mut tx = Transaction::new(
            vec![TransactionInput::new(&sha256_hex(b"prev"), 0)],
            vec![TransactionOutput::new(COIN, "change")],
        );
        let index = tx.add_contract_output(
            2 * COIN,
            SmartContract::p2pkh(&owner.public_key_hash()),
        );
        assert_eq!(index, 1);
        assert!(tx.outputs[1].recipient.starts_with(CONTRACT_ADDRESS_PREFIX));
        assert_eq!(tx.validate_contracts(), Err(TransactionError::ContractFailed(0)));

        let sig = owner.sign(&tx.contract_digest()).unwrap();
        tx.set_unlocking_script(0, SmartContract::p2pkh_unlock(&sig, &owner.public_key_bytes()))
            .unwrap();
        assert!(tx.has_valid_id());
        assert_eq!(tx.validate_contracts(), Ok(()));
    }
}
