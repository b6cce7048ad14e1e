//! Smart contracts: a locking script plus the unlocking script that
//! satisfies it.
//!
//! Validation concatenates unlocking then locking bytes into one program
//! and runs it on an empty stack.

use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::contract::opcodes::OpCode;
use crate::contract::script::Script;
use crate::contract::vm::{ScriptContext, VmError, MAX_MULTISIG_KEYS, VM};

/// Errors building a standard contract
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContractError {
    #[error("Multisig needs 1 <= required <= keys <= {max}, got {required} of {keys}")]
    MultisigBounds {
        required: usize,
        keys: usize,
        max: u64,
    },
}

/// A spend condition attached to a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmartContract {
    pub locking_script: Script,
    #[serde(default)]
    pub unlocking_script: Script,
}

impl SmartContract {
    pub fn new(locking_script: Script) -> Self {
        Self {
            locking_script,
            unlocking_script: Script::new(),
        }
    }

    pub fn with_unlocking(mut self, unlocking_script: Script) -> Self {
        self.unlocking_script = unlocking_script;
        self
    }

    /// The combined program that validation runs
    pub fn program(&self) -> Script {
        self.unlocking_script.concat(&self.locking_script)
    }

    /// Run the combined program, surfacing VM errors
    pub fn evaluate(&self, context: &ScriptContext) -> Result<bool, VmError> {
        VM::new(&self.program(), context.clone()).run()
    }

    /// Whether the unlocking script satisfies the locking script.
    /// A malformed script counts as a failed validation.
    pub fn validate(&self, context: &ScriptContext) -> bool {
        match self.evaluate(context) {
            Ok(result) => result,
            Err(e) => {
                warn!("Script execution error: {}", e);
                false
            }
        }
    }

    // =========================================================================
    // Standard contracts
    // =========================================================================

    /// Pay-to-public-key-hash: `DUP HASH160 <pkh> EQUALVERIFY CHECKSIG`
    pub fn p2pkh(public_key_hash: &[u8]) -> Self {
        Self::new(
            Script::new()
                .push_op(OpCode::Dup)
                .push_op(OpCode::Hash160)
                .push_data(public_key_hash)
                .push_op(OpCode::EqualVerify)
                .push_op(OpCode::CheckSig),
        )
    }

    /// M-of-N multisig: `<M> <key_1> .. <key_N> <N> CHECKMULTISIG`.
    /// The counts must fit the VM's limits.
    pub fn multisig(required: usize, public_keys: &[Vec<u8>]) -> Result<Self, ContractError> {
        let keys = public_keys.len();
        if required == 0 || required > keys || keys as u64 > MAX_MULTISIG_KEYS {
            return Err(ContractError::MultisigBounds {
                required,
                keys,
                max: MAX_MULTISIG_KEYS,
            });
        }

        // Both counts are at most MAX_MULTISIG_KEYS, so one byte holds them
        let script = public_keys
            .iter()
            .fold(Script::new().push_data(&[required as u8]), |script, key| {
                script.push_data(key)
            })
            .push_data(&[keys as u8])
            .push_op(OpCode::CheckMultiSig);
        Ok(Self::new(script))
    }

    /// Hashed timelock contract.
    ///
    /// The recipient claims with the preimage of `secret_hash` (HASH160) and
    /// a signature; after `locktime` the sender can reclaim with a
    /// signature alone.
    pub fn htlc(
        secret_hash: &[u8],
        recipient_pkh: &[u8],
        sender_pkh: &[u8],
        locktime: u32,
    ) -> Self {
        let script = Script::new()
            .push_op(OpCode::If)
            .push_op(OpCode::Hash160)
            .push_data(secret_hash)
            .push_op(OpCode::EqualVerify)
            .push_op(OpCode::Dup)
            .push_op(OpCode::Hash160)
            .push_data(recipient_pkh)
            .push_op(OpCode::EqualVerify)
            .push_op(OpCode::CheckSig)
            .push_op(OpCode::Else)
            .push_u32(locktime)
            .push_op(OpCode::CheckLockTimeVerify)
            .push_op(OpCode::Drop)
            .push_op(OpCode::Dup)
            .push_op(OpCode::Hash160)
            .push_data(sender_pkh)
            .push_op(OpCode::EqualVerify)
            .push_op(OpCode::CheckSig)
            .push_op(OpCode::EndIf);
        Self::new(script)
    }

    // =========================================================================
    // Unlocking scripts
    // =========================================================================

    /// `<sig> <pubkey>`
    pub fn p2pkh_unlock(signature: &[u8], public_key: &[u8]) -> Script {
        Script::new().push_data(signature).push_data(public_key)
    }

    /// `<sig_1> .. <sig_M>`, in key order
    pub fn multisig_unlock(signatures: &[Vec<u8>]) -> Script {
        signatures
            .iter()
            .fold(Script::new(), |script, sig| script.push_data(sig))
    }

    /// Claim branch: `<sig> <pubkey> <secret> TRUE`
    pub fn htlc_claim(signature: &[u8], public_key: &[u8], secret: &[u8]) -> Script {
        Script::new()
            .push_data(signature)
            .push_data(public_key)
            .push_data(secret)
            .push_op(OpCode::True)
    }

    /// Refund branch: `<sig> <pubkey> FALSE`
    pub fn htlc_refund(signature: &[u8], public_key: &[u8]) -> Script {
        Script::new()
            .push_data(signature)
            .push_data(public_key)
            .push_op(OpCode::False)
    }
}
