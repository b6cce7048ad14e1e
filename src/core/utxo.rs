//! Unspent transaction outputs and the UTXO set
//!
//! The set is keyed by outpoint and keeps a secondary index from address
//! to outpoints so balance and coin-selection queries never scan the
//! whole set.

use std::collections::{HashMap, HashSet};
use std::fmt;

use log::warn;
use serde::{Deserialize, Serialize};

use super::transaction::{Amount, Transaction};

// =============================================================================
// OutPoint
// =============================================================================

/// Reference to one output of one transaction
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub tx_id: String,
    pub output_index: u32,
}

impl OutPoint {
    pub fn new(tx_id: impl Into<String>, output_index: u32) -> Self {
        Self {
            tx_id: tx_id.into(),
            output_index,
        }
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tx_id, self.output_index)
    }
}

// =============================================================================
// UTXO
// =============================================================================

/// Unspent Transaction Output (UTXO)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UTXO {
    pub tx_id: String,
    pub output_index: u32,
    pub amount: Amount,
    pub recipient: String,
    pub is_coinbase: bool,
}

impl UTXO {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.tx_id.clone(), self.output_index)
    }
}

// =============================================================================
// UTXO Set
// =============================================================================

/// All spendable outputs, indexed by outpoint and by owner address
#[derive(Debug, Clone, Default)]
pub struct UtxoSet {
    utxos: HashMap<OutPoint, UTXO>,
    by_address: HashMap<String, HashSet<OutPoint>>,
}

impl UtxoSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an output. An outpoint that is already unspent keeps its
    /// entry and `false` is returned.
    pub fn add(&mut self, utxo: UTXO) -> bool {
        let key = utxo.outpoint();
        if self.utxos.contains_key(&key) {
            return false;
        }
        self.by_address
            .entry(utxo.recipient.clone())
            .or_default()
            .insert(key.clone());
        self.utxos.insert(key, utxo);
        true
    }

    /// Remove a spent output, returning it if it existed
    pub fn remove(&mut self, outpoint: &OutPoint) -> Option<UTXO> {
        let utxo = self.utxos.remove(outpoint)?;
        self.unindex(&utxo.recipient, outpoint);
        Some(utxo)
    }

    fn unindex(&mut self, address: &str, outpoint: &OutPoint) {
        if let Some(keys) = self.by_address.get_mut(address) {
            keys.remove(outpoint);
            if keys.is_empty() {
                self.by_address.remove(address);
            }
        }
    }

    pub fn get(&self, outpoint: &OutPoint) -> Option<&UTXO> {
        self.utxos.get(outpoint)
    }

    pub fn contains(&self, outpoint: &OutPoint) -> bool {
        self.utxos.contains_key(outpoint)
    }

    /// Sum of every output owned by `address`
    pub fn balance(&self, address: &str) -> Amount {
        self.by_address
            .get(address)
            .map(|keys| {
                keys.iter()
                    .filter_map(|k| self.utxos.get(k))
                    .map(|u| u.amount)
                    .sum()
            })
            .unwrap_or(0)
    }

    /// Outputs owned by `address`, largest first
    pub fn utxos_for(&self, address: &str) -> Vec<UTXO> {
        let mut owned: Vec<UTXO> = self
            .by_address
            .get(address)
            .map(|keys| keys.iter().filter_map(|k| self.utxos.get(k)).cloned().collect())
            .unwrap_or_default();
        // Ties are broken by outpoint so selection is reproducible
        owned.sort_by(|a, b| {
            b.amount
                .cmp(&a.amount)
                .then_with(|| a.outpoint().cmp(&b.outpoint()))
        });
        owned
    }

    /// Greedy largest-first coin selection.
    ///
    /// Stops as soon as the running total covers `amount`. When the address
    /// cannot cover it, everything it owns is returned and the caller sees
    /// the shortfall in the total.
    pub fn find_spendable(&self, address: &str, amount: Amount) -> (Vec<UTXO>, Amount) {
        let mut selected = Vec::new();
        let mut total: Amount = 0;

        for utxo in self.utxos_for(address) {
            if total >= amount && !selected.is_empty() {
                break;
            }
            total += utxo.amount;
            selected.push(utxo);
        }

        (selected, total)
    }

    /// Spend the transaction's inputs and create its outputs
    pub fn apply_transaction(&mut self, tx: &Transaction) {
        for input in &tx.inputs {
            self.remove(&OutPoint::new(input.tx_id.clone(), input.output_index));
        }

        let is_coinbase = tx.is_coinbase();
        for (index, output) in tx.outputs.iter().enumerate() {
            let created = self.add(UTXO {
                tx_id: tx.id.clone(),
                output_index: index as u32,
                amount: output.amount,
                recipient: output.recipient.clone(),
                is_coinbase,
            });
            if !created {
                warn!("Output {}:{} already unspent, kept the existing entry", tx.id, index);
            }
        }
    }

    /// First output of `tx` whose outpoint is already unspent
    pub fn existing_output(&self, tx: &Transaction) -> Option<OutPoint> {
        (0..tx.outputs.len() as u32)
            .map(|index| OutPoint::new(tx.id.clone(), index))
            .find(|outpoint| self.contains(outpoint))
    }

    pub fn len(&self) -> usize {
        self.utxos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.utxos.is_empty()
    }

    /// Value held across the whole set
    pub fn total_value(&self) -> Amount {
        self.utxos.values().map(|u| u.amount).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &UTXO> {
        self.utxos.values()
    }
}
