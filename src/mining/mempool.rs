//! Transaction pool (mempool) for pending transactions
//!
//! Holds validated, not yet mined transactions in arrival order. The pool
//! itself only enforces uniqueness and the cross-transaction double-spend
//! rule; full validation happens in the chain before admission.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::core::transaction::{Amount, Transaction};
use crate::core::utxo::OutPoint;

// =============================================================================
// Error Types
// =============================================================================

/// Mempool errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MempoolError {
    #[error("Transaction {0} already in mempool")]
    Duplicate(String),
    #[error("Double spend attempt in mempool: {outpoint} already spent by {conflicting_tx}")]
    DoubleSpend {
        outpoint: OutPoint,
        conflicting_tx: String,
    },
}

// =============================================================================
// Mempool Entry
// =============================================================================

/// Entry in the mempool with metadata
#[derive(Debug, Clone)]
pub struct MempoolEntry {
    pub tx: Transaction,
    /// Fee computed at admission
    pub fee: Amount,
    pub added_at: DateTime<Utc>,
}

/// Mempool statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MempoolStats {
    pub tx_count: usize,
    pub total_fees: Amount,
    pub spent_outpoints: usize,
}

// =============================================================================
// Mempool
// =============================================================================

/// Memory pool for pending transactions
#[derive(Debug, Default, Clone)]
pub struct Mempool {
    /// Transactions indexed by ID
    entries: HashMap<String, MempoolEntry>,
    /// Transaction IDs in order of arrival
    order: Vec<String>,
    /// Outpoint -> id of the pending transaction spending it
    spent: HashMap<OutPoint, String>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Which pending transaction, if any, spends `outpoint`
    pub fn spender_of(&self, outpoint: &OutPoint) -> Option<&str> {
        self.spent.get(outpoint).map(String::as_str)
    }

    /// Reject `tx` if it is already pending or spends a pending input
    pub fn check_conflicts(&self, tx: &Transaction) -> Result<(), MempoolError> {
        if self.entries.contains_key(&tx.id) {
            return Err(MempoolError::Duplicate(tx.id.clone()));
        }
        for outpoint in tx.outpoints() {
            if let Some(other) = self.spent.get(&outpoint) {
                return Err(MempoolError::DoubleSpend {
                    outpoint,
                    conflicting_tx: other.clone(),
                });
            }
        }
        Ok(())
    }

    /// Admit an already validated transaction
    pub fn add(&mut self, tx: Transaction, fee: Amount) -> Result<(), MempoolError> {
        self.check_conflicts(&tx)?;

        for outpoint in tx.outpoints() {
            self.spent.insert(outpoint, tx.id.clone());
        }
        self.order.push(tx.id.clone());
        self.entries.insert(
            tx.id.clone(),
            MempoolEntry {
                tx,
                fee,
                added_at: Utc::now(),
            },
        );
        Ok(())
    }

    pub fn contains(&self, tx_id: &str) -> bool {
        self.entries.contains_key(tx_id)
    }

    pub fn get(&self, tx_id: &str) -> Option<&Transaction> {
        self.entries.get(tx_id).map(|e| &e.tx)
    }

    pub fn entry(&self, tx_id: &str) -> Option<&MempoolEntry> {
        self.entries.get(tx_id)
    }

    /// Pending transactions in arrival order
    pub fn transactions(&self) -> Vec<Transaction> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id))
            .map(|e| e.tx.clone())
            .collect()
    }

    pub fn ids(&self) -> &[String] {
        &self.order
    }

    /// Sum of admission fees
    pub fn total_fees(&self) -> Amount {
        self.entries.values().map(|e| e.fee).sum()
    }

    /// Remove a transaction by id
    pub fn remove(&mut self, tx_id: &str) -> Option<Transaction> {
        let entry = self.entries.remove(tx_id)?;
        self.order.retain(|id| id != tx_id);
        for outpoint in entry.tx.outpoints() {
            if self.spent.get(&outpoint).map(String::as_str) == Some(tx_id) {
                self.spent.remove(&outpoint);
            }
        }
        Some(entry.tx)
    }

    /// Drop transactions confirmed by a block, and any pending transaction
    /// spending an output the block consumed.
    pub fn remove_confirmed(&mut self, confirmed: &[Transaction]) -> usize {
        let mut doomed: HashSet<String> = HashSet::new();
        for tx in confirmed {
            if self.entries.contains_key(&tx.id) {
                doomed.insert(tx.id.clone());
            }
            for outpoint in tx.outpoints() {
                if let Some(spender) = self.spent.get(&outpoint) {
                    doomed.insert(spender.clone());
                }
            }
        }

        for id in &doomed {
            self.remove(id);
        }
        doomed.len()
    }

    /// Take every pending transaction, leaving the pool empty
    pub fn drain(&mut self) -> Vec<Transaction> {
        let txs = self.transactions();
        self.clear();
        txs
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
        self.spent.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> MempoolStats {
        MempoolStats {
            tx_count: self.entries.len(),
            total_fees: self.total_fees(),
            spent_outpoints: self.spent.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transaction::{TransactionInput, TransactionOutput};

    fn spending(prev: &str, index: u32, to: &str) -> Transaction {
        Transaction::new(
            vec![TransactionInput::new(prev, index)],
            vec![TransactionOutput::new(1, to)],
        )
    }

    #[test]
    fn test_add_and_order() {
        let mut pool = Mempool::new();
        let a = spending("aa", 0, "x");
        let b = spending("bb", 0, "y");
        pool.add(a.clone(), 3).unwrap();
        pool.add(b.clone(), 4).unwrap();

        assert_eq!(pool.len(), 2);
        assert_eq!(pool.total_fees(), 7);
        assert_eq!(pool.transactions(), vec![a.clone(), b]);
        assert_eq!(pool.spender_of(&OutPoint::new("aa", 0)), Some(a.id.as_str()));
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut pool = Mempool::new();
        let a = spending("aa", 0, "x");
        pool.add(a.clone(), 1).unwrap();
        assert_eq!(pool.add(a.clone(), 1), Err(MempoolError::Duplicate(a.id)));
    }

    #[test]
    fn test_double_spend_rejected() {
        let mut pool = Mempool::new();
        let first = spending("aa", 0, "x");
        let second = spending("aa", 0, "y");
        pool.add(first.clone(), 1).unwrap();

        let err = pool.add(second, 1).unwrap_err();
        assert_eq!(
            err,
            MempoolError::DoubleSpend {
                outpoint: OutPoint::new("aa", 0),
                conflicting_tx: first.id,
            }
        );
        assert!(err.to_string().starts_with("Double spend attempt in mempool"));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_remove_confirmed_drops_conflicts() {
        let mut pool = Mempool::new();
        let pending = spending("aa", 0, "x");
        let unrelated = spending("bb", 0, "y");
        pool.add(pending.clone(), 1).unwrap();
        pool.add(unrelated.clone(), 1).unwrap();

        // A different transaction spending the same output got mined
        let mined = spending("aa", 0, "z");
        assert_eq!(pool.remove_confirmed(&[mined]), 1);
        assert!(!pool.contains(&pending.id));
        assert!(pool.contains(&unrelated.id));
        assert!(pool.spender_of(&OutPoint::new("aa", 0)).is_none());
    }

    #[test]
    fn test_drain_empties_pool() {
        let mut pool = Mempool::new();
        pool.add(spending("aa", 0, "x"), 1).unwrap();
        let drained = pool.drain();
        assert_eq!(drained.len(), 1);
        assert!(pool.is_empty());
        assert_eq!(pool.stats().spent_outpoints, 0);
    }
}
