//! Transaction validation against a UTXO set, kept apart from the type
//! definitions so the chain and the replay path share one rule set.

use std::collections::HashSet;

use super::transaction::{Amount, Transaction, TransactionError};
use super::utxo::UtxoSet;
use crate::crypto::address_from_public_key_hex;

/// Validate `tx` against `utxo_set`, returning the fee it pays.
///
/// Checks run in a fixed order so the first failing rule is the reason
/// reported:
/// 1. outputs are present (zero inputs makes a coinbase)
/// 2. every output amount is positive
/// 3. the id matches the content and its outputs are not already unspent
/// 4. a coinbase has exactly one output and skips the input checks
/// 5. every input exists and none repeats
/// 6. every input is signed by the owner of the output it spends
/// 7. inputs cover outputs
/// 8. attached contracts validate
pub fn validate_transaction(tx: &Transaction, utxo_set: &UtxoSet) -> Result<Amount, TransactionError> {
    if tx.outputs.is_empty() {
        return Err(TransactionError::NoOutputs);
    }

    if let Some(index) = tx.outputs.iter().position(|o| o.amount == 0) {
        return Err(TransactionError::NonPositiveOutput(index));
    }

    if !tx.has_valid_id() {
        return Err(TransactionError::IdMismatch);
    }

    if let Some(outpoint) = utxo_set.existing_output(tx) {
        return Err(TransactionError::OutputExists(outpoint));
    }

    let total_out = tx.total_output().ok_or(TransactionError::AmountOverflow)?;

    if tx.is_coinbase() {
        if tx.outputs.len() != 1 {
            return Err(TransactionError::CoinbaseOutputCount(tx.outputs.len()));
        }
        tx.validate_contracts()?;
        return Ok(0);
    }

    let mut seen = HashSet::new();
    let mut total_in: Amount = 0;

    for (index, input) in tx.inputs.iter().enumerate() {
        let outpoint = input.outpoint();

        let utxo = utxo_set
            .get(&outpoint)
            .ok_or_else(|| TransactionError::UtxoNotFound {
                index,
                outpoint: outpoint.clone(),
            })?;

        if !seen.insert(outpoint.clone()) {
            return Err(TransactionError::DuplicateInput(outpoint));
        }

        if !tx.verify_signature(index, utxo) {
            return Err(TransactionError::InvalidSignature(index));
        }

        match address_from_public_key_hex(&input.public_key) {
            Ok(address) if address == utxo.recipient => {}
            _ => return Err(TransactionError::NotOwner(index)),
        }

        total_in = total_in
            .checked_add(utxo.amount)
            .ok_or(TransactionError::AmountOverflow)?;
    }

    if total_in < total_out {
        return Err(TransactionError::InsufficientFunds {
            have: total_in,
            need: total_out,
        });
    }

    tx.validate_contracts()?;

    Ok(total_in - total_out)
}

/// Fee paid by `tx`, or `None` if an input is missing from `utxo_set`
pub fn transaction_fee(tx: &Transaction, utxo_set: &UtxoSet) -> Option<Amount> {
    if tx.is_coinbase() {
        return Some(0);
    }
    let total_in = tx
        .inputs
        .iter()
        .map(|i| utxo_set.get(&i.outpoint()).map(|u| u.amount))
        .sum::<Option<Amount>>()?;
    total_in.checked_sub(tx.total_output()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::SmartContract;
    use crate::core::transaction::{TransactionInput, TransactionOutput, COIN};
    use crate::core::utxo::OutPoint;
    use crate::crypto::{KeyPair, Signer};

    struct Fixture {
        alice: KeyPair,
        set: UtxoSet,
        funding: Transaction,
    }

    fn fixture() -> Fixture {
        let alice = KeyPair::generate();
        let funding = Transaction::coinbase(&alice.address(), 10 * COIN);
        let mut set = UtxoSet::new();
        set.apply_transaction(&funding);
        Fixture {
            alice,
            set,
            funding,
        }
    }

    fn signed_spend(f: &Fixture, outputs: Vec<TransactionOutput>) -> Transaction {
        let mut tx = Transaction::new(vec![TransactionInput::new(&f.funding.id, 0)], outputs);
        let utxo = f.set.get(&OutPoint::new(f.funding.id.clone(), 0)).unwrap().clone();
        tx.sign(0, &f.alice, &utxo).unwrap();
        tx
    }

    #[test]
    fn test_valid_spend_returns_fee() {
        let f = fixture();
        let tx = signed_spend(
            &f,
            vec![
                TransactionOutput::new(2 * COIN, "bob"),
                TransactionOutput::new(7 * COIN, &f.alice.address()),
            ],
        );
        assert_eq!(validate_transaction(&tx, &f.set), Ok(COIN));
        assert_eq!(transaction_fee(&tx, &f.set), Some(COIN));
    }

    #[test]
    fn test_coinbase_rules() {
        let set = UtxoSet::new();
        let tx = Transaction::coinbase("miner", COIN);
        assert_eq!(validate_transaction(&tx, &set), Ok(0));

        let mut two = Transaction::coinbase("miner", COIN);
        two.outputs.push(TransactionOutput::new(1, "other"));
        two.id = two.calculate_hash();
        assert_eq!(
            validate_transaction(&two, &set),
            Err(TransactionError::CoinbaseOutputCount(2))
        );
    }

    #[test]
    fn test_replayed_coinbase_rejected() {
        let f = fixture();
        assert_eq!(
            validate_transaction(&f.funding, &f.set),
            Err(TransactionError::OutputExists(OutPoint::new(f.funding.id.clone(), 0)))
        );
    }

    #[test]
    fn test_no_outputs_and_zero_amount() {
        let f = fixture();
        let tx = signed_spend(&f, vec![]);
        assert_eq!(validate_transaction(&tx, &f.set), Err(TransactionError::NoOutputs));

        let tx = signed_spend(&f, vec![TransactionOutput::new(0, "bob")]);
        assert_eq!(
            validate_transaction(&tx, &f.set),
            Err(TransactionError::NonPositiveOutput(0))
        );
    }

    #[test]
    fn test_missing_utxo() {
        let f = fixture();
        let tx = Transaction::new(
            vec![TransactionInput::new("deadbeef", 0)],
            vec![TransactionOutput::new(1, "bob")],
        );
        assert!(matches!(
            validate_transaction(&tx, &f.set),
            Err(TransactionError::UtxoNotFound { index: 0, .. })
        ));
    }

    #[test]
    fn test_duplicate_input_in_same_transaction() {
        let f = fixture();
        let utxo = f.set.get(&OutPoint::new(f.funding.id.clone(), 0)).unwrap().clone();
        let mut tx = Transaction::new(
            vec![
                TransactionInput::new(&f.funding.id, 0),
                TransactionInput::new(&f.funding.id, 0),
            ],
            vec![TransactionOutput::new(15 * COIN, "bob")],
        );
        tx.sign(0, &f.alice, &utxo).unwrap();
        tx.sign(1, &f.alice, &utxo).unwrap();
        assert!(matches!(
            validate_transaction(&tx, &f.set),
            Err(TransactionError::DuplicateInput(_))
        ));
    }

    #[test]
    fn test_unsigned_and_foreign_signatures() {
        let f = fixture();
        let unsigned = Transaction::new(
            vec![TransactionInput::new(&f.funding.id, 0)],
            vec![TransactionOutput::new(COIN, "bob")],
        );
        assert_eq!(
            validate_transaction(&unsigned, &f.set),
            Err(TransactionError::InvalidSignature(0))
        );

        let mallory = KeyPair::generate();
        let utxo = f.set.get(&OutPoint::new(f.funding.id.clone(), 0)).unwrap().clone();
        let mut stolen = unsigned.clone();
        stolen.sign(0, &mallory, &utxo).unwrap();
        assert_eq!(
            validate_transaction(&stolen, &f.set),
            Err(TransactionError::NotOwner(0))
        );
    }

    #[test]
    fn test_insufficient_funds() {
        let f = fixture();
        let tx = signed_spend(&f, vec![TransactionOutput::new(11 * COIN, "bob")]);
        let err = validate_transaction(&tx, &f.set).unwrap_err();
        assert_eq!(
            err,
            TransactionError::InsufficientFunds {
                have: 10 * COIN,
                need: 11 * COIN
            }
        );
        assert!(err.to_string().starts_with("Insufficient funds"));
    }

    #[test]
    fn test_failing_contract_rejects() {
        let f = fixture();
        let mut tx = Transaction::new(
            vec![TransactionInput::new(&f.funding.id, 0)],
            vec![TransactionOutput::new(COIN, "bob")],
        );
        tx.add_contract_output(COIN, SmartContract::p2pkh(&[0u8; 20]));
        let utxo = f.set.get(&OutPoint::new(f.funding.id.clone(), 0)).unwrap().clone();
        tx.sign(0, &f.alice, &utxo).unwrap();

        assert_eq!(
            validate_transaction(&tx, &f.set),
            Err(TransactionError::ContractFailed(0))
        );
    }

    #[test]
    fn test_id_mismatch() {
        let f = fixture();
        let mut tx = signed_spend(&f, vec![TransactionOutput::new(COIN, "bob")]);
        tx.outputs[0].amount = 2 * COIN;
        assert_eq!(validate_transaction(&tx, &f.set), Err(TransactionError::IdMismatch));
    }
}
