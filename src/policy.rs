//! Fee estimation and UTXO selection. Pure functions, no I/O, integer
//! satoshi arithmetic throughout.

use bitcoin::Amount;

use crate::{error::PolicyError, types::UnspentOutput};

/// Fixed serialized-size overhead of a transaction.
pub const TX_OVERHEAD_BYTES: u64 = 10;

/// Assumed serialized size of one input, signature included.
pub const TX_INPUT_BYTES: u64 = 150;

/// Assumed serialized size of one output.
pub const TX_OUTPUT_BYTES: u64 = 34;

/// Estimates the fee for a transaction with `inputs` inputs and `outputs`
/// outputs at `fee_per_byte`.
///
/// Overflow fails closed: a fee rate large enough to overflow 64-bit satoshi
/// arithmetic is a configuration error, not something to paper over with a
/// fallback constant.
pub fn estimate_fee(
    inputs: usize,
    outputs: usize,
    fee_per_byte: Amount,
) -> Result<Amount, PolicyError> {
    let overflow = || PolicyError::FeeOverflow { inputs, outputs };
    let bytes = (inputs as u64)
        .checked_mul(TX_INPUT_BYTES)
        .and_then(|b| b.checked_add((outputs as u64).checked_mul(TX_OUTPUT_BYTES)?))
        .and_then(|b| b.checked_add(TX_OVERHEAD_BYTES))
        .ok_or_else(overflow)?;
    fee_per_byte.checked_mul(bytes).ok_or_else(overflow)
}

/// Chooses inputs covering `required` from `available`.
///
/// Only outputs with `spendable` set and at least `min_confirmations`
/// confirmations are candidates. Candidates are taken in descending amount
/// order; if any single candidate covers the target, the *smallest* such one
/// is returned alone (keeping large outputs intact for future batches),
/// otherwise candidates accumulate in descending order until the target is
/// covered. Deterministic given the input ordering.
pub fn select_utxos(
    available: &[UnspentOutput],
    required: Amount,
    min_confirmations: u32,
) -> Result<Vec<UnspentOutput>, PolicyError> {
    let mut candidates: Vec<&UnspentOutput> = available
        .iter()
        .filter(|u| u.spendable && u.confirmations >= min_confirmations)
        .collect();
    candidates.sort_by(|a, b| b.amount.cmp(&a.amount));

    if let Some(single) = candidates.iter().filter(|u| u.amount >= required).last() {
        return Ok(vec![(*single).clone()]);
    }

    let mut selected = Vec::new();
    let mut gathered = 0u64;
    for utxo in &candidates {
        selected.push((*utxo).clone());
        gathered = gathered.saturating_add(utxo.amount.to_sat());
        if gathered >= required.to_sat() {
            return Ok(selected);
        }
    }

    Err(PolicyError::InsufficientFunds {
        required,
        available: Amount::from_sat(gathered),
        utxo_count: candidates.len(),
    })
}

#[cfg(test)]
mod test {
    use bitcoin::Txid;

    use super::*;

    fn utxo(n: u64, sats: u64, confirmations: u32, spendable: bool) -> UnspentOutput {
        let txid: Txid = format!("{n:064x}").parse().unwrap();
        UnspentOutput {
            txid,
            vout: 0,
            address: format!("uc1qpool{n}"),
            script_pubkey: "0014ab".to_string(),
            amount: Amount::from_sat(sats),
            confirmations,
            spendable,
            solvable: true,
        }
    }

    const RATE: Amount = Amount::from_sat(850);

    #[test]
    fn fee_follows_byte_formula() {
        // 10 + 150 + 2*34 = 228 bytes
        let fee = estimate_fee(1, 2, RATE).unwrap();
        assert_eq!(fee, Amount::from_sat(228 * 850));

        let fee = estimate_fee(3, 1, RATE).unwrap();
        assert_eq!(fee, Amount::from_sat((10 + 3 * 150 + 34) * 850));
    }

    #[test]
    fn fee_is_pure() {
        assert_eq!(estimate_fee(2, 2, RATE), estimate_fee(2, 2, RATE));
    }

    #[test]
    fn fee_overflow_fails_closed() {
        let err = estimate_fee(1, 1, Amount::MAX).unwrap_err();
        assert_eq!(
            err,
            PolicyError::FeeOverflow {
                inputs: 1,
                outputs: 1
            }
        );
    }

    #[test]
    fn selection_fails_on_empty_set() {
        let err = select_utxos(&[], Amount::from_sat(1), 1).unwrap_err();
        match err {
            PolicyError::InsufficientFunds {
                available,
                utxo_count,
                ..
            } => {
                assert_eq!(available, Amount::ZERO);
                assert_eq!(utxo_count, 0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn selection_ignores_unspendable_and_unconfirmed() {
        let set = [
            utxo(1, 5_000, 0, true),  // unconfirmed
            utxo(2, 5_000, 3, false), // not spendable
            utxo(3, 2_000, 3, true),
        ];
        let got = select_utxos(&set, Amount::from_sat(1_000), 1).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].txid, set[2].txid);
    }

    #[test]
    fn single_cover_prefers_smallest_sufficient() {
        let set = [
            utxo(1, 50_000, 3, true),
            utxo(2, 20_000, 3, true),
            utxo(3, 10_000, 3, true),
        ];
        let got = select_utxos(&set, Amount::from_sat(15_000), 1).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].amount, Amount::from_sat(20_000));
    }

    #[test]
    fn single_cover_takes_exact_match() {
        let set = [utxo(1, 50_000, 3, true), utxo(2, 10_000, 3, true)];
        let got = select_utxos(&set, Amount::from_sat(10_000), 1).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].amount, Amount::from_sat(10_000));
    }

    #[test]
    fn accumulates_descending_until_covered() {
        let set = [
            utxo(1, 8_000, 3, true),
            utxo(2, 10_000, 3, true),
            utxo(3, 9_000, 3, true),
        ];
        let got = select_utxos(&set, Amount::from_sat(12_000), 1).unwrap();
        let amounts: Vec<u64> = got.iter().map(|u| u.amount.to_sat()).collect();
        assert_eq!(amounts, vec![10_000, 9_000]);
    }

    #[test]
    fn shortfall_reports_required_and_available() {
        let set = [utxo(1, 10_000, 3, true), utxo(2, 9_000, 3, true)];
        let err = select_utxos(&set, Amount::from_sat(100_000), 1).unwrap_err();
        assert_eq!(
            err,
            PolicyError::InsufficientFunds {
                required: Amount::from_sat(100_000),
                available: Amount::from_sat(19_000),
                utxo_count: 2,
            }
        );
    }

    #[test]
    fn selection_is_deterministic_for_equal_amounts() {
        let set = [
            utxo(1, 10_000, 3, true),
            utxo(2, 10_000, 3, true),
            utxo(3, 10_000, 3, true),
        ];
        let a = select_utxos(&set, Amount::from_sat(25_000), 1).unwrap();
        let b = select_utxos(&set, Amount::from_sat(25_000), 1).unwrap();
        assert_eq!(a, b);
        // stable sort keeps the supplied order for ties
        assert_eq!(a[0].txid, set[0].txid);
        assert_eq!(a[1].txid, set[1].txid);
    }
}
