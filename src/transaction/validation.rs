/// Context-free and lock-time validation for transactions
use crate::consensus::{
    money_range, LOCKTIME_THRESHOLD, MAX_COINBASE_SCRIPT_SIZE, MIN_COINBASE_SCRIPT_SIZE,
    SEQUENCE_FINAL, SEQUENCE_LOCKTIME_DISABLE_FLAG, SEQUENCE_LOCKTIME_GRANULARITY,
    SEQUENCE_LOCKTIME_MASK, SEQUENCE_LOCKTIME_TYPE_FLAG,
};
use crate::error::{Rejection, Result};
use crate::transaction::types::Transaction;
use std::collections::HashSet;

/// Checks that need nothing but the transaction itself.
pub fn check_transaction(tx: &Transaction, max_tx_size: usize) -> std::result::Result<(), Rejection> {
    if tx.inputs.is_empty() {
        return Err(Rejection::invalid("bad-txns-vin-empty", 10));
    }
    if tx.outputs.is_empty() {
        return Err(Rejection::invalid("bad-txns-vout-empty", 10));
    }
    if tx.size() > max_tx_size {
        return Err(Rejection::invalid("bad-txns-oversize", 100));
    }

    let mut total: i64 = 0;
    for output in &tx.outputs {
        if output.value < 0 {
            return Err(Rejection::invalid("bad-txns-vout-negative", 100));
        }
        if !money_range(output.value) {
            return Err(Rejection::invalid("bad-txns-vout-toolarge", 100));
        }
        total = match total.checked_add(output.value) {
            Some(sum) if money_range(sum) => sum,
            _ => return Err(Rejection::invalid("bad-txns-txouttotal-toolarge", 100)),
        };
    }

    let mut seen = HashSet::with_capacity(tx.inputs.len());
    for input in &tx.inputs {
        if !seen.insert(input.prevout) {
            return Err(Rejection::invalid("bad-txns-inputs-duplicate", 100));
        }
    }

    if tx.is_coinbase() {
        let len = tx.inputs[0].script_sig.len();
        if !(MIN_COINBASE_SCRIPT_SIZE..=MAX_COINBASE_SCRIPT_SIZE).contains(&len) {
            return Err(Rejection::invalid("bad-cb-length", 100));
        }
    } else if tx.inputs.iter().any(|input| input.prevout.is_null()) {
        return Err(Rejection::invalid("bad-txns-prevout-null", 10));
    }

    Ok(())
}

/// Absolute lock-time finality at the given height and cutoff time.
pub fn is_final_tx(tx: &Transaction, height: u32, cutoff_time: i64) -> bool {
    if tx.lock_time == 0 {
        return true;
    }
    let threshold = if tx.lock_time < LOCKTIME_THRESHOLD {
        i64::from(height)
    } else {
        cutoff_time
    };
    if i64::from(tx.lock_time) < threshold {
        return true;
    }
    tx.inputs.iter().all(|input| input.sequence == SEQUENCE_FINAL)
}

/// Earliest height and time (exclusive) at which a transaction's relative
/// locks are all satisfied. `-1` means unconstrained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceLock {
    pub min_height: i64,
    pub min_time: i64,
}

impl SequenceLock {
    pub const NONE: SequenceLock = SequenceLock {
        min_height: -1,
        min_time: -1,
    };

    /// Whether a block at `height`, whose parent has median-time-past
    /// `parent_mtp`, may include the transaction.
    pub fn is_satisfied(&self, height: u32, parent_mtp: i64) -> bool {
        self.min_height < i64::from(height) && self.min_time < parent_mtp
    }
}

/// Computes relative lock-time constraints.
///
/// `prev_heights[i]` is the creation height of the coin spent by input `i`.
/// `mtp_at(h)` returns the median-time-past of the ancestor at height `h` on
/// the chain being validated.
pub fn calculate_sequence_locks<F>(
    tx: &Transaction,
    enforce: bool,
    prev_heights: &[u32],
    mut mtp_at: F,
) -> Result<SequenceLock>
where
    F: FnMut(u32) -> Result<i64>,
{
    let mut lock = SequenceLock::NONE;

    if !enforce || tx.version < 2 || tx.is_coinbase() {
        return Ok(lock);
    }

    for (input, &coin_height) in tx.inputs.iter().zip(prev_heights) {
        if input.sequence & SEQUENCE_LOCKTIME_DISABLE_FLAG != 0 {
            continue;
        }
        let masked = i64::from(input.sequence & SEQUENCE_LOCKTIME_MASK);
        if input.sequence & SEQUENCE_LOCKTIME_TYPE_FLAG != 0 {
            let coin_time = mtp_at(coin_height.saturating_sub(1))?;
            let min_time = coin_time + (masked << SEQUENCE_LOCKTIME_GRANULARITY) - 1;
            lock.min_time = lock.min_time.max(min_time);
        } else {
            let min_height = i64::from(coin_height) + masked - 1;
            lock.min_height = lock.min_height.max(min_height);
        }
    }

    Ok(lock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::types::{OutPoint, TxIn, TxOut};

    fn spend(sequence: u32, version: i32, lock_time: u32) -> Transaction {
        Transaction {
            version,
            inputs: vec![TxIn {
                prevout: OutPoint::new([1u8; 32], 0),
                script_sig: vec![0x51],
                sequence,
            }],
            outputs: vec![TxOut {
                value: 1_000,
                script_pubkey: vec![0x51],
            }],
            lock_time,
        }
    }

    #[test]
    fn rejects_duplicate_inputs() {
        let mut tx = spend(0, 1, 0);
        tx.inputs.push(tx.inputs[0].clone());
        let err = check_transaction(&tx, 1_000_000).unwrap_err();
        assert_eq!(err.reason, "bad-txns-inputs-duplicate");
    }

    #[test]
    fn rejects_negative_and_oversized_outputs() {
        let mut tx = spend(0, 1, 0);
        tx.outputs[0].value = -1;
        assert_eq!(check_transaction(&tx, 1_000_000).unwrap_err().reason, "bad-txns-vout-negative");

        let tx = spend(0, 1, 0);
        assert_eq!(check_transaction(&tx, 10).unwrap_err().reason, "bad-txns-oversize");
    }

    #[test]
    fn lock_time_by_height_and_time() {
        let tx = spend(0, 1, 100);
        assert!(!is_final_tx(&tx, 100, 0));
        assert!(is_final_tx(&tx, 101, 0));

        let tx = spend(0, 1, LOCKTIME_THRESHOLD + 10);
        assert!(!is_final_tx(&tx, 1, i64::from(LOCKTIME_THRESHOLD) + 10));
        assert!(is_final_tx(&tx, 1, i64::from(LOCKTIME_THRESHOLD) + 11));

        let tx = spend(SEQUENCE_FINAL, 1, 100);
        assert!(is_final_tx(&tx, 1, 0));
    }

    #[test]
    fn relative_height_lock() {
        let tx = spend(5, 2, 0);
        let lock = calculate_sequence_locks(&tx, true, &[102], |_| Ok(0)).unwrap();
        assert_eq!(lock.min_height, 106);
        assert!(!lock.is_satisfied(106, 0));
        assert!(lock.is_satisfied(107, 0));
    }

    #[test]
    fn relative_time_lock_uses_coin_parent_mtp() {
        let tx = spend(SEQUENCE_LOCKTIME_TYPE_FLAG | 2, 2, 0);
        let lock = calculate_sequence_locks(&tx, true, &[50], |h| {
            assert_eq!(h, 49);
            Ok(10_000)
        })
        .unwrap();
        assert_eq!(lock.min_time, 10_000 + 1024 - 1);
        assert!(!lock.is_satisfied(60, 11_023));
        assert!(lock.is_satisfied(60, 11_024));
    }

    #[test]
    fn version_one_and_disabled_inputs_are_unconstrained() {
        let tx = spend(5, 1, 0);
        assert_eq!(calculate_sequence_locks(&tx, true, &[10], |_| Ok(0)).unwrap(), SequenceLock::NONE);

        let tx = spend(SEQUENCE_LOCKTIME_DISABLE_FLAG | 5, 2, 0);
        assert_eq!(calculate_sequence_locks(&tx, true, &[10], |_| Ok(0)).unwrap(), SequenceLock::NONE);

        let tx = spend(5, 2, 0);
        assert_eq!(calculate_sequence_locks(&tx, false, &[10], |_| Ok(0)).unwrap(), SequenceLock::NONE);
    }
}
