//! Block validity rules, split by how much chain context they need.

use crate::blockchain::core::block::Block;
use crate::coins::Coin;
use crate::error::Rejection;
use crate::params::ChainParams;
use crate::pow::check_proof_of_work;
use crate::script::{coinbase_height_script, p2sh_sigop_count, sigop_count};
use crate::transaction::{check_transaction, is_final_tx, Transaction};
use crate::verify::ScriptFlags;
use std::collections::HashSet;

type Verdict = std::result::Result<(), Rejection>;

/// Legacy signature-operation count of a transaction: every script, worst
/// case for multisig.
pub fn legacy_sigops(tx: &Transaction) -> u64 {
    let inputs: u32 = tx.inputs.iter().map(|i| sigop_count(&i.script_sig, false)).sum();
    let outputs: u32 = tx.outputs.iter().map(|o| sigop_count(&o.script_pubkey, false)).sum();
    u64::from(inputs) + u64::from(outputs)
}

/// Legacy count plus the redeem scripts of pay-to-script-hash inputs.
pub fn accurate_sigops(tx: &Transaction, spent: &[Coin], p2sh: bool) -> u64 {
    let mut count = legacy_sigops(tx);
    if p2sh && !tx.is_coinbase() {
        for (input, coin) in tx.inputs.iter().zip(spent) {
            count += u64::from(p2sh_sigop_count(&coin.script_pubkey, &input.script_sig));
        }
    }
    count
}

/// Checks that need no chain context: proof of work, timestamp skew,
/// merkle commitment, size and sigop ceilings and per-transaction sanity.
pub fn check_block(block: &Block, params: &ChainParams, now: i64) -> Verdict {
    let header = &block.header;

    if !check_proof_of_work(&block.hash(), header.bits, params.pow_limit_bits) {
        return Err(Rejection::invalid("high-hash", 50));
    }
    if i64::from(header.time) > now + params.max_future_block_time {
        return Err(Rejection::invalid("time-too-new", 0));
    }

    let (root, mutated) = block.compute_merkle_root();
    if root != header.merkle_root {
        return Err(Rejection::invalid("bad-txnmrklroot", 100));
    }
    if mutated {
        return Err(Rejection::invalid("bad-txns-duplicate", 100));
    }

    if block.transactions.is_empty() || block.size() as u64 > params.max_block_size_any() {
        return Err(Rejection::invalid("bad-blk-length", 100));
    }

    match block.transactions.first() {
        Some(tx) if tx.is_coinbase() => {}
        _ => return Err(Rejection::invalid("bad-cb-missing", 100)),
    }
    if block.transactions[1..].iter().any(Transaction::is_coinbase) {
        return Err(Rejection::invalid("bad-cb-multiple", 100));
    }

    let mut sigops: u64 = 0;
    let mut spent = HashSet::new();
    for tx in &block.transactions {
        check_transaction(tx, params.limits.max_tx_size)?;
        sigops += legacy_sigops(tx);
        if !tx.is_coinbase() {
            for input in &tx.inputs {
                if !spent.insert(input.prevout) {
                    return Err(Rejection::invalid("bad-txns-inputs-duplicate", 100));
                }
            }
        }
    }
    if sigops > params.max_block_sigops(params.max_block_size_any()) {
        return Err(Rejection::invalid("bad-blk-sigops", 100));
    }

    Ok(())
}

/// Header rules that depend on the parent: difficulty, median-time-past and
/// version floors of the height-activated soft forks.
pub fn check_header_context(
    block: &Block,
    height: u32,
    expected_bits: u32,
    parent_mtp: i64,
    params: &ChainParams,
) -> Verdict {
    let header = &block.header;
    if header.bits != expected_bits {
        return Err(Rejection::invalid("bad-diffbits", 100));
    }
    if i64::from(header.time) <= parent_mtp {
        return Err(Rejection::invalid("time-too-old", 100));
    }

    let obsolete = (header.version < 2 && height >= params.bip34_height)
        || (header.version < 3 && height >= params.bip66_height)
        || (header.version < 4 && height >= params.bip65_height);
    if obsolete {
        return Err(Rejection::obsolete(
            format!("bad-version(0x{:08x})", header.version),
            0,
        ));
    }
    Ok(())
}

/// Transaction-list rules that depend on the height: finality, coinbase
/// height commitment, canonical ordering and the size window.
pub fn check_block_context(
    block: &Block,
    height: u32,
    lock_time_cutoff: i64,
    params: &ChainParams,
) -> Verdict {
    for tx in &block.transactions {
        if !is_final_tx(tx, height, lock_time_cutoff) {
            return Err(Rejection::invalid("bad-txns-nonfinal", 10));
        }
    }

    if height >= params.bip34_height {
        let expected = coinbase_height_script(height);
        let script_sig = &block.transactions[0].inputs[0].script_sig;
        if !script_sig.starts_with(&expected) {
            return Err(Rejection::invalid("bad-cb-height", 100));
        }
    }

    let size = block.size() as u64;
    if size > params.max_block_size(height) {
        return Err(Rejection::invalid("bad-blk-length", 100));
    }

    if height >= params.canonical_ordering_height {
        let mut previous: Option<[u8; 32]> = None;
        for tx in &block.transactions[1..] {
            let txid = tx.txid();
            if let Some(prev) = previous {
                if txid == prev {
                    return Err(Rejection::invalid("tx-duplicate", 100));
                }
                if txid < prev {
                    return Err(Rejection::invalid("tx-ordering", 100));
                }
            }
            previous = Some(txid);
        }

        for tx in &block.transactions {
            if tx.size() < params.limits.min_tx_size {
                return Err(Rejection::invalid("bad-txns-undersize", 100));
            }
        }
    }

    Ok(())
}

/// Accurate signature-operation limits, evaluated once the spent coins are
/// known.
pub fn check_block_sigops(
    block: &Block,
    spent: &[Vec<Coin>],
    height: u32,
    params: &ChainParams,
) -> Verdict {
    let p2sh = height >= params.bip16_height;
    let mut total: u64 = 0;
    for (tx, coins) in block.transactions.iter().zip(spent) {
        let count = accurate_sigops(tx, coins, p2sh);
        if count > params.limits.max_tx_sigops {
            return Err(Rejection::invalid("bad-txn-sigops", 100));
        }
        total += count;
    }
    if total > params.max_block_sigops(block.size() as u64) {
        return Err(Rejection::invalid("bad-blk-sigops", 100));
    }
    Ok(())
}

/// Script rules enforced for a block at `height`.
pub fn script_flags(height: u32, csv_active: bool, params: &ChainParams) -> ScriptFlags {
    let mut flags = ScriptFlags::NONE;
    if height >= params.bip16_height {
        flags |= ScriptFlags::P2SH;
    }
    if height >= params.bip66_height {
        flags |= ScriptFlags::DERSIG;
    }
    if height >= params.bip65_height {
        flags |= ScriptFlags::CHECKLOCKTIMEVERIFY;
    }
    if csv_active {
        flags |= ScriptFlags::CHECKSEQUENCEVERIFY;
    }
    if height >= params.size_fork_height {
        flags |= ScriptFlags::STRICTENC | ScriptFlags::SIGHASH_FORKID;
    }
    flags
}
