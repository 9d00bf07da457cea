//! Unspent outputs and the copy-on-write view used to validate a block.
//!
//! A [`CoinView`] buffers every spend and creation of one block on top of a
//! [`CoinSource`] (normally the chain database). Nothing reaches storage
//! until the owner turns the view into [`CoinChanges`] and commits them;
//! dropping the view discards the block's effect.

use crate::blockchain::{Block, ChainStateDelta};
use crate::consensus::money_range;
use crate::error::{ChainError, Rejection, Result};
use crate::hash::Sha256Hash;
use crate::params::ChainParams;
use crate::script::is_unspendable;
use crate::transaction::{OutPoint, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub outpoint: OutPoint,
    pub value: i64,
    pub script_pubkey: Vec<u8>,
    pub height: u32,
    pub coinbase: bool,
}

impl Coin {
    /// Coins created by output `index` of `tx`, mined at `height`.
    pub fn from_output(tx: &Transaction, txid: Sha256Hash, index: u32, height: u32) -> Option<Coin> {
        let output = tx.outputs.get(index as usize)?;
        if is_unspendable(&output.script_pubkey) {
            return None;
        }
        Some(Coin {
            outpoint: OutPoint::new(txid, index),
            value: output.value,
            script_pubkey: output.script_pubkey.clone(),
            height,
            coinbase: tx.is_coinbase(),
        })
    }

    /// Whether a coinbase coin can be spent by a block at `spend_height`.
    pub fn is_mature(&self, spend_height: u32, maturity: u32) -> bool {
        !self.coinbase || spend_height.saturating_sub(self.height) >= maturity
    }
}

/// Read access to the committed coin set.
pub trait CoinSource {
    fn fetch_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>>;
}

/// Everything a block spent, in spend order, plus the totals it changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockUndo {
    pub spent: Vec<Coin>,
    pub delta: ChainStateDelta,
}

#[derive(Debug, Clone)]
enum CoinEntry {
    /// `fresh` coins do not exist in the source, so spending one inside the
    /// view leaves no trace in storage.
    Live { coin: Coin, fresh: bool },
    Spent,
}

/// Net durable writes produced by a view.
#[derive(Debug, Clone, Default)]
pub struct CoinChanges {
    pub puts: Vec<Coin>,
    pub deletes: Vec<OutPoint>,
    pub undo: Vec<Coin>,
}

/// Result of applying a block to a view.
#[derive(Debug, Clone, Default)]
pub struct ApplyOutcome {
    pub fees: i64,
    /// Coins spent by each transaction, indexed like the block's
    /// transactions. The coinbase entry is empty.
    pub spent: Vec<Vec<Coin>>,
    pub delta: ChainStateDelta,
}

pub struct CoinView<'a> {
    source: &'a dyn CoinSource,
    entries: HashMap<OutPoint, CoinEntry>,
    undo: Vec<Coin>,
}

impl<'a> CoinView<'a> {
    pub fn new(source: &'a dyn CoinSource) -> Self {
        CoinView {
            source,
            entries: HashMap::new(),
            undo: Vec::new(),
        }
    }

    fn lookup(&self, outpoint: &OutPoint) -> Result<Option<Coin>> {
        match self.entries.get(outpoint) {
            Some(CoinEntry::Live { coin, .. }) => Ok(Some(coin.clone())),
            Some(CoinEntry::Spent) => Ok(None),
            None => self.source.fetch_coin(outpoint),
        }
    }

    pub fn get_coin(&self, outpoint: &OutPoint) -> Result<Coin> {
        self.lookup(outpoint)?
            .ok_or(ChainError::MissingCoin(*outpoint))
    }

    pub fn has_coin(&self, outpoint: &OutPoint) -> Result<bool> {
        Ok(self.lookup(outpoint)?.is_some())
    }

    /// Spends a coin, recording it for undo.
    pub fn spend(&mut self, outpoint: &OutPoint) -> Result<Coin> {
        let coin = self.get_coin(outpoint)?;
        self.forget(outpoint);
        self.undo.push(coin.clone());
        Ok(coin)
    }

    /// Adds a freshly created output. Overwriting an unspent coin is the
    /// duplicate-transaction case and is rejected.
    pub fn add_coin(&mut self, coin: Coin) -> Result<()> {
        let outpoint = coin.outpoint;
        let fresh = match self.entries.get(&outpoint) {
            Some(CoinEntry::Live { .. }) => return Err(Rejection::invalid("bad-txns-BIP30", 100).into()),
            Some(CoinEntry::Spent) => false,
            None => {
                if self.source.fetch_coin(&outpoint)?.is_some() {
                    return Err(Rejection::invalid("bad-txns-BIP30", 100).into());
                }
                true
            }
        };
        self.entries.insert(outpoint, CoinEntry::Live { coin, fresh });
        Ok(())
    }

    /// Puts a coin from an undo record back into the set.
    pub fn restore(&mut self, coin: Coin) -> Result<()> {
        if self.has_coin(&coin.outpoint)? {
            return Err(ChainError::Corrupt(format!(
                "undo would overwrite unspent coin {}",
                coin.outpoint
            )));
        }
        self.entries
            .insert(coin.outpoint, CoinEntry::Live { coin, fresh: false });
        Ok(())
    }

    /// Removes an output created by a block being disconnected. The stored
    /// coin must match what the block created.
    pub fn remove(&mut self, expected: &Coin) -> Result<()> {
        let current = self.lookup(&expected.outpoint)?.ok_or_else(|| {
            ChainError::Corrupt(format!("output {} missing on disconnect", expected.outpoint))
        })?;
        if current.value != expected.value || current.script_pubkey != expected.script_pubkey {
            return Err(ChainError::Corrupt(format!(
                "output {} does not match the disconnected block",
                expected.outpoint
            )));
        }
        self.forget(&expected.outpoint);
        Ok(())
    }

    fn forget(&mut self, outpoint: &OutPoint) {
        match self.entries.get(outpoint) {
            Some(CoinEntry::Live { fresh: true, .. }) => {
                self.entries.remove(outpoint);
            }
            _ => {
                self.entries.insert(*outpoint, CoinEntry::Spent);
            }
        }
    }

    fn add_outputs(&mut self, tx: &Transaction, height: u32, delta: &mut ChainStateDelta) -> Result<()> {
        let txid = tx.txid();
        for index in 0..tx.outputs.len() as u32 {
            if let Some(coin) = Coin::from_output(tx, txid, index, height) {
                delta.add_coin(coin.value)?;
                self.add_coin(coin)?;
            }
        }
        Ok(())
    }

    /// Spends the inputs and creates the outputs of every transaction in
    /// `block`, enforcing maturity and value conservation.
    ///
    /// With `outputs_first` all outputs are created before any input is
    /// spent, so a transaction may spend an output of one that sorts after it.
    pub fn apply(
        &mut self,
        block: &Block,
        height: u32,
        params: &ChainParams,
        outputs_first: bool,
    ) -> Result<ApplyOutcome> {
        let mut outcome = ApplyOutcome {
            spent: Vec::with_capacity(block.transactions.len()),
            ..Default::default()
        };
        outcome.delta.tx_count = block.transactions.len() as i64;

        if outputs_first {
            for tx in &block.transactions {
                self.add_outputs(tx, height, &mut outcome.delta)?;
            }
        }

        for tx in &block.transactions {
            let mut spent = Vec::new();
            if !tx.is_coinbase() {
                let mut value_in: i64 = 0;
                for input in &tx.inputs {
                    let coin = match self.spend(&input.prevout) {
                        Ok(coin) => coin,
                        Err(ChainError::MissingCoin(_)) => {
                            return Err(Rejection::invalid("bad-txns-inputs-missingorspent", 100).into())
                        }
                        Err(err) => return Err(err),
                    };
                    if !coin.is_mature(height, params.coinbase_maturity) {
                        return Err(Rejection::invalid("bad-txns-premature-spend-of-coinbase", 0).into());
                    }
                    value_in = value_in
                        .checked_add(coin.value)
                        .filter(|v| money_range(coin.value) && money_range(*v))
                        .ok_or_else(|| Rejection::invalid("bad-txns-inputvalues-outofrange", 100))?;
                    outcome.delta.spend_coin(coin.value)?;
                    spent.push(coin);
                }

                let value_out = tx
                    .value_out()
                    .ok_or_else(|| Rejection::invalid("bad-txns-txouttotal-toolarge", 100))?;
                if value_in < value_out {
                    return Err(Rejection::invalid("bad-txns-in-belowout", 100).into());
                }
                outcome.fees = outcome
                    .fees
                    .checked_add(value_in - value_out)
                    .filter(|fees| money_range(*fees))
                    .ok_or_else(|| Rejection::invalid("bad-txns-fee-outofrange", 100))?;
            }
            if !outputs_first {
                self.add_outputs(tx, height, &mut outcome.delta)?;
            }
            outcome.spent.push(spent);
        }

        let coinbase_out = block
            .transactions
            .first()
            .and_then(Transaction::value_out)
            .ok_or_else(|| Rejection::invalid("bad-cb-missing", 100))?;
        if coinbase_out > outcome.fees + params.subsidy(height) {
            return Err(Rejection::invalid("bad-cb-amount", 100).into());
        }

        Ok(outcome)
    }

    /// Net writes and the spend log, consuming the view.
    pub fn into_changes(self) -> CoinChanges {
        let mut changes = CoinChanges {
            undo: self.undo,
            ..Default::default()
        };
        for (outpoint, entry) in self.entries {
            match entry {
                CoinEntry::Live { coin, .. } => changes.puts.push(coin),
                CoinEntry::Spent => changes.deletes.push(outpoint),
            }
        }
        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::BlockHeader;
    use crate::consensus::COIN;
    use crate::hash::ZERO_HASH;
    use crate::transaction::{TxIn, TxOut};

    #[derive(Default)]
    struct MapSource(HashMap<OutPoint, Coin>);

    impl CoinSource for MapSource {
        fn fetch_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>> {
            Ok(self.0.get(outpoint).cloned())
        }
    }

    fn coin(tag: u8, value: i64, height: u32, coinbase: bool) -> Coin {
        Coin {
            outpoint: OutPoint::new([tag; 32], 0),
            value,
            script_pubkey: vec![0x51],
            height,
            coinbase,
        }
    }

    fn coinbase(value: i64) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxIn {
                prevout: OutPoint::NULL,
                script_sig: vec![0x01, 0x02],
                sequence: u32::MAX,
            }],
            outputs: vec![TxOut {
                value,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    fn spend(prevouts: &[OutPoint], value: i64) -> Transaction {
        Transaction {
            version: 1,
            inputs: prevouts
                .iter()
                .map(|prevout| TxIn {
                    prevout: *prevout,
                    script_sig: vec![],
                    sequence: u32::MAX,
                })
                .collect(),
            outputs: vec![TxOut {
                value,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    fn block(transactions: Vec<Transaction>) -> Block {
        Block {
            header: BlockHeader {
                version: 1,
                prev_hash: ZERO_HASH,
                merkle_root: ZERO_HASH,
                time: 0,
                bits: 0,
                nonce: 0,
            },
            transactions,
        }
    }

    fn source_with(coins: &[Coin]) -> MapSource {
        MapSource(coins.iter().map(|c| (c.outpoint, c.clone())).collect())
    }

    #[test]
    fn spend_is_buffered_until_changes_are_taken() {
        let c = coin(1, 10, 5, false);
        let source = source_with(&[c.clone()]);
        let mut view = CoinView::new(&source);

        assert_eq!(view.spend(&c.outpoint).unwrap(), c);
        assert!(matches!(view.get_coin(&c.outpoint), Err(ChainError::MissingCoin(_))));
        assert!(source.0.contains_key(&c.outpoint));

        let changes = view.into_changes();
        assert_eq!(changes.deletes, vec![c.outpoint]);
        assert_eq!(changes.undo, vec![c]);
    }

    #[test]
    fn fresh_coin_spent_in_view_leaves_no_write() {
        let source = MapSource::default();
        let mut view = CoinView::new(&source);
        let c = coin(2, 10, 5, false);
        view.add_coin(c.clone()).unwrap();
        view.spend(&c.outpoint).unwrap();
        let changes = view.into_changes();
        assert!(changes.puts.is_empty());
        assert!(changes.deletes.is_empty());
    }

    #[test]
    fn overwriting_unspent_coin_is_rejected() {
        let c = coin(3, 10, 5, false);
        let source = source_with(&[c.clone()]);
        let mut view = CoinView::new(&source);
        let err = view.add_coin(c).unwrap_err();
        assert_eq!(err.reason(), Some("bad-txns-BIP30"));
    }

    #[test]
    fn apply_enforces_maturity_and_conservation() {
        let params = ChainParams::regtest();
        let mature = coin(4, 10 * COIN, 1, true);
        let source = source_with(&[mature.clone()]);

        let mut view = CoinView::new(&source);
        let err = view
            .apply(&block(vec![coinbase(0), spend(&[mature.outpoint], COIN)]), 100, &params, false)
            .unwrap_err();
        assert_eq!(err.reason(), Some("bad-txns-premature-spend-of-coinbase"));

        let mut view = CoinView::new(&source);
        let err = view
            .apply(&block(vec![coinbase(0), spend(&[mature.outpoint], 11 * COIN)]), 101, &params, false)
            .unwrap_err();
        assert_eq!(err.reason(), Some("bad-txns-in-belowout"));

        let mut view = CoinView::new(&source);
        let outcome = view
            .apply(&block(vec![coinbase(0), spend(&[mature.outpoint], 9 * COIN)]), 101, &params, false)
            .unwrap();
        assert_eq!(outcome.fees, COIN);
        assert_eq!(outcome.spent[1], vec![mature]);
        assert_eq!(outcome.delta.coin_count, 1);
        assert_eq!(outcome.delta.tx_count, 2);
    }

    #[test]
    fn coinbase_may_claim_subsidy_plus_fees_only() {
        let params = ChainParams::regtest();
        let c = coin(5, 10 * COIN, 1, false);
        let source = source_with(&[c.clone()]);
        let subsidy = params.subsidy(10);

        let mut view = CoinView::new(&source);
        view.apply(&block(vec![coinbase(subsidy + COIN), spend(&[c.outpoint], 9 * COIN)]), 10, &params, false)
            .unwrap();

        let mut view = CoinView::new(&source);
        let err = view
            .apply(&block(vec![coinbase(subsidy + COIN + 1), spend(&[c.outpoint], 9 * COIN)]), 10, &params, false)
            .unwrap_err();
        assert_eq!(err.reason(), Some("bad-cb-amount"));
    }

    #[test]
    fn outputs_first_allows_child_before_parent() {
        let params = ChainParams::regtest();
        let c = coin(6, 10 * COIN, 1, false);
        let source = source_with(&[c.clone()]);

        let parent = spend(&[c.outpoint], 9 * COIN);
        let child = spend(&[OutPoint::new(parent.txid(), 0)], 8 * COIN);
        let txs = vec![coinbase(0), child, parent];

        let mut view = CoinView::new(&source);
        let err = view.apply(&block(txs.clone()), 10, &params, false).unwrap_err();
        assert_eq!(err.reason(), Some("bad-txns-inputs-missingorspent"));

        let mut view = CoinView::new(&source);
        let outcome = view.apply(&block(txs), 10, &params, true).unwrap();
        assert_eq!(outcome.fees, 2 * COIN);
    }

    #[test]
    fn restore_and_remove_reverse_apply() {
        let params = ChainParams::regtest();
        let c = coin(7, 10 * COIN, 1, false);
        let mut source = source_with(&[c.clone()]);
        let b = block(vec![coinbase(0), spend(&[c.outpoint], 9 * COIN)]);

        let mut view = CoinView::new(&source);
        view.apply(&b, 10, &params, true).unwrap();
        let changes = view.into_changes();
        for op in &changes.deletes {
            source.0.remove(op);
        }
        for coin in &changes.puts {
            source.0.insert(coin.outpoint, coin.clone());
        }
        assert!(!source.0.contains_key(&c.outpoint));

        let mut view = CoinView::new(&source);
        for spent in changes.undo.iter().rev() {
            view.restore(spent.clone()).unwrap();
        }
        for tx in b.transactions.iter().rev() {
            let txid = tx.txid();
            for index in 0..tx.outputs.len() as u32 {
                if let Some(created) = Coin::from_output(tx, txid, index, 10) {
                    view.remove(&created).unwrap();
                }
            }
        }
        let undo = view.into_changes();
        assert_eq!(undo.puts, vec![c]);
        assert_eq!(undo.deletes.len(), 2);
    }
}
