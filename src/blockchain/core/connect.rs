//! Connecting and disconnecting blocks at the active tip.

use crate::blockchain::core::block::Block;
use crate::blockchain::core::chain::Chain;
use crate::blockchain::core::validation::{check_block_sigops, script_flags};
use crate::chaindb::ChainBatch;
use crate::coins::{BlockUndo, Coin, CoinView};
use crate::error::{ChainError, Rejection, Result};
use crate::events::ChainEvent;
use crate::index::Entry;
use crate::transaction::calculate_sequence_locks;
use crate::verify::ScriptCheck;
use std::sync::Arc;
use tracing::{info, warn};

impl Chain {
    /// Validates `block` against the coin set and makes `entry` the active
    /// tip. With `store` the entry and block are written in the same batch
    /// and the entry is indexed after the commit.
    pub(crate) fn connect_block(&mut self, entry: &Entry, block: &Arc<Block>, store: bool) -> Result<()> {
        let params = self.params.clone();
        let parent = self.tip.clone();
        if entry.prev_hash != parent.hash {
            return Err(ChainError::Corrupt(format!(
                "{} does not extend the active tip",
                entry.hash_str()
            )));
        }
        let height = entry.height;
        let csv_active = self.csv_active(&parent)?;

        let db = self.db.clone();
        let mut view = CoinView::new(&db);
        let outcome = view.apply(
            block,
            height,
            &params,
            height >= params.canonical_ordering_height,
        )?;

        if csv_active {
            let parent_mtp = self.index.median_time_past(&parent);
            for (tx, spent) in block.transactions.iter().zip(&outcome.spent).skip(1) {
                let heights: Vec<u32> = spent.iter().map(|coin| coin.height).collect();
                let lock = calculate_sequence_locks(tx, true, &heights, |at| {
                    self.index
                        .get_ancestor(&parent, at)
                        .map(|ancestor| self.index.median_time_past(ancestor))
                        .ok_or_else(|| {
                            ChainError::Corrupt(format!("no ancestor at height {}", at))
                        })
                })?;
                if !lock.is_satisfied(height, parent_mtp) {
                    return Err(Rejection::invalid("bad-txns-nonfinal", 10).into());
                }
            }
        }

        check_block_sigops(block, &outcome.spent, height, &params)?;

        let flags = script_flags(height, csv_active, &params);
        let checks: Vec<ScriptCheck<'_>> = block
            .transactions
            .iter()
            .zip(&outcome.spent)
            .skip(1)
            .flat_map(|(tx, coins)| {
                coins.iter().enumerate().map(move |(input, coin)| ScriptCheck {
                    tx,
                    input,
                    coin,
                    flags,
                })
            })
            .collect();
        self.scripts.run(self.verifier.as_ref(), &checks)?;

        let changes = view.into_changes();
        let undo = BlockUndo {
            spent: changes.undo,
            delta: outcome.delta,
        };
        let state = self.state.apply(&undo.delta)?;

        let mut batch = ChainBatch::new();
        if store {
            batch.put_entry(entry)?;
            batch.put_block(entry.hash, block.clone())?;
            batch.remove_tip(&entry.prev_hash);
            batch.add_tip(&entry.hash);
        }
        for coin in changes.puts {
            batch.put_coin(coin)?;
        }
        for outpoint in &changes.deletes {
            batch.delete_coin(outpoint);
        }
        batch.put_undo(&entry.hash, &undo)?;
        batch.set_state(&state)?;
        batch.set_best(&entry.hash);
        self.stage_deployments(&mut batch)?;

        if let Err(err) = self.db.commit(batch) {
            warn!("Failed to commit block {}: {}", entry.hash_str(), err);
            return Err(err);
        }

        self.deployments.clear_pending();
        if store {
            self.index.insert(entry.clone())?;
        }
        self.active.push(entry.hash);
        self.tip = entry.clone();
        self.state = state;
        self.checkpoints.update_watermark(height);

        info!(
            "Connected block {} at height {} ({} txs, {} fees)",
            entry.hash_str(),
            height,
            block.transactions.len(),
            outcome.fees
        );
        self.notify(&ChainEvent::Connect {
            entry: entry.clone(),
            block: block.clone(),
        });
        Ok(())
    }

    /// Reverses the active tip using its undo record and returns the
    /// disconnected entry. The entry and block stay indexed as a branch.
    pub fn disconnect_tip(&mut self) -> Result<Entry> {
        let entry = self.tip.clone();
        if entry.is_genesis() {
            return Err(ChainError::Corrupt("cannot disconnect genesis".to_string()));
        }
        let parent = self.index.entry(&entry.prev_hash)?.clone();
        let block = self.db.require_block(&entry.hash)?;
        let undo = self.db.get_undo(&entry.hash)?.ok_or_else(|| {
            ChainError::Corrupt(format!("undo record for {} missing", entry.hash_str()))
        })?;

        let db = self.db.clone();
        let mut view = CoinView::new(&db);
        for coin in undo.spent.iter().rev() {
            view.restore(coin.clone())?;
        }
        for tx in block.transactions.iter().rev() {
            let txid = tx.txid();
            for index in (0..tx.outputs.len() as u32).rev() {
                if let Some(coin) = Coin::from_output(tx, txid, index, entry.height) {
                    view.remove(&coin)?;
                }
            }
        }
        let changes = view.into_changes();
        let state = self.state.revert(&undo.delta)?;

        let mut batch = ChainBatch::new();
        for coin in changes.puts {
            batch.put_coin(coin)?;
        }
        for outpoint in &changes.deletes {
            batch.delete_coin(outpoint);
        }
        batch.delete_undo(&entry.hash);
        batch.set_state(&state)?;
        batch.set_best(&parent.hash);

        if let Err(err) = self.db.commit(batch) {
            warn!("Failed to commit disconnect of {}: {}", entry.hash_str(), err);
            return Err(err);
        }

        self.active.pop();
        self.tip = parent;
        self.state = state;
        self.checkpoints.update_watermark(self.tip.height);

        info!("Disconnected block {} at height {}", entry.hash_str(), entry.height);
        self.notify(&ChainEvent::Disconnect {
            entry: entry.clone(),
            block,
        });
        Ok(entry)
    }
}
