use crate::error::{ChainError, Result};
use serde::{Deserialize, Serialize};

/// Running totals over the connected chain. Genesis outputs are not part of
/// the coin set, so a fresh chain starts at zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainState {
    pub tx_count: u64,
    pub coin_count: u64,
    pub value: i64,
}

/// Net change applied by one connected block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainStateDelta {
    pub tx_count: i64,
    pub coin_count: i64,
    pub value: i64,
}

impl ChainStateDelta {
    pub fn add_coin(&mut self, value: i64) -> Result<()> {
        self.coin_count = self.coin_count.checked_add(1).ok_or_else(|| overflow("coin_count"))?;
        self.value = self.value.checked_add(value).ok_or_else(|| overflow("value"))?;
        Ok(())
    }

    pub fn spend_coin(&mut self, value: i64) -> Result<()> {
        self.coin_count = self.coin_count.checked_sub(1).ok_or_else(|| overflow("coin_count"))?;
        self.value = self.value.checked_sub(value).ok_or_else(|| overflow("value"))?;
        Ok(())
    }

    fn negated(&self) -> Result<Self> {
        Ok(ChainStateDelta {
            tx_count: self.tx_count.checked_neg().ok_or_else(|| overflow("tx_count"))?,
            coin_count: self.coin_count.checked_neg().ok_or_else(|| overflow("coin_count"))?,
            value: self.value.checked_neg().ok_or_else(|| overflow("value"))?,
        })
    }
}

impl ChainState {
    pub fn apply(&self, delta: &ChainStateDelta) -> Result<ChainState> {
        let tx_count = self
            .tx_count
            .checked_add_signed(delta.tx_count)
            .ok_or_else(|| underflow("tx_count"))?;
        let coin_count = self
            .coin_count
            .checked_add_signed(delta.coin_count)
            .ok_or_else(|| underflow("coin_count"))?;
        let value = self
            .value
            .checked_add(delta.value)
            .filter(|v| *v >= 0)
            .ok_or_else(|| underflow("value"))?;
        Ok(ChainState {
            tx_count,
            coin_count,
            value,
        })
    }

    pub fn revert(&self, delta: &ChainStateDelta) -> Result<ChainState> {
        self.apply(&delta.negated()?)
    }
}

fn underflow(field: &str) -> ChainError {
    ChainError::Corrupt(format!("chain state {} out of range", field))
}

fn overflow(field: &str) -> ChainError {
    ChainError::Corrupt(format!("block delta {} overflowed", field))
}
