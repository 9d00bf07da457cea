//! Compact difficulty targets, chainwork and retargeting.

use crate::error::{ChainError, Result};
use crate::hash::Sha256Hash;
use crate::index::{Entry, EntryIndex};
use crate::params::ChainParams;
use primitive_types::U256;

/// Decoded compact target with the sign and overflow flags of the encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub value: U256,
    pub negative: bool,
    pub overflow: bool,
}

impl Target {
    pub fn is_valid(&self) -> bool {
        !self.negative && !self.overflow && !self.value.is_zero()
    }
}

pub fn compact_to_target(bits: u32) -> Target {
    let size = bits >> 24;
    let word = bits & 0x007f_ffff;

    let overflow = word != 0
        && (size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32));
    let negative = word != 0 && (bits & 0x0080_0000) != 0;

    let value = if size <= 3 {
        U256::from(word >> (8 * (3 - size)))
    } else if overflow {
        U256::zero()
    } else {
        U256::from(word) << ((8 * (size - 3)) as usize)
    };

    Target {
        value,
        negative,
        overflow,
    }
}

pub fn target_to_compact(target: U256) -> u32 {
    let mut size = (target.bits() as u32 + 7) / 8;
    let mut compact = if size <= 3 {
        (target.low_u64() << (8 * (3 - size))) as u32
    } else {
        (target >> ((8 * (size - 3)) as usize)).low_u64() as u32
    };
    if compact & 0x0080_0000 != 0 {
        compact >>= 8;
        size += 1;
    }
    compact | (size << 24)
}

/// Expected number of hashes needed to meet `bits`: `2^256 / (target + 1)`.
pub fn block_proof(bits: u32) -> U256 {
    let target = compact_to_target(bits);
    if !target.is_valid() {
        return U256::zero();
    }
    (!target.value / (target.value + U256::one())) + U256::one()
}

pub fn hash_to_u256(hash: &Sha256Hash) -> U256 {
    U256::from_little_endian(hash)
}

/// Whether `hash` satisfies `bits` and `bits` is within the network limit.
pub fn check_proof_of_work(hash: &Sha256Hash, bits: u32, pow_limit_bits: u32) -> bool {
    let target = compact_to_target(bits);
    if !target.is_valid() {
        return false;
    }
    if target.value > compact_to_target(pow_limit_bits).value {
        return false;
    }
    hash_to_u256(hash) <= target.value
}

/// Interval retarget with the actual timespan clamped to a factor of four.
pub fn calculate_next_bits(
    params: &ChainParams,
    last_bits: u32,
    first_time: u32,
    last_time: u32,
) -> u32 {
    if params.no_retargeting {
        return last_bits;
    }
    let timespan = i64::from(params.target_timespan);
    let actual = (i64::from(last_time) - i64::from(first_time)).clamp(timespan / 4, timespan * 4);

    let limit = compact_to_target(params.pow_limit_bits).value;
    let target = compact_to_target(last_bits).value;
    let (scaled, overflow) = target.overflowing_mul(U256::from(actual as u64));
    let next = if overflow {
        limit
    } else {
        (scaled / U256::from(timespan as u64)).min(limit)
    };
    target_to_compact(next)
}

/// Source of the difficulty a child of `parent` must declare.
pub trait Retarget: Send + Sync {
    fn next_bits(
        &self,
        index: &EntryIndex,
        parent: &Entry,
        time: u32,
        params: &ChainParams,
    ) -> Result<u32>;
}

/// Bitcoin-style retargeting every `target_timespan / target_spacing` blocks,
/// with the testnet minimum-difficulty exception when enabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultRetarget;

impl Retarget for DefaultRetarget {
    fn next_bits(
        &self,
        index: &EntryIndex,
        parent: &Entry,
        time: u32,
        params: &ChainParams,
    ) -> Result<u32> {
        let interval = params.retarget_interval();
        let height = parent.height + 1;

        if height % interval != 0 {
            if params.allow_min_difficulty {
                if i64::from(time) > i64::from(parent.time) + 2 * i64::from(params.target_spacing) {
                    return Ok(params.pow_limit_bits);
                }
                // Last block that was not a minimum-difficulty exception.
                let mut walk = parent;
                while walk.height % interval != 0 && walk.bits == params.pow_limit_bits {
                    match index.get(&walk.prev_hash) {
                        Some(prev) => walk = prev,
                        None => break,
                    }
                }
                return Ok(walk.bits);
            }
            return Ok(parent.bits);
        }

        if params.no_retargeting {
            return Ok(parent.bits);
        }

        let first = index
            .get_ancestor(parent, parent.height - (interval - 1))
            .ok_or_else(|| {
                ChainError::Corrupt(format!(
                    "missing retarget ancestor below height {}",
                    parent.height
                ))
            })?;

        Ok(calculate_next_bits(params, parent.bits, first.time, parent.time))
    }
}
