//! Network-independent consensus constants.

/// Base units per coin.
pub const COIN: i64 = 100_000_000;

/// No amount larger than this (in base units) is valid.
pub const MAX_MONEY: i64 = 21_000_000 * COIN;

/// Lock times below this are block heights, above are unix timestamps.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// Sequence value that disables both absolute and relative lock times.
pub const SEQUENCE_FINAL: u32 = 0xffff_ffff;

/// Relative lock time is not enforced for inputs with this bit set.
pub const SEQUENCE_LOCKTIME_DISABLE_FLAG: u32 = 1 << 31;

/// Relative lock time is measured in 512-second units when set, blocks otherwise.
pub const SEQUENCE_LOCKTIME_TYPE_FLAG: u32 = 1 << 22;

pub const SEQUENCE_LOCKTIME_MASK: u32 = 0x0000_ffff;

/// Shift converting the masked sequence value to seconds (2^9 = 512).
pub const SEQUENCE_LOCKTIME_GRANULARITY: u32 = 9;

/// Number of blocks considered by median-time-past.
pub const MEDIAN_TIME_SPAN: usize = 11;

pub const MIN_COINBASE_SCRIPT_SIZE: usize = 2;
pub const MAX_COINBASE_SCRIPT_SIZE: usize = 100;

pub const ONE_MEGABYTE: u64 = 1_000_000;

/// Versionbits signaling: top three bits must read `001`.
pub const VERSIONBITS_TOP_MASK: u32 = 0xe000_0000;
pub const VERSIONBITS_TOP_BITS: u32 = 0x2000_0000;

pub fn money_range(value: i64) -> bool {
    (0..=MAX_MONEY).contains(&value)
}
