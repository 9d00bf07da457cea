//! Script verification seam and the parallel dispatch of input checks.

use crate::coins::Coin;
use crate::error::{ChainError, Rejection, Result};
use crate::transaction::Transaction;
use bitflags::bitflags;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use thiserror::Error;
use tracing::debug;

bitflags! {
    /// Script validation rules in force for a block.
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ScriptFlags: u32 {
        const NONE = 0;
        const P2SH = 1 << 0;
        const STRICTENC = 1 << 1;
        const DERSIG = 1 << 2;
        const CHECKLOCKTIMEVERIFY = 1 << 9;
        const CHECKSEQUENCEVERIFY = 1 << 10;
        const SIGHASH_FORKID = 1 << 16;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScriptError {
    #[error("Script evaluated without error but finished with a false/empty top stack element")]
    EvalFalse,
    #[error("Signature must be zero for failed CHECK(MULTI)SIG operation")]
    NullFail,
    #[error("Non-canonical DER signature")]
    SigDer,
    #[error("Locktime requirement not satisfied")]
    UnsatisfiedLocktime,
    #[error("Signature must use SIGHASH_FORKID")]
    MustUseForkId,
    #[error("{0}")]
    Other(String),
}

/// Executes the unlocking script of one input against the coin it spends.
pub trait ScriptVerifier: Send + Sync {
    fn verify(
        &self,
        tx: &Transaction,
        input: usize,
        coin: &Coin,
        flags: ScriptFlags,
    ) -> std::result::Result<(), ScriptError>;
}

/// Accepts every script. For regtest and tests, where signatures are not
/// produced.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAllVerifier;

impl ScriptVerifier for AcceptAllVerifier {
    fn verify(
        &self,
        _tx: &Transaction,
        _input: usize,
        _coin: &Coin,
        _flags: ScriptFlags,
    ) -> std::result::Result<(), ScriptError> {
        Ok(())
    }
}

/// One pending input verification.
#[derive(Debug, Clone)]
pub struct ScriptCheck<'a> {
    pub tx: &'a Transaction,
    pub input: usize,
    pub coin: &'a Coin,
    pub flags: ScriptFlags,
}

/// Bounded worker pool for script checks.
pub struct ScriptPool {
    pool: ThreadPool,
}

impl ScriptPool {
    pub fn new(threads: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("script-check-{}", i))
            .build()
            .map_err(|e| ChainError::Config(format!("failed to build script pool: {}", e)))?;
        Ok(ScriptPool { pool })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Runs every check to completion, then reports the first failure in
    /// block order so the verdict does not depend on scheduling.
    pub fn run(&self, verifier: &dyn ScriptVerifier, checks: &[ScriptCheck<'_>]) -> Result<()> {
        let results: Vec<std::result::Result<(), ScriptError>> = self.pool.install(|| {
            checks
                .par_iter()
                .map(|check| verifier.verify(check.tx, check.input, check.coin, check.flags))
                .collect()
        });

        for (check, result) in checks.iter().zip(results) {
            if let Err(err) = result {
                debug!(
                    txid = %check.tx.txid_str(),
                    input = check.input,
                    error = %err,
                    "script verification failed"
                );
                return Err(Rejection::invalid(
                    format!("mandatory-script-verify-flag-failed ({})", err),
                    100,
                )
                .into());
            }
        }
        Ok(())
    }
}
