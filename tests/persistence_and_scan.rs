//! Integration tests for durable storage and chain scans

mod common;

use chaincore::chaindb::ChainDb;
use chaincore::coins::CoinSource;
use chaincore::consensus::COIN;
use chaincore::error::ChainError;
use chaincore::params::ChainParams;
use chaincore::persistence::Database;
use chaincore::scan::ScanHandle;
use common::{
    coinbase_outpoint, open_chain, open_with, regtest, spend, test_options, PausingStore,
    TestResult,
};
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

#[test]
fn test_sqlite_chain_survives_reopen() -> TestResult {
    let temp_dir = TempDir::new()?;
    let path = temp_dir.path().join("chain.db");
    let path = path.to_str().ok_or("non-utf8 temp path")?;

    let genesis = ChainParams::regtest().genesis_hash();
    let (tip, state, fork) = {
        let mut h = open_chain(ChainParams::regtest(), Arc::new(Database::open(path)?))?;
        h.mine_empty(12)?;
        let fork = h.block_on(&genesis, Vec::new(), 5);
        h.chain.add_block(fork.clone())?;
        let tip = h.chain.tip().clone();
        let state = h.chain.chain_state();
        h.chain.close()?;
        (tip, state, fork)
    };

    let mut h = open_chain(ChainParams::regtest(), Arc::new(Database::open(path)?))?;
    assert_eq!(h.chain.tip(), &tip);
    assert_eq!(h.chain.chain_state(), state);
    assert_eq!(h.chain.entry_at(0).map(|entry| entry.hash), Some(genesis));
    assert!(h.chain.contains(&fork.hash()));
    assert_eq!(h.chain.tips().len(), 2);
    assert_eq!(h.chain.db().coin_count()?, state.coin_count);

    h.mine_empty(1)?;
    assert_eq!(h.chain.height(), 13);
    Ok(())
}

#[test]
fn test_scan_walks_active_chain() -> TestResult {
    let mut h = regtest()?;
    let blocks = h.mine_empty(5)?;

    let scanned = h
        .chain
        .scan(1, ScanHandle::new())
        .collect::<Result<Vec<_>, _>>()?;
    let heights: Vec<u32> = scanned.iter().map(|(entry, _)| entry.height).collect();
    assert_eq!(heights, vec![1, 2, 3, 4, 5]);
    assert_eq!(scanned[4].1.as_ref(), &blocks[4]);
    Ok(())
}

#[test]
fn test_scan_stops_when_cancelled() -> TestResult {
    let mut h = regtest()?;
    h.mine_empty(5)?;

    let handle = ScanHandle::new();
    let mut scan = h.chain.scan(0, handle.clone());
    assert!(scan.next().transpose()?.is_some());
    assert!(scan.next().transpose()?.is_some());
    handle.cancel();
    assert!(matches!(scan.next(), Some(Err(ChainError::Cancelled))));
    assert!(scan.next().is_none());

    // The chain keeps accepting blocks while a scan is alive.
    let other = h.chain.scan(0, ScanHandle::new());
    h.mine_empty(1)?;
    assert_eq!(other.count(), 6);
    Ok(())
}

#[test]
fn test_coin_read_during_spend_does_not_revive_coin() -> TestResult {
    let params = ChainParams::regtest();
    let store = Arc::new(PausingStore::new());
    let db = ChainDb::with_cache_sizes(store.clone(), 1, 16);
    let mut h = open_with(params.clone(), db, test_options(&params))?;
    let blocks = h.mine_empty(101)?;
    let coin = coinbase_outpoint(&blocks[0]);

    store.pause_next_read(&coin);
    let reader = {
        let db = h.chain.db().clone();
        thread::spawn(move || db.fetch_coin(&coin))
    };
    store.wait();
    h.mine(vec![spend(&[coin], 50 * COIN - 1_000, 1)], 1)?;
    store.wait();

    let seen = reader.join().map_err(|_| "reader thread panicked")??;
    assert!(seen.is_some());
    assert!(h.chain.coin(&coin)?.is_none());

    let err = h
        .mine(vec![spend(&[coin], 50 * COIN - 2_000, 2)], 2)
        .unwrap_err();
    assert_eq!(err.reason(), Some("bad-txns-inputs-missingorspent"));
    assert_eq!(h.chain.height(), 102);
    Ok(())
}
