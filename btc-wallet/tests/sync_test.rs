//! Account scan and accounting lifecycle tests against the mock provider.

mod common;

use common::{derive, fixture_at_height};

use btc_keys::Chain;
use btc_wallet::provider::{Provider, ProviderNotification};
use btc_wallet::{SyncOptions, TransactionQuery, WalletError, WalletEvent};

#[tokio::test]
async fn test_empty_wallet_scan_visits_gap_limit_paths() {
    let mut f = fixture_at_height(100, 5).await;
    let mut events = f.manager.take_event_receiver().unwrap();
    f.manager.sync_account(SyncOptions::default()).await.unwrap();

    let mut ext_indices = Vec::new();
    let mut int_indices = Vec::new();
    let mut saw_sync_end = false;
    while let Ok(event) = events.try_recv() {
        match event {
            WalletEvent::SyncedPath {
                chain,
                path,
                has_tx,
                ..
            } => {
                assert!(!has_tx);
                match chain {
                    Chain::External => ext_indices.push(path.index),
                    Chain::Internal => int_indices.push(path.index),
                }
            }
            WalletEvent::SyncEnd => saw_sync_end = true,
            _ => {}
        }
    }
    // Five empty paths per chain, in strictly ascending order.
    assert_eq!(ext_indices, vec![0, 1, 2, 3, 4]);
    assert_eq!(int_indices, vec![0, 1, 2, 3, 4]);
    assert!(saw_sync_end);
    assert!(f.manager.get_balance(None).unwrap().is_zero());
}

#[tokio::test]
async fn test_receive_lifecycle_mempool_to_confirmed() {
    let mut f = fixture_at_height(100, 5).await;
    let ext0 = derive(&f.deriver, Chain::External, 0);

    // Two 0.1 BTC payments land in the mempool.
    let tx1 = f.provider.fund_address(&ext0, 10_000_000, 0);
    let tx2 = f.provider.fund_address(&ext0, 10_000_000, 0);
    f.manager.sync_account(SyncOptions::default()).await.unwrap();

    let balance = f.manager.get_balance(None).unwrap();
    assert_eq!(balance.mempool, 20_000_000);
    assert_eq!(balance.pending, 0);
    assert_eq!(balance.confirmed, 0);

    // Both get mined at 101; with min_block_confirm=1 the first block
    // leaves them pending, the second confirms.
    f.provider.set_tx_height(tx1, 101);
    f.provider.set_tx_height(tx2, 101);
    f.provider.set_height(101);
    f.manager
        .handle_notification(ProviderNotification::NewBlock {
            height: 101,
        })
        .await
        .unwrap();
    // First block after open only establishes the window baseline.
    f.provider.set_height(102);
    f.manager
        .handle_notification(ProviderNotification::NewBlock {
            height: 102,
        })
        .await
        .unwrap();

    let balance = f.manager.get_balance(None).unwrap();
    assert_eq!(balance.mempool, 0);
    assert_eq!(balance.confirmed, 20_000_000);
    assert_eq!(f.manager.unspent_store().len(), 2);
}

#[tokio::test]
async fn test_process_history_is_idempotent() {
    let mut f = fixture_at_height(100, 5).await;
    let ext0 = derive(&f.deriver, Chain::External, 0);
    f.provider.fund_address(&ext0, 5_000_000, 90);

    f.manager.sync_account(SyncOptions::default()).await.unwrap();
    let balance_once = f.manager.get_balance(None).unwrap();
    let utxos_once = f.manager.unspent_store().len();

    // Replay the exact same history through the core.
    let history = f.provider.get_history(&ext0.script_hash, true).await.unwrap();
    f.manager.process_history(&history, None).await.unwrap();
    f.manager.process_history(&history, None).await.unwrap();

    assert_eq!(f.manager.get_balance(None).unwrap(), balance_once);
    assert_eq!(f.manager.unspent_store().len(), utxos_once);
    assert_eq!(balance_once.confirmed, 5_000_000);
}

#[tokio::test]
async fn test_total_balance_matches_ledger_sum() {
    let mut f = fixture_at_height(100, 5).await;
    let ext0 = derive(&f.deriver, Chain::External, 0);
    let ext1 = derive(&f.deriver, Chain::External, 1);
    f.provider.fund_address(&ext0, 1_000_000, 95);
    f.provider.fund_address(&ext1, 2_500_000, 0);

    f.manager.sync_account(SyncOptions::default()).await.unwrap();

    let total = f.manager.get_balance(None).unwrap();
    let summed = f.manager.address_store().aggregate_balance();
    assert_eq!(total, summed);
    assert_eq!(total.confirmed, 1_000_000);
    assert_eq!(total.mempool, 2_500_000);
}

#[tokio::test]
async fn test_gap_resets_on_used_path() {
    let mut f = fixture_at_height(100, 3).await;
    // Activity at external index 2 pushes the scan window past it.
    let ext2 = derive(&f.deriver, Chain::External, 2);
    f.provider.fund_address(&ext2, 100_000, 95);

    let mut events = f.manager.take_event_receiver().unwrap();
    f.manager.sync_account(SyncOptions::default()).await.unwrap();

    let mut ext_indices = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let WalletEvent::SyncedPath {
            chain: Chain::External,
            path,
            ..
        } = event
        {
            ext_indices.push(path.index);
        }
    }
    // 0 and 1 empty, 2 used (gap resets), then 3..=5 empty.
    assert_eq!(ext_indices, vec![0, 1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_address_reuse_guard_across_instances() {
    let mut f = fixture_at_height(100, 5).await;
    let ext0 = derive(&f.deriver, Chain::External, 0);
    let ext1 = derive(&f.deriver, Chain::External, 1);
    f.provider.fund_address(&ext0, 100_000, 95);
    f.provider.fund_address(&ext1, 100_000, 95);

    f.manager.sync_account(SyncOptions::default()).await.unwrap();
    let next = f.manager.get_new_address(Chain::External).await.unwrap();
    assert_eq!(next.path.index, 2);

    // A fresh wallet from the same seed against the same provider state
    // lands on the same next index after syncing.
    let mut g = fixture_at_height(100, 5).await;
    g.provider.fund_address(&derive(&g.deriver, Chain::External, 0), 100_000, 95);
    g.provider.fund_address(&derive(&g.deriver, Chain::External, 1), 100_000, 95);
    g.manager.sync_account(SyncOptions::default()).await.unwrap();
    let next = g.manager.get_new_address(Chain::External).await.unwrap();
    assert_eq!(next.path.index, 2);
}

#[tokio::test]
async fn test_sync_in_progress_is_rejected_and_pause_resumes() {
    let mut f = fixture_at_height(100, 30).await;
    let control = f.manager.control();

    let mut events = f.manager.take_event_receiver().unwrap();
    let pause = async {
        // Let a few paths through, then ask for a halt.
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        control.pause().await;
    };
    let (sync_result, _) = tokio::join!(f.manager.sync_account(SyncOptions::default()), pause);
    sync_result.unwrap();

    let mut first_run = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let WalletEvent::SyncedPath {
            chain: Chain::External,
            path,
            ..
        } = event
        {
            first_run.push(path.index);
        }
    }
    // The pause landed mid-scan.
    assert!(first_run.len() < 30, "scan was not interrupted: {:?}", first_run);

    // Resume continues from the cursor without revisiting any path.
    f.manager.sync_account(SyncOptions::default()).await.unwrap();
    let mut second_run = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let WalletEvent::SyncedPath {
            chain: Chain::External,
            path,
            ..
        } = event
        {
            second_run.push(path.index);
        }
    }
    let all: Vec<u32> = first_run.iter().chain(second_run.iter()).copied().collect();
    for pair in all.windows(2) {
        assert!(pair[0] < pair[1], "indices not strictly increasing: {:?}", all);
    }
}

#[tokio::test]
async fn test_transaction_log_pagination_and_direction() {
    let mut f = fixture_at_height(100, 5).await;
    let ext0 = derive(&f.deriver, Chain::External, 0);
    f.provider.fund_address(&ext0, 1_000, 80);
    f.provider.fund_address(&ext0, 2_000, 90);
    f.provider.fund_address(&ext0, 3_000, 0);

    f.manager.sync_account(SyncOptions::default()).await.unwrap();

    let newest_first = f.manager.get_transactions(TransactionQuery::default());
    let heights: Vec<u32> = newest_first.iter().map(|e| e.height).collect();
    assert_eq!(heights, vec![0, 90, 80]);
    assert!(newest_first
        .iter()
        .all(|e| e.direction == btc_wallet::Direction::Incoming));
    assert_eq!(newest_first[0].amount, 3_000);

    let page = f.manager.get_transactions(TransactionQuery {
        limit: 1,
        offset: 2,
        reverse: true,
    });
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].height, 0);
}

#[tokio::test]
async fn test_unknown_address_balance_query() {
    let f = fixture_at_height(100, 5).await;
    let err = f.manager.get_balance(Some("bcrt1qnothing")).unwrap_err();
    assert!(matches!(err, WalletError::Sync(_)));
}

#[tokio::test]
async fn test_per_address_balance() {
    let mut f = fixture_at_height(100, 5).await;
    let ext0 = derive(&f.deriver, Chain::External, 0);
    f.provider.fund_address(&ext0, 7_000, 95);
    f.manager.sync_account(SyncOptions::default()).await.unwrap();

    let balance = f.manager.get_balance(Some(&ext0.address.to_string())).unwrap();
    assert_eq!(balance.confirmed, 7_000);
    assert_eq!(balance.mempool, 0);
}

#[tokio::test]
async fn test_restart_rebuilds_from_scratch() {
    let mut f = fixture_at_height(100, 5).await;
    let ext0 = derive(&f.deriver, Chain::External, 0);
    f.provider.fund_address(&ext0, 9_000, 95);
    f.manager.sync_account(SyncOptions::default()).await.unwrap();
    assert_eq!(f.manager.get_balance(None).unwrap().confirmed, 9_000);

    // Restart drops everything derived and rescans to the same result.
    f.manager
        .sync_account(SyncOptions {
            reset: false,
            restart: true,
        })
        .await
        .unwrap();
    let balance = f.manager.get_balance(None).unwrap();
    assert_eq!(balance.confirmed, 9_000);
    assert_eq!(f.manager.unspent_store().len(), 1);
    assert_eq!(
        f.manager.get_balance(None).unwrap(),
        f.manager.address_store().aggregate_balance()
    );
}

#[tokio::test]
async fn test_new_tx_event_emitted_once_for_mempool_entry() {
    let mut f = fixture_at_height(100, 5).await;
    let ext0 = derive(&f.deriver, Chain::External, 0);
    f.provider.fund_address(&ext0, 4_000, 0);

    let mut events = f.manager.take_event_receiver().unwrap();
    f.manager.sync_account(SyncOptions::default()).await.unwrap();

    // Replay the history: no second NewTx may fire.
    let history = f.provider.get_history(&ext0.script_hash, true).await.unwrap();
    f.manager.process_history(&history, None).await.unwrap();

    let new_tx_events = {
        let mut count = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, WalletEvent::NewTx(_)) {
                count += 1;
            }
        }
        count
    };
    assert_eq!(new_tx_events, 1);
}

#[tokio::test]
async fn test_client_tick_pumps_notifications() {
    use btc_keys::KeyDeriver;
    use btc_wallet::storage::MemoryStore;
    use btc_wallet::{Config, WalletClient};
    use std::sync::Arc;

    let network = bitcoin::Network::Regtest;
    let provider = Arc::new(common::MockProvider::new(network, 100));
    let client_provider = Arc::clone(&provider);
    let mut client = WalletClient::open(
        Config::with_network(network).with_gap_limit(3),
        client_provider,
        Arc::new(MemoryStore::new()),
        KeyDeriver::from_mnemonic(common::MNEMONIC, "", network).unwrap(),
    )
    .await
    .unwrap();

    provider.push_new_block(105);
    client.tick().await.unwrap();
    assert_eq!(client.manager().tip_height(), 105);
}
