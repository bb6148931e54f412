// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! End-to-end sync engine scenarios against the in-memory IMAP fake:
//! backfill, IDLE-driven increments, UIDVALIDITY recovery, resumable
//! backfill and the non-CONDSTORE fallback path.

mod common;

use tokio_util::sync::CancellationToken;

use common::{FakeMailbox, FakeServer, IdleStep};
use mailhook::store::{DeliveryRow, FolderState, Store};
use mailhook::sync::folder::{FolderSyncUnit, UnitExit};

fn kinds(deliveries: &[DeliveryRow]) -> Vec<String> {
    deliveries.iter().map(|d| d.trigger_kind.clone()).collect()
}

fn object_of(delivery: &DeliveryRow) -> serde_json::Value {
    let envelope: serde_json::Value =
        serde_json::from_str(&delivery.payload).expect("payload is JSON");
    envelope["object"].clone()
}

async fn folder_state(store: &Store, account_id: i64, name: &str) -> Option<FolderState> {
    store
        .folder_by_name(account_id, name)
        .await
        .unwrap()
        .map(|f| f.sync_state)
}

/// S1 + S2 + S3: initial backfill in UID order, one IDLE-driven addition,
/// then a UIDVALIDITY change that purges and restarts.
#[tokio::test]
async fn inbox_backfill_idle_and_uidvalidity_change() {
    let store = common::memory_store().await;
    let account = common::seed_account(&store).await;
    common::seed_subscription(&store).await;

    let server = FakeServer::new(FakeServer::caps_plain());
    server.create_folder("INBOX", 42);
    server.mailbox("INBOX", |m| {
        m.deliver(101, "first", "alice@example.com", "<m101@x>");
        m.deliver(102, "second", "bob@example.com", "<m102@x>");
        m.deliver(103, "third", "carol@example.com", "<m103@x>");
    });
    let (pool, _factory) = common::fake_pool(&server);

    let cancel = CancellationToken::new();
    let unit = FolderSyncUnit::new(
        store.clone(),
        pool,
        account.clone(),
        "INBOX".to_string(),
        common::test_sync_config(),
        cancel.clone(),
    );
    let task = tokio::spawn(async move { unit.run().await });

    // S1: three message.created in UID order, folder live, nothing else.
    let probe_store = store.clone();
    let account_id = account.id;
    common::wait_until("initial backfill", || {
        let store = probe_store.clone();
        async move {
            store.deliveries_for_account(account_id).await.unwrap().len() >= 3
                && folder_state(&store, account_id, "INBOX").await == Some(FolderState::Live)
        }
    })
    .await;

    let deliveries = store.deliveries_for_account(account.id).await.unwrap();
    assert_eq!(deliveries.len(), 3, "no events beyond the backfill");
    assert_eq!(
        kinds(&deliveries),
        vec!["message.created"; 3],
        "backfill emits creations only"
    );
    let uids: Vec<i64> = deliveries
        .iter()
        .map(|d| {
            object_of(d)["id"]
                .as_str()
                .unwrap()
                .rsplit('.')
                .next()
                .unwrap()
                .parse()
                .unwrap()
        })
        .collect();
    assert_eq!(uids, vec![101, 102, 103], "creations in ascending UID order");
    let seqs: Vec<i64> = deliveries.iter().map(|d| d.event_seq).collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]), "event sequence increases");

    // S2: new message arrives, IDLE wakes the unit.
    server.mailbox("INBOX", |m| m.deliver(104, "fourth", "dave@example.com", "<m104@x>"));
    server.push_idle(IdleStep::Changed);

    let probe_store = store.clone();
    common::wait_until("uid 104 indexed", || {
        let store = probe_store.clone();
        async move {
            store.deliveries_for_account(account_id).await.unwrap().len() >= 4
        }
    })
    .await;
    let deliveries = store.deliveries_for_account(account.id).await.unwrap();
    assert_eq!(deliveries.len(), 4);
    assert_eq!(deliveries[3].trigger_kind, "message.created");
    assert!(object_of(&deliveries[3])["id"]
        .as_str()
        .unwrap()
        .ends_with(".104"));

    // S3: the server recreates INBOX with a new UIDVALIDITY and one message.
    let mut recreated = FakeMailbox::new(43);
    recreated.deliver(1, "fresh start", "eve@example.com", "<m1@y>");
    server.replace_folder("INBOX", recreated);
    server.push_idle(IdleStep::Changed);

    let probe_store = store.clone();
    common::wait_until("purge and re-backfill", || {
        let store = probe_store.clone();
        async move {
            store.deliveries_for_account(account_id).await.unwrap().len() >= 6
        }
    })
    .await;

    let deliveries = store.deliveries_for_account(account.id).await.unwrap();
    assert_eq!(deliveries.len(), 6);
    assert_eq!(deliveries[4].trigger_kind, "folder.updated");
    assert_eq!(object_of(&deliveries[4])["reason"], "uidvalidity_change");
    assert_eq!(deliveries[5].trigger_kind, "message.created");
    assert!(object_of(&deliveries[5])["id"].as_str().unwrap().ends_with(".1"));

    // The old index is gone; only the new UID remains, with no tombstones.
    let folder = store.folder_by_name(account.id, "INBOX").await.unwrap().unwrap();
    assert_eq!(store.message_uids(account.id, folder.id).await.unwrap(), vec![1]);
    assert!(store.tombstoned_uids(account.id, folder.id).await.unwrap().is_empty());
    assert_eq!(folder.uidvalidity, Some(43));

    cancel.cancel();
    let exit = task.await.unwrap().unwrap();
    assert_eq!(exit, UnitExit::Cancelled);
}

/// Boundary: an empty folder (and UIDNEXT = 1) goes live with zero events.
#[tokio::test]
async fn empty_folder_goes_live_without_events() {
    let store = common::memory_store().await;
    let account = common::seed_account(&store).await;
    common::seed_subscription(&store).await;

    let server = FakeServer::new(FakeServer::caps_plain());
    server.create_folder("Drafts", 7);
    let (pool, _factory) = common::fake_pool(&server);

    let cancel = CancellationToken::new();
    let unit = FolderSyncUnit::new(
        store.clone(),
        pool,
        account.clone(),
        "Drafts".to_string(),
        common::test_sync_config(),
        cancel.clone(),
    );
    let task = tokio::spawn(async move { unit.run().await });

    let probe_store = store.clone();
    let account_id = account.id;
    common::wait_until("folder live", || {
        let store = probe_store.clone();
        async move { folder_state(&store, account_id, "Drafts").await == Some(FolderState::Live) }
    })
    .await;

    assert!(store.deliveries_for_account(account.id).await.unwrap().is_empty());

    cancel.cancel();
    assert_eq!(task.await.unwrap().unwrap(), UnitExit::Cancelled);
}

/// A unit restarted mid-backfill resumes at its cursor and never re-emits
/// message.created for UIDs already indexed.
#[tokio::test]
async fn backfill_resumes_without_duplicate_events() {
    let store = common::memory_store().await;
    let account = common::seed_account(&store).await;
    common::seed_subscription(&store).await;

    let server = FakeServer::new(FakeServer::caps_plain());
    server.create_folder("Archive", 9);
    server.mailbox("Archive", |m| {
        m.deliver(4, "four", "a@example.com", "<m4@x>");
        m.deliver(5, "five", "a@example.com", "<m5@x>");
    });
    let (pool, _factory) = common::fake_pool(&server);

    // First pass indexes UIDs 4 and 5 and goes live.
    let cancel = CancellationToken::new();
    let unit = FolderSyncUnit::new(
        store.clone(),
        pool.clone(),
        account.clone(),
        "Archive".to_string(),
        common::test_sync_config(),
        cancel.clone(),
    );
    let task = tokio::spawn(async move { unit.run().await });
    let probe_store = store.clone();
    let account_id = account.id;
    common::wait_until("first pass", || {
        let store = probe_store.clone();
        async move {
            store.deliveries_for_account(account_id).await.unwrap().len() >= 2
                && folder_state(&store, account_id, "Archive").await == Some(FolderState::Live)
        }
    })
    .await;
    cancel.cancel();
    task.await.unwrap().unwrap();

    // Simulate an interrupted enumeration: older mail below the committed
    // cursor, folder put back into backfilling.
    server.mailbox("Archive", |m| {
        m.deliver(1, "one", "a@example.com", "<m1@x>");
        m.deliver(2, "two", "a@example.com", "<m2@x>");
        m.deliver(3, "three", "a@example.com", "<m3@x>");
    });
    let folder = store.folder_by_name(account.id, "Archive").await.unwrap().unwrap();
    store
        .set_backfill_cursor(folder.id, Some(4), FolderState::Backfilling)
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let unit = FolderSyncUnit::new(
        store.clone(),
        pool,
        account.clone(),
        "Archive".to_string(),
        common::test_sync_config(),
        cancel.clone(),
    );
    let task = tokio::spawn(async move { unit.run().await });

    let probe_store = store.clone();
    common::wait_until("resume pass", || {
        let store = probe_store.clone();
        async move {
            store.deliveries_for_account(account_id).await.unwrap().len() >= 5
                && folder_state(&store, account_id, "Archive").await == Some(FolderState::Live)
        }
    })
    .await;
    cancel.cancel();
    task.await.unwrap().unwrap();

    let deliveries = store.deliveries_for_account(account.id).await.unwrap();
    assert_eq!(deliveries.len(), 5, "one creation per UID, no duplicates");
    let mut uids: Vec<i64> = deliveries
        .iter()
        .map(|d| {
            object_of(d)["id"]
                .as_str()
                .unwrap()
                .rsplit('.')
                .next()
                .unwrap()
                .parse()
                .unwrap()
        })
        .collect();
    uids.sort_unstable();
    assert_eq!(uids, vec![1, 2, 3, 4, 5]);
}

/// The UID-range fallback produces the same event set as the CONDSTORE path
/// for an identical mailbox history.
#[tokio::test]
async fn fallback_delta_matches_condstore_delta() {
    let mut outcomes = Vec::new();

    for caps in [FakeServer::caps_condstore(), FakeServer::caps_plain()] {
        let store = common::memory_store().await;
        let account = common::seed_account(&store).await;
        common::seed_subscription(&store).await;

        let server = FakeServer::new(caps);
        server.create_folder("INBOX", 11);
        server.mailbox("INBOX", |m| {
            m.deliver(1, "hello", "a@example.com", "<d1@x>");
            m.deliver(2, "world", "b@example.com", "<d2@x>");
        });
        let (pool, _factory) = common::fake_pool(&server);

        let cancel = CancellationToken::new();
        let unit = FolderSyncUnit::new(
            store.clone(),
            pool,
            account.clone(),
            "INBOX".to_string(),
            common::test_sync_config(),
            cancel.clone(),
        );
        let task = tokio::spawn(async move { unit.run().await });

        let probe_store = store.clone();
        let account_id = account.id;
        common::wait_until("backfill", || {
            let store = probe_store.clone();
            async move {
                store.deliveries_for_account(account_id).await.unwrap().len() >= 2
                    && folder_state(&store, account_id, "INBOX").await == Some(FolderState::Live)
            }
        })
        .await;

        // Same history on both servers: one addition, one flag change.
        server.mailbox("INBOX", |m| {
            m.deliver(3, "newest", "c@example.com", "<d3@x>");
            m.set_flags(1, &["\\Seen"]);
        });
        server.push_idle(IdleStep::Changed);

        let probe_store = store.clone();
        common::wait_until("delta", || {
            let store = probe_store.clone();
            async move {
                store.deliveries_for_account(account_id).await.unwrap().len() >= 4
            }
        })
        .await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        let deliveries = store.deliveries_for_account(account.id).await.unwrap();
        let mut events: Vec<(String, String)> = deliveries
            .iter()
            .skip(2)
            .map(|d| {
                (
                    d.trigger_kind.clone(),
                    object_of(d)["id"].as_str().unwrap().to_string(),
                )
            })
            .collect();
        events.sort();
        outcomes.push(events);
    }

    assert_eq!(outcomes[0], outcomes[1]);
    assert_eq!(outcomes[0].len(), 2);
    assert!(outcomes[0].iter().any(|(kind, id)| kind == "message.created" && id.ends_with(".3")));
    assert!(outcomes[0].iter().any(|(kind, id)| kind == "message.updated" && id.ends_with(".1")));
}

/// A folder deleted on the server orphans the unit and announces it.
#[tokio::test]
async fn deleted_folder_orphans_unit() {
    let store = common::memory_store().await;
    let account = common::seed_account(&store).await;
    common::seed_subscription(&store).await;

    let server = FakeServer::new(FakeServer::caps_plain());
    server.create_folder("INBOX", 3);
    server.create_folder("Newsletters", 5);
    server.mailbox("Newsletters", |m| {
        m.deliver(10, "weekly", "news@example.com", "<n10@x>")
    });
    let (pool, _factory) = common::fake_pool(&server);

    let cancel = CancellationToken::new();
    let unit = FolderSyncUnit::new(
        store.clone(),
        pool,
        account.clone(),
        "Newsletters".to_string(),
        common::test_sync_config(),
        cancel.clone(),
    );
    let task = tokio::spawn(async move { unit.run().await });

    let probe_store = store.clone();
    let account_id = account.id;
    common::wait_until("newsletter backfill", || {
        let store = probe_store.clone();
        async move {
            folder_state(&store, account_id, "Newsletters").await == Some(FolderState::Live)
        }
    })
    .await;

    server.remove_folder("Newsletters");
    server.push_idle(IdleStep::Changed);

    let exit = task.await.unwrap().unwrap();
    assert_eq!(exit, UnitExit::Orphaned);
    assert_eq!(
        folder_state(&store, account.id, "Newsletters").await,
        Some(FolderState::Orphaned)
    );
    let deliveries = store.deliveries_for_account(account.id).await.unwrap();
    let last = deliveries.last().unwrap();
    assert_eq!(last.trigger_kind, "folder.updated");
    assert_eq!(object_of(last)["reason"], "deleted");
}

/// Expunges recorded under the fallback path leave tombstones, not events.
#[tokio::test]
async fn expunge_leaves_tombstone() {
    let store = common::memory_store().await;
    let account = common::seed_account(&store).await;
    common::seed_subscription(&store).await;

    let server = FakeServer::new(FakeServer::caps_plain());
    server.create_folder("INBOX", 21);
    server.mailbox("INBOX", |m| {
        m.deliver(1, "keep", "a@example.com", "<k1@x>");
        m.deliver(2, "remove", "a@example.com", "<k2@x>");
    });
    let (pool, _factory) = common::fake_pool(&server);

    let cancel = CancellationToken::new();
    let unit = FolderSyncUnit::new(
        store.clone(),
        pool,
        account.clone(),
        "INBOX".to_string(),
        common::test_sync_config(),
        cancel.clone(),
    );
    let task = tokio::spawn(async move { unit.run().await });

    let probe_store = store.clone();
    let account_id = account.id;
    common::wait_until("backfill", || {
        let store = probe_store.clone();
        async move {
            store.deliveries_for_account(account_id).await.unwrap().len() >= 2
        }
    })
    .await;

    server.mailbox("INBOX", |m| m.expunge(2));
    server.push_idle(IdleStep::Changed);

    let probe_store = store.clone();
    common::wait_until("tombstone recorded", || {
        let store = probe_store.clone();
        async move {
            let folder = store
                .folder_by_name(account_id, "INBOX")
                .await
                .unwrap()
                .unwrap();
            store.tombstoned_uids(account_id, folder.id).await.unwrap() == vec![2]
        }
    })
    .await;

    cancel.cancel();
    task.await.unwrap().unwrap();

    let folder = store.folder_by_name(account.id, "INBOX").await.unwrap().unwrap();
    assert_eq!(store.message_uids(account.id, folder.id).await.unwrap(), vec![1]);
    // Expunges are local bookkeeping; the delivery log still holds just the
    // two creations.
    assert_eq!(store.deliveries_for_account(account.id).await.unwrap().len(), 2);
}
