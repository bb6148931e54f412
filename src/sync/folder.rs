// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Folder sync unit: the state machine for one (account, folder).
//!
//! new → backfilling → live, with the live loop alternating reconciliation
//! and IDLE. A UIDVALIDITY change purges the local index and restarts from
//! new; a SELECT against a vanished folder orphans it. Index writes and the
//! webhook deliveries they produce commit in one transaction, so enqueue is
//! exactly-once and a hard kill never splits them.

use std::collections::HashSet;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::imap::{FolderSelection, IdleOutcome, ImapError, ImapSession, SessionPool};
use crate::store::{now_ts, AccountRow, FolderRow, FolderState, MessageRow, Store};
use crate::sync::threading::thread_id;
use crate::sync::{SyncConfig, SyncError};
use crate::webhook::payload::{folder_object, message_object, Event, TriggerKind};

/// Clean ways a unit can stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitExit {
    Cancelled,
    /// The folder no longer exists on the server.
    Orphaned,
}

enum SelectOutcome {
    Selected(FolderSelection),
    /// UIDVALIDITY changed; index purged, folder reset to new.
    Purged,
    Orphaned,
}

pub struct FolderSyncUnit {
    store: Store,
    pool: Arc<SessionPool>,
    account: AccountRow,
    folder_name: String,
    config: SyncConfig,
    cancel: CancellationToken,
}

impl FolderSyncUnit {
    pub fn new(
        store: Store,
        pool: Arc<SessionPool>,
        account: AccountRow,
        folder_name: String,
        config: SyncConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            pool,
            account,
            folder_name,
            config,
            cancel,
        }
    }

    /// Run until cancelled, orphaned, or an error the supervisor must
    /// handle. Protocol errors drop the session and reopen; three in a row
    /// fail the folder.
    pub async fn run(&self) -> Result<UnitExit, SyncError> {
        let mut protocol_strikes = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                return Ok(UnitExit::Cancelled);
            }
            let lease = self.pool.borrow(&self.account).await?;
            match self.drive(lease.session().as_ref()).await {
                Ok(exit) => {
                    self.pool.give_back(lease).await;
                    return Ok(exit);
                }
                Err(SyncError::Imap(e)) if e.is_protocol() => {
                    // Session state is suspect after a malformed dialogue.
                    drop(lease);
                    protocol_strikes += 1;
                    warn!(
                        "protocol error on {}/{} (strike {}): {}",
                        self.account.email, self.folder_name, protocol_strikes, e
                    );
                    if protocol_strikes >= 3 {
                        if let Some(folder) = self
                            .store
                            .folder_by_name(self.account.id, &self.folder_name)
                            .await?
                        {
                            self.store
                                .set_folder_state(
                                    folder.id,
                                    FolderState::Failed,
                                    Some(&e.to_string()),
                                )
                                .await?;
                        }
                        return Err(SyncError::FolderFailed(self.folder_name.clone()));
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn drive(&self, session: &dyn ImapSession) -> Result<UnitExit, SyncError> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(UnitExit::Cancelled);
            }
            let folder = self
                .store
                .upsert_folder(self.account.id, &self.folder_name)
                .await?;

            match folder.sync_state {
                FolderState::Orphaned => return Ok(UnitExit::Orphaned),
                FolderState::Failed => {
                    // reset → new
                    self.store
                        .set_folder_state(folder.id, FolderState::New, None)
                        .await?;
                }
                FolderState::New => {
                    let sel = match self.select_checked(session, &folder).await? {
                        SelectOutcome::Selected(sel) => sel,
                        SelectOutcome::Purged => continue,
                        SelectOutcome::Orphaned => return Ok(UnitExit::Orphaned),
                    };
                    self.store.update_folder_selection(folder.id, &sel).await?;
                    let uidnext = sel.uidnext.unwrap_or(1);
                    if sel.exists == 0 || uidnext <= 1 {
                        // Nothing to enumerate.
                        self.store
                            .set_folder_state(folder.id, FolderState::Live, None)
                            .await?;
                        info!(
                            "{}/{} live (empty, uidnext={})",
                            self.account.email, self.folder_name, uidnext
                        );
                    } else {
                        self.store
                            .set_backfill_cursor(
                                folder.id,
                                Some(uidnext as i64),
                                FolderState::Backfilling,
                            )
                            .await?;
                        debug!(
                            "{}/{} backfilling below uid {}",
                            self.account.email, self.folder_name, uidnext
                        );
                    }
                }
                FolderState::Backfilling => {
                    let sel = match self.select_checked(session, &folder).await? {
                        SelectOutcome::Selected(sel) => sel,
                        SelectOutcome::Purged => continue,
                        SelectOutcome::Orphaned => return Ok(UnitExit::Orphaned),
                    };
                    self.store.update_folder_selection(folder.id, &sel).await?;
                    self.backfill_step(session, &folder, &sel).await?;
                }
                FolderState::Live => {
                    let sel = match self.select_checked(session, &folder).await? {
                        SelectOutcome::Selected(sel) => sel,
                        SelectOutcome::Purged => continue,
                        SelectOutcome::Orphaned => return Ok(UnitExit::Orphaned),
                    };
                    self.reconcile(session, &folder, &sel).await?;
                    // Selection state commits after the event transaction so
                    // a crash in between replays the (idempotent) delta.
                    self.store.update_folder_selection(folder.id, &sel).await?;
                    self.store
                        .mark_account_synced(self.account.id, now_ts())
                        .await?;

                    if session.capabilities().idle {
                        match session.idle(self.config.idle_wait, &self.cancel).await? {
                            IdleOutcome::Cancelled => return Ok(UnitExit::Cancelled),
                            IdleOutcome::Changed => {
                                debug!(
                                    "{}/{} IDLE notification",
                                    self.account.email, self.folder_name
                                );
                            }
                            IdleOutcome::Timeout => {}
                        }
                    } else {
                        tokio::select! {
                            _ = tokio::time::sleep(self.config.poll_fallback) => {}
                            _ = self.cancel.cancelled() => return Ok(UnitExit::Cancelled),
                        }
                    }
                }
            }
        }
    }

    /// SELECT with the two invariant checks every entry path shares:
    /// UIDVALIDITY continuity and folder existence.
    async fn select_checked(
        &self,
        session: &dyn ImapSession,
        folder: &FolderRow,
    ) -> Result<SelectOutcome, SyncError> {
        let sel = match session.select(&self.folder_name).await {
            Ok(sel) => sel,
            Err(ImapError::MissingMailbox(msg)) => {
                let names = session.list_folders().await?;
                if names.iter().any(|n| n == &self.folder_name) {
                    // Listed but unselectable: treat as a protocol strike.
                    return Err(SyncError::Imap(ImapError::Protocol(format!(
                        "folder listed but SELECT failed: {}",
                        msg
                    ))));
                }
                info!(
                    "{}/{} gone from server, orphaning",
                    self.account.email, self.folder_name
                );
                let mut tx = self.store.begin().await?;
                Store::set_folder_state_tx(&mut tx, folder.id, FolderState::Orphaned, None)
                    .await?;
                Store::enqueue_event_tx(
                    &mut tx,
                    &self.account,
                    &Event::new(
                        TriggerKind::FolderUpdated,
                        folder_object(&self.account, &self.folder_name, "deleted"),
                    ),
                )
                .await?;
                tx.commit().await?;
                return Ok(SelectOutcome::Orphaned);
            }
            Err(e) => return Err(e.into()),
        };

        if let (Some(stored), Some(current)) = (folder.uidvalidity, sel.uidvalidity) {
            if stored != current as i64 {
                warn!(
                    "{}/{} UIDVALIDITY changed {} -> {}, purging index",
                    self.account.email, self.folder_name, stored, current
                );
                let mut tx = self.store.begin().await?;
                Store::purge_folder_tx(&mut tx, self.account.id, folder.id).await?;
                Store::enqueue_event_tx(
                    &mut tx,
                    &self.account,
                    &Event::new(
                        TriggerKind::FolderUpdated,
                        folder_object(&self.account, &self.folder_name, "uidvalidity_change"),
                    ),
                )
                .await?;
                tx.commit().await?;
                return Ok(SelectOutcome::Purged);
            }
        }

        Ok(SelectOutcome::Selected(sel))
    }

    /// One descending batch of the initial enumeration. The cursor persists
    /// with the batch, so a restart resumes after the last committed batch
    /// without re-emitting events for indexed UIDs.
    async fn backfill_step(
        &self,
        session: &dyn ImapSession,
        folder: &FolderRow,
        sel: &FolderSelection,
    ) -> Result<(), SyncError> {
        let cursor = folder
            .backfill_uid
            .unwrap_or_else(|| sel.uidnext.unwrap_or(1) as i64);

        let all = session.uid_search("ALL").await?;
        let mut pending: Vec<u32> = all.into_iter().filter(|&u| (u as i64) < cursor).collect();
        pending.sort_unstable();

        let horizon = if self.account.backfill_horizon > 0 {
            self.account.backfill_horizon
        } else {
            self.config.backfill_horizon
        };
        if horizon > 0 {
            let indexed = self
                .store
                .message_count(self.account.id, folder.id)
                .await?;
            let allowed = (horizon - indexed).max(0) as usize;
            if allowed < pending.len() {
                pending = pending.split_off(pending.len() - allowed);
            }
        }

        if pending.is_empty() {
            self.store
                .set_backfill_cursor(folder.id, None, FolderState::Live)
                .await?;
            info!(
                "{}/{} backfill complete, entering live",
                self.account.email, self.folder_name
            );
            return Ok(());
        }

        let start = pending.len().saturating_sub(self.config.backfill_batch);
        let batch = pending.split_off(start);
        let metas = session.fetch_meta(&uid_set(&batch)).await?;

        let mut tx = self.store.begin().await?;
        for meta in &metas {
            self.index_message_tx(&mut tx, folder, meta).await?;
        }
        let new_cursor = batch.first().map(|&u| u as i64);
        let next_state = if pending.is_empty() {
            FolderState::Live
        } else {
            FolderState::Backfilling
        };
        Store::set_backfill_cursor_tx(
            &mut tx,
            folder.id,
            if next_state == FolderState::Live {
                None
            } else {
                new_cursor
            },
            next_state,
        )
        .await?;
        tx.commit().await?;

        debug!(
            "{}/{} backfilled {} messages ({} remaining)",
            self.account.email,
            self.folder_name,
            batch.len(),
            pending.len()
        );
        if next_state == FolderState::Live {
            info!(
                "{}/{} backfill complete, entering live",
                self.account.email, self.folder_name
            );
        }
        Ok(())
    }

    /// Bring the index up to date with the selected state: additions, flag
    /// deltas and expunges, each committed with its events.
    async fn reconcile(
        &self,
        session: &dyn ImapSession,
        folder: &FolderRow,
        sel: &FolderSelection,
    ) -> Result<(), SyncError> {
        let last_uid = self.store.max_uid(self.account.id, folder.id).await?;
        let condstore = session.capabilities().condstore
            && folder.highestmodseq.is_some()
            && sel.highest_modseq.is_some();

        let mut new_metas = Vec::new();
        let mut changed_uids: Vec<u32> = Vec::new();

        if condstore {
            let stored = folder.highestmodseq.unwrap_or(0) as u64;
            let current = sel.highest_modseq.unwrap_or(0);
            if current > stored {
                let changed = session
                    .uid_search(&format!("MODSEQ {}", stored + 1))
                    .await?;
                let (new_uids, old_uids): (Vec<u32>, Vec<u32>) =
                    changed.into_iter().partition(|&u| (u as i64) > last_uid);
                if !new_uids.is_empty() {
                    new_metas = session.fetch_meta(&uid_set(&new_uids)).await?;
                }
                changed_uids = old_uids;
            }
        } else {
            let server_next = sel.uidnext.unwrap_or(1) as i64;
            if server_next > last_uid + 1 {
                new_metas = session.fetch_meta(&format!("{}:*", last_uid + 1)).await?;
                // A "n:*" fetch echoes the highest existing message even
                // when n exceeds it.
                new_metas.retain(|m| (m.uid as i64) > last_uid);
            }
        }

        let mut flag_updates: Vec<(u32, Vec<String>)> = Vec::new();
        if condstore {
            if !changed_uids.is_empty() {
                flag_updates = session.fetch_flags(&uid_set(&changed_uids)).await?;
            }
        } else if last_uid > 0 {
            let lo = (last_uid - self.config.flag_window as i64 + 1).max(1);
            flag_updates = session.fetch_flags(&format!("{}:{}", lo, last_uid)).await?;
        }

        let mut expunged: Vec<i64> = Vec::new();
        if condstore {
            let local_count = self.store.message_count(self.account.id, folder.id).await?;
            if (sel.exists as i64) < local_count + new_metas.len() as i64 {
                let server: HashSet<i64> = session
                    .uid_search("ALL")
                    .await?
                    .into_iter()
                    .map(|u| u as i64)
                    .collect();
                for uid in self.store.message_uids(self.account.id, folder.id).await? {
                    if !server.contains(&uid) {
                        expunged.push(uid);
                    }
                }
            }
        } else if last_uid > 0 {
            let lo = (last_uid - self.config.flag_window as i64 + 1).max(1);
            let server: HashSet<i64> = session
                .uid_search(&format!("UID {}:{}", lo, last_uid))
                .await?
                .into_iter()
                .map(|u| u as i64)
                .collect();
            for row in self
                .store
                .messages_in_range(self.account.id, folder.id, lo, last_uid)
                .await?
            {
                if !server.contains(&row.uid) {
                    expunged.push(row.uid);
                }
            }
        }

        // Local flag state for the compare, read before the write
        // transaction opens.
        let mut local_flags = std::collections::HashMap::new();
        if !flag_updates.is_empty() {
            let lo = flag_updates.iter().map(|(u, _)| *u as i64).min().unwrap_or(1);
            let hi = flag_updates.iter().map(|(u, _)| *u as i64).max().unwrap_or(1);
            for row in self
                .store
                .messages_in_range(self.account.id, folder.id, lo, hi)
                .await?
            {
                local_flags.insert(row.uid, row);
            }
        }

        if new_metas.is_empty() && flag_updates.is_empty() && expunged.is_empty() {
            return Ok(());
        }

        new_metas.sort_by_key(|m| m.uid);
        expunged.sort_unstable();

        let mut tx = self.store.begin().await?;

        for meta in &new_metas {
            self.index_message_tx(&mut tx, folder, meta).await?;
        }

        for (uid, flags) in &flag_updates {
            let row = match local_flags.get(&(*uid as i64)) {
                Some(row) => row,
                None => continue,
            };
            let mut new_flags = flags.clone();
            new_flags.sort();
            let mut old_flags = row.flag_set();
            old_flags.sort();
            if new_flags == old_flags {
                continue;
            }
            Store::update_flags_tx(&mut tx, self.account.id, folder.id, row.uid, &new_flags)
                .await?;
            let mut updated = row.clone();
            updated.flags =
                serde_json::to_string(&new_flags).unwrap_or_else(|_| "[]".to_string());
            Store::enqueue_event_tx(
                &mut tx,
                &self.account,
                &Event::new(
                    TriggerKind::MessageUpdated,
                    message_object(&self.account, &self.folder_name, &updated),
                ),
            )
            .await?;
        }

        for uid in &expunged {
            Store::tombstone_tx(&mut tx, self.account.id, folder.id, *uid).await?;
        }

        tx.commit().await?;

        if !new_metas.is_empty() || !expunged.is_empty() {
            debug!(
                "{}/{} reconciled: {} new, {} expunged",
                self.account.email,
                self.folder_name,
                new_metas.len(),
                expunged.len()
            );
        }
        Ok(())
    }

    /// Upsert one message and enqueue `message.created` when it is genuinely
    /// new. Tombstoned UIDs never re-emit.
    async fn index_message_tx(
        &self,
        tx: &mut sqlx::Transaction<'static, sqlx::Sqlite>,
        folder: &FolderRow,
        meta: &crate::imap::MessageMeta,
    ) -> Result<(), SyncError> {
        let uid = meta.uid as i64;
        let existed = Store::message_exists_tx(tx, self.account.id, folder.id, uid).await?;
        let tombstoned = Store::is_tombstoned_tx(tx, self.account.id, folder.id, uid).await?;

        let row = MessageRow::from_meta(
            self.account.id,
            folder.id,
            meta,
            thread_id(&meta.envelope),
        );
        Store::upsert_message_tx(tx, &row).await?;

        if !existed && !tombstoned {
            Store::enqueue_event_tx(
                tx,
                &self.account,
                &Event::new(
                    TriggerKind::MessageCreated,
                    message_object(&self.account, &self.folder_name, &row),
                ),
            )
            .await?;
        }
        Ok(())
    }
}

fn uid_set(uids: &[u32]) -> String {
    uids.iter()
        .map(|u| u.to_string())
        .collect::<Vec<_>>()
        .join(",")
}
