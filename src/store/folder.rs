// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;

use crate::imap::types::FolderSelection;
use crate::store::{now_ts, Store};

/// Folder sync state machine states, persisted so a restarted unit resumes
/// where it left off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FolderState {
    New,
    Backfilling,
    Live,
    Failed,
    Orphaned,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FolderRow {
    pub id: i64,
    pub account_id: i64,
    pub name: String,
    pub uidvalidity: Option<i64>,
    pub uidnext: Option<i64>,
    pub highestmodseq: Option<i64>,
    pub exists_count: i64,
    pub sync_state: FolderState,
    pub backfill_uid: Option<i64>,
    pub last_polled_at: Option<i64>,
    pub last_error: Option<String>,
}

impl Store {
    /// Get or create the folder row for (account, name).
    pub async fn upsert_folder(
        &self,
        account_id: i64,
        name: &str,
    ) -> Result<FolderRow, sqlx::Error> {
        sqlx::query("INSERT OR IGNORE INTO folders (account_id, name) VALUES (?, ?)")
            .bind(account_id)
            .bind(name)
            .execute(self.pool())
            .await?;
        self.folder_by_name(account_id, name)
            .await?
            .ok_or(sqlx::Error::RowNotFound)
    }

    pub async fn folder_by_name(
        &self,
        account_id: i64,
        name: &str,
    ) -> Result<Option<FolderRow>, sqlx::Error> {
        sqlx::query_as::<_, FolderRow>(
            "SELECT * FROM folders WHERE account_id = ? AND name = ?",
        )
        .bind(account_id)
        .bind(name)
        .fetch_optional(self.pool())
        .await
    }

    pub async fn folders(&self, account_id: i64) -> Result<Vec<FolderRow>, sqlx::Error> {
        sqlx::query_as::<_, FolderRow>(
            "SELECT * FROM folders WHERE account_id = ? ORDER BY name",
        )
        .bind(account_id)
        .fetch_all(self.pool())
        .await
    }

    /// Record the coordinates from the latest successful SELECT.
    pub async fn update_folder_selection(
        &self,
        folder_id: i64,
        sel: &FolderSelection,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE folders
            SET uidvalidity = ?, uidnext = ?, highestmodseq = ?, exists_count = ?,
                last_polled_at = ?, last_error = NULL
            WHERE id = ?
            "#,
        )
        .bind(sel.uidvalidity.map(|v| v as i64))
        .bind(sel.uidnext.map(|v| v as i64))
        .bind(sel.highest_modseq.map(|v| v as i64))
        .bind(sel.exists as i64)
        .bind(now_ts())
        .bind(folder_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn set_folder_state(
        &self,
        folder_id: i64,
        state: FolderState,
        last_error: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE folders SET sync_state = ?, last_error = ? WHERE id = ?")
            .bind(state)
            .bind(last_error)
            .bind(folder_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Move a folder between sync states and position its backfill cursor.
    pub async fn set_backfill_cursor(
        &self,
        folder_id: i64,
        cursor: Option<i64>,
        state: FolderState,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE folders SET backfill_uid = ?, sync_state = ? WHERE id = ?")
            .bind(cursor)
            .bind(state)
            .bind(folder_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub(crate) async fn set_folder_state_tx(
        conn: &mut SqliteConnection,
        folder_id: i64,
        state: FolderState,
        last_error: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE folders SET sync_state = ?, last_error = ? WHERE id = ?")
            .bind(state)
            .bind(last_error)
            .bind(folder_id)
            .execute(conn)
            .await?;
        Ok(())
    }

    /// Persist the backfill low-water cursor inside the batch transaction so
    /// a restart resumes exactly after the last committed batch.
    pub(crate) async fn set_backfill_cursor_tx(
        conn: &mut SqliteConnection,
        folder_id: i64,
        cursor: Option<i64>,
        state: FolderState,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE folders SET backfill_uid = ?, sync_state = ? WHERE id = ?")
            .bind(cursor)
            .bind(state)
            .bind(folder_id)
            .execute(conn)
            .await?;
        Ok(())
    }

    /// Wipe the local index for a folder whose UIDVALIDITY changed and reset
    /// it to `new`. Runs inside the transaction that also enqueues the
    /// `folder.updated` event; no per-message events are emitted.
    pub(crate) async fn purge_folder_tx(
        conn: &mut SqliteConnection,
        account_id: i64,
        folder_id: i64,
    ) -> Result<u64, sqlx::Error> {
        let purged = sqlx::query("DELETE FROM messages WHERE account_id = ? AND folder_id = ?")
            .bind(account_id)
            .bind(folder_id)
            .execute(&mut *conn)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM expunge_tombstones WHERE account_id = ? AND folder_id = ?")
            .bind(account_id)
            .bind(folder_id)
            .execute(&mut *conn)
            .await?;
        sqlx::query(
            r#"
            UPDATE folders
            SET sync_state = 'new', uidvalidity = NULL, uidnext = NULL,
                highestmodseq = NULL, exists_count = 0, backfill_uid = NULL
            WHERE id = ?
            "#,
        )
        .bind(folder_id)
        .execute(&mut *conn)
        .await?;
        Ok(purged)
    }
}
