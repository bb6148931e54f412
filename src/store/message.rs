// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use sqlx::SqliteConnection;

use crate::imap::types::{Address, MessageMeta};
use crate::store::{now_ts, Store};

/// One Message Index Entry. Metadata only; bodies are never persisted.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MessageRow {
    pub account_id: i64,
    pub folder_id: i64,
    pub uid: i64,
    pub internal_date: Option<i64>,
    pub subject: Option<String>,
    pub from_addrs: String,
    pub to_addrs: String,
    pub cc_addrs: String,
    pub bcc_addrs: String,
    pub message_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub references_ids: String,
    pub size: Option<i64>,
    pub flags: String,
    pub thread_id: String,
    pub first_seen_at: i64,
}

fn to_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "[]".to_string())
}

impl MessageRow {
    pub fn from_meta(
        account_id: i64,
        folder_id: i64,
        meta: &MessageMeta,
        thread_id: String,
    ) -> Self {
        Self {
            account_id,
            folder_id,
            uid: meta.uid as i64,
            internal_date: meta.internal_date.map(|dt| dt.timestamp()),
            subject: meta.envelope.subject.clone(),
            from_addrs: to_json(&meta.envelope.from),
            to_addrs: to_json(&meta.envelope.to),
            cc_addrs: to_json(&meta.envelope.cc),
            bcc_addrs: to_json(&meta.envelope.bcc),
            message_id: meta.envelope.message_id.clone(),
            in_reply_to: meta.envelope.in_reply_to.clone(),
            references_ids: to_json(&meta.envelope.references),
            size: meta.size.map(|s| s as i64),
            flags: to_json(&meta.flags),
            thread_id,
            first_seen_at: now_ts(),
        }
    }

    pub fn flag_set(&self) -> Vec<String> {
        serde_json::from_str(&self.flags).unwrap_or_default()
    }

    pub fn from_list(&self) -> Vec<Address> {
        serde_json::from_str(&self.from_addrs).unwrap_or_default()
    }

    pub fn to_list(&self) -> Vec<Address> {
        serde_json::from_str(&self.to_addrs).unwrap_or_default()
    }

    pub fn cc_list(&self) -> Vec<Address> {
        serde_json::from_str(&self.cc_addrs).unwrap_or_default()
    }
}

impl Store {
    pub async fn max_uid(&self, account_id: i64, folder_id: i64) -> Result<i64, sqlx::Error> {
        let max: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(uid) FROM messages WHERE account_id = ? AND folder_id = ?",
        )
        .bind(account_id)
        .bind(folder_id)
        .fetch_one(self.pool())
        .await?;
        Ok(max.unwrap_or(0))
    }

    pub async fn message_count(
        &self,
        account_id: i64,
        folder_id: i64,
    ) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages WHERE account_id = ? AND folder_id = ?",
        )
        .bind(account_id)
        .bind(folder_id)
        .fetch_one(self.pool())
        .await
    }

    pub async fn message(
        &self,
        account_id: i64,
        folder_id: i64,
        uid: i64,
    ) -> Result<Option<MessageRow>, sqlx::Error> {
        sqlx::query_as::<_, MessageRow>(
            "SELECT * FROM messages WHERE account_id = ? AND folder_id = ? AND uid = ?",
        )
        .bind(account_id)
        .bind(folder_id)
        .bind(uid)
        .fetch_optional(self.pool())
        .await
    }

    pub async fn message_uids(
        &self,
        account_id: i64,
        folder_id: i64,
    ) -> Result<Vec<i64>, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT uid FROM messages WHERE account_id = ? AND folder_id = ? ORDER BY uid",
        )
        .bind(account_id)
        .bind(folder_id)
        .fetch_all(self.pool())
        .await
    }

    pub async fn messages_in_range(
        &self,
        account_id: i64,
        folder_id: i64,
        lo: i64,
        hi: i64,
    ) -> Result<Vec<MessageRow>, sqlx::Error> {
        sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT * FROM messages
            WHERE account_id = ? AND folder_id = ? AND uid BETWEEN ? AND ?
            ORDER BY uid
            "#,
        )
        .bind(account_id)
        .bind(folder_id)
        .bind(lo)
        .bind(hi)
        .fetch_all(self.pool())
        .await
    }

    pub(crate) async fn message_exists_tx(
        conn: &mut SqliteConnection,
        account_id: i64,
        folder_id: i64,
        uid: i64,
    ) -> Result<bool, sqlx::Error> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages WHERE account_id = ? AND folder_id = ? AND uid = ?",
        )
        .bind(account_id)
        .bind(folder_id)
        .bind(uid)
        .fetch_one(conn)
        .await?;
        Ok(count > 0)
    }

    pub(crate) async fn is_tombstoned_tx(
        conn: &mut SqliteConnection,
        account_id: i64,
        folder_id: i64,
        uid: i64,
    ) -> Result<bool, sqlx::Error> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM expunge_tombstones WHERE account_id = ? AND folder_id = ? AND uid = ?",
        )
        .bind(account_id)
        .bind(folder_id)
        .bind(uid)
        .fetch_one(conn)
        .await?;
        Ok(count > 0)
    }

    pub(crate) async fn upsert_message_tx(
        conn: &mut SqliteConnection,
        row: &MessageRow,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO messages (
                account_id, folder_id, uid, internal_date, subject,
                from_addrs, to_addrs, cc_addrs, bcc_addrs,
                message_id, in_reply_to, references_ids,
                size, flags, thread_id, first_seen_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(account_id, folder_id, uid) DO UPDATE SET
                internal_date = excluded.internal_date,
                subject = excluded.subject,
                from_addrs = excluded.from_addrs,
                to_addrs = excluded.to_addrs,
                cc_addrs = excluded.cc_addrs,
                bcc_addrs = excluded.bcc_addrs,
                message_id = excluded.message_id,
                in_reply_to = excluded.in_reply_to,
                references_ids = excluded.references_ids,
                size = excluded.size,
                flags = excluded.flags,
                thread_id = excluded.thread_id
            "#,
        )
        .bind(row.account_id)
        .bind(row.folder_id)
        .bind(row.uid)
        .bind(row.internal_date)
        .bind(&row.subject)
        .bind(&row.from_addrs)
        .bind(&row.to_addrs)
        .bind(&row.cc_addrs)
        .bind(&row.bcc_addrs)
        .bind(&row.message_id)
        .bind(&row.in_reply_to)
        .bind(&row.references_ids)
        .bind(row.size)
        .bind(&row.flags)
        .bind(&row.thread_id)
        .bind(row.first_seen_at)
        .execute(conn)
        .await?;
        Ok(())
    }

    pub(crate) async fn update_flags_tx(
        conn: &mut SqliteConnection,
        account_id: i64,
        folder_id: i64,
        uid: i64,
        flags: &[String],
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE messages SET flags = ? WHERE account_id = ? AND folder_id = ? AND uid = ?",
        )
        .bind(to_json(&flags))
        .bind(account_id)
        .bind(folder_id)
        .bind(uid)
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Remove an expunged message and leave a tombstone behind.
    pub(crate) async fn tombstone_tx(
        conn: &mut SqliteConnection,
        account_id: i64,
        folder_id: i64,
        uid: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM messages WHERE account_id = ? AND folder_id = ? AND uid = ?")
            .bind(account_id)
            .bind(folder_id)
            .bind(uid)
            .execute(&mut *conn)
            .await?;
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO expunge_tombstones (account_id, folder_id, uid, removed_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(account_id)
        .bind(folder_id)
        .bind(uid)
        .bind(now_ts())
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn tombstoned_uids(
        &self,
        account_id: i64,
        folder_id: i64,
    ) -> Result<Vec<i64>, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT uid FROM expunge_tombstones WHERE account_id = ? AND folder_id = ? ORDER BY uid",
        )
        .bind(account_id)
        .bind(folder_id)
        .fetch_all(self.pool())
        .await
    }
}
