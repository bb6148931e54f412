// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Webhook subscriptions and the durable delivery queue.
//!
//! Deliveries are enqueued in the same transaction as the index write that
//! produced the event, which is what makes enqueue exactly-once. Claiming
//! respects per-(account, subscription) ordering: only the earliest pending
//! delivery of each pair is ever handed out, and a claim takes a short
//! lease (`locked_by` / `locked_until`) in the same atomic statement so
//! dispatchers in other worker processes cannot POST the same row twice.
//! Abandoned leases expire and the row becomes claimable again.

use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use uuid::Uuid;

use crate::store::{now_ts, AccountRow, Store};
use crate::webhook::payload::{envelope_json, Event, TriggerKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Expired,
    PermanentlyFailed,
}

impl DeliveryStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeliveryStatus::Pending)
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SubscriptionRow {
    pub id: i64,
    pub application_id: String,
    pub url: String,
    pub secret: String,
    pub triggers: String,
    pub enabled: bool,
}

impl SubscriptionRow {
    pub fn trigger_kinds(&self) -> Vec<TriggerKind> {
        serde_json::from_str::<Vec<String>>(&self.triggers)
            .unwrap_or_default()
            .iter()
            .filter_map(|s| TriggerKind::parse(s))
            .collect()
    }

    pub fn wants(&self, kind: TriggerKind) -> bool {
        self.enabled && self.trigger_kinds().contains(&kind)
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeliveryRow {
    pub id: i64,
    pub public_id: String,
    pub subscription_id: i64,
    pub account_id: i64,
    pub event_seq: i64,
    pub trigger_kind: String,
    pub payload: String,
    pub status: DeliveryStatus,
    pub attempts: i64,
    pub next_attempt_at: i64,
    pub locked_by: Option<String>,
    pub locked_until: Option<i64>,
    pub last_status: Option<i64>,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub delivered_at: Option<i64>,
}

impl Store {
    pub async fn create_subscription(
        &self,
        application_id: &str,
        url: &str,
        secret: &str,
        triggers: &[TriggerKind],
    ) -> Result<SubscriptionRow, sqlx::Error> {
        let triggers_json = serde_json::to_string(
            &triggers.iter().map(|t| t.as_str()).collect::<Vec<_>>(),
        )
        .unwrap_or_else(|_| "[]".to_string());
        let id = sqlx::query(
            r#"
            INSERT INTO webhook_subscriptions (application_id, url, secret, triggers, enabled)
            VALUES (?, ?, ?, ?, 1)
            "#,
        )
        .bind(application_id)
        .bind(url)
        .bind(secret)
        .bind(triggers_json)
        .execute(self.pool())
        .await?
        .last_insert_rowid();
        self.subscription(id).await?.ok_or(sqlx::Error::RowNotFound)
    }

    pub async fn subscription(&self, id: i64) -> Result<Option<SubscriptionRow>, sqlx::Error> {
        sqlx::query_as::<_, SubscriptionRow>("SELECT * FROM webhook_subscriptions WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await
    }

    /// Fan an event out to every enabled subscription of the owning
    /// application that subscribes to its kind. Must run inside the same
    /// transaction as the state change that produced the event.
    pub(crate) async fn enqueue_event_tx(
        conn: &mut SqliteConnection,
        account: &AccountRow,
        event: &Event,
    ) -> Result<usize, sqlx::Error> {
        let subs = sqlx::query_as::<_, SubscriptionRow>(
            "SELECT * FROM webhook_subscriptions WHERE application_id = ? AND enabled = 1",
        )
        .bind(&account.application_id)
        .fetch_all(&mut *conn)
        .await?;

        let targets: Vec<&SubscriptionRow> =
            subs.iter().filter(|s| s.wants(event.kind)).collect();
        if targets.is_empty() {
            return Ok(0);
        }

        let seq: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(event_seq), 0) + 1 FROM webhook_deliveries WHERE account_id = ?",
        )
        .bind(account.id)
        .fetch_one(&mut *conn)
        .await?;

        let now = now_ts();
        for sub in targets.iter() {
            let public_id = Uuid::new_v4().to_string();
            let body = envelope_json(
                &public_id,
                event.kind,
                now,
                &account.application_id,
                &event.object,
            );
            sqlx::query(
                r#"
                INSERT INTO webhook_deliveries (
                    public_id, subscription_id, account_id, event_seq,
                    trigger_kind, payload, status, next_attempt_at, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, 'pending', ?, ?)
                "#,
            )
            .bind(&public_id)
            .bind(sub.id)
            .bind(account.id)
            .bind(seq)
            .bind(event.kind.as_str())
            .bind(body.to_string())
            .bind(now)
            .bind(now)
            .execute(&mut *conn)
            .await?;
        }
        Ok(targets.len())
    }

    /// Standalone enqueue for events that do not ride an index transaction
    /// (account lifecycle notifications).
    pub async fn enqueue_event(
        &self,
        account: &AccountRow,
        event: &Event,
    ) -> Result<usize, sqlx::Error> {
        let mut tx = self.begin().await?;
        let n = Self::enqueue_event_tx(&mut tx, account, event).await?;
        tx.commit().await?;
        Ok(n)
    }

    /// Atomically claim due deliveries, at most one per (account,
    /// subscription): the earliest pending event of a pair gates everything
    /// behind it. The claim writes a lease in the same statement, so a row
    /// another dispatcher holds (or one whose head is in flight) is simply
    /// not returned; a lease left behind by a dead dispatcher expires and
    /// the row is handed out again.
    pub async fn claim_due_deliveries(
        &self,
        claimant: &str,
        now: i64,
        lease_secs: i64,
        limit: i64,
    ) -> Result<Vec<DeliveryRow>, sqlx::Error> {
        let mut claimed = sqlx::query_as::<_, DeliveryRow>(
            r#"
            UPDATE webhook_deliveries
            SET locked_by = ?, locked_until = ?
            WHERE id IN (
                SELECT d.id FROM webhook_deliveries d
                JOIN (
                    SELECT subscription_id, account_id, MIN(event_seq) AS head_seq
                    FROM webhook_deliveries
                    WHERE status = 'pending'
                    GROUP BY subscription_id, account_id
                ) head
                  ON head.subscription_id = d.subscription_id
                 AND head.account_id = d.account_id
                 AND head.head_seq = d.event_seq
                WHERE d.status = 'pending'
                  AND d.next_attempt_at <= ?
                  AND (d.locked_until IS NULL OR d.locked_until < ?)
                ORDER BY d.account_id, d.event_seq
                LIMIT ?
            )
            RETURNING *
            "#,
        )
        .bind(claimant)
        .bind(now + lease_secs)
        .bind(now)
        .bind(now)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        claimed.sort_by_key(|d| (d.account_id, d.event_seq));
        Ok(claimed)
    }

    pub async fn mark_delivery_delivered(
        &self,
        id: i64,
        http_status: u16,
        now: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE webhook_deliveries
            SET status = 'delivered', attempts = attempts + 1, last_status = ?,
                last_error = NULL, delivered_at = ?,
                locked_by = NULL, locked_until = NULL
            WHERE id = ?
            "#,
        )
        .bind(http_status as i64)
        .bind(now)
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn mark_delivery_retry(
        &self,
        id: i64,
        next_attempt_at: i64,
        http_status: Option<u16>,
        error: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE webhook_deliveries
            SET attempts = attempts + 1, next_attempt_at = ?, last_status = ?, last_error = ?,
                locked_by = NULL, locked_until = NULL
            WHERE id = ?
            "#,
        )
        .bind(next_attempt_at)
        .bind(http_status.map(|s| s as i64))
        .bind(error)
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn mark_delivery_terminal(
        &self,
        id: i64,
        status: DeliveryStatus,
        http_status: Option<u16>,
        error: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE webhook_deliveries
            SET status = ?, attempts = attempts + 1, last_status = ?, last_error = ?,
                locked_by = NULL, locked_until = NULL
            WHERE id = ?
            "#,
        )
        .bind(status)
        .bind(http_status.map(|s| s as i64))
        .bind(error)
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Deliveries for one account in event order. Mostly for verification.
    pub async fn deliveries_for_account(
        &self,
        account_id: i64,
    ) -> Result<Vec<DeliveryRow>, sqlx::Error> {
        sqlx::query_as::<_, DeliveryRow>(
            r#"
            SELECT * FROM webhook_deliveries
            WHERE account_id = ?
            ORDER BY event_seq, subscription_id
            "#,
        )
        .bind(account_id)
        .fetch_all(self.pool())
        .await
    }

    /// Reset a delivery to pending. A delivered event reset this way gets
    /// exactly one more POST.
    pub async fn reset_delivery_pending(&self, id: i64, now: i64) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE webhook_deliveries
            SET status = 'pending', next_attempt_at = ?, delivered_at = NULL,
                locked_by = NULL, locked_until = NULL
            WHERE id = ?
            "#,
        )
        .bind(now)
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
