// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use serde::{Deserialize, Serialize};
use sqlx::QueryBuilder;

use crate::store::{now_ts, Store};

/// Account lifecycle. Provisioned accounts are picked up by the coordinator
/// on the next rebalance; disabled/deleted accounts are quiesced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AccountState {
    Provisioning,
    Active,
    AuthError,
    Disabled,
    Deleted,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AccountRow {
    pub id: i64,
    pub grant_id: String,
    pub application_id: String,
    pub email: String,
    pub imap_host: String,
    pub imap_port: i64,
    pub imap_tls: bool,
    pub smtp_host: Option<String>,
    pub smtp_port: Option<i64>,
    pub auth_user: String,
    pub auth_secret: String,
    pub state: AccountState,
    pub backfill_horizon: i64,
    pub last_synced_at: Option<i64>,
    pub last_error: Option<String>,
    pub assigned_worker: Option<String>,
    pub assignment_generation: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Fields supplied by the provisioning layer when creating an account.
#[derive(Debug, Clone)]
pub struct NewAccount<'a> {
    pub grant_id: &'a str,
    pub application_id: &'a str,
    pub email: &'a str,
    pub imap_host: &'a str,
    pub imap_port: u16,
    pub auth_user: &'a str,
    /// Already sealed by the credential cipher; opaque here.
    pub auth_secret: &'a str,
    pub backfill_horizon: i64,
}

impl Store {
    pub async fn create_account(&self, new: NewAccount<'_>) -> Result<AccountRow, sqlx::Error> {
        let now = now_ts();
        let id = sqlx::query(
            r#"
            INSERT INTO accounts (
                grant_id, application_id, email, imap_host, imap_port,
                auth_user, auth_secret, backfill_horizon, state, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'provisioning', ?, ?)
            "#,
        )
        .bind(new.grant_id)
        .bind(new.application_id)
        .bind(new.email)
        .bind(new.imap_host)
        .bind(new.imap_port as i64)
        .bind(new.auth_user)
        .bind(new.auth_secret)
        .bind(new.backfill_horizon)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?
        .last_insert_rowid();

        self.account(id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)
    }

    pub async fn account(&self, id: i64) -> Result<Option<AccountRow>, sqlx::Error> {
        sqlx::query_as::<_, AccountRow>("SELECT * FROM accounts WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await
    }

    /// Accounts the sync engine should own: active, plus provisioning ones
    /// awaiting their first successful connection.
    pub async fn active_accounts(&self) -> Result<Vec<AccountRow>, sqlx::Error> {
        sqlx::query_as::<_, AccountRow>(
            "SELECT * FROM accounts WHERE state IN ('active', 'provisioning') ORDER BY id",
        )
        .fetch_all(self.pool())
        .await
    }

    pub async fn accounts_for_worker(
        &self,
        worker_id: &str,
    ) -> Result<Vec<AccountRow>, sqlx::Error> {
        sqlx::query_as::<_, AccountRow>(
            r#"
            SELECT * FROM accounts
            WHERE assigned_worker = ? AND state IN ('active', 'provisioning')
            ORDER BY id
            "#,
        )
        .bind(worker_id)
        .fetch_all(self.pool())
        .await
    }

    pub async fn set_account_state(
        &self,
        id: i64,
        state: AccountState,
        last_error: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE accounts SET state = ?, last_error = ?, updated_at = ? WHERE id = ?")
            .bind(state)
            .bind(last_error)
            .bind(now_ts())
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn mark_account_synced(&self, id: i64, now: i64) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE accounts SET last_synced_at = ?, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(now)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// (assigned worker, assignment generation) for staleness checks.
    pub async fn account_assignment(
        &self,
        id: i64,
    ) -> Result<Option<(Option<String>, i64)>, sqlx::Error> {
        let row: Option<(Option<String>, i64)> = sqlx::query_as(
            "SELECT assigned_worker, assignment_generation FROM accounts WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    /// Hand an account to a worker, bumping the generation so a supervisor
    /// still holding the previous assignment will yield.
    pub async fn assign_account(&self, id: i64, worker_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE accounts
            SET assigned_worker = ?,
                assignment_generation = assignment_generation + 1,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(worker_id)
        .bind(now_ts())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Clear assignments pointing at workers that are no longer alive.
    pub async fn unassign_workers(&self, workers: &[String]) -> Result<u64, sqlx::Error> {
        if workers.is_empty() {
            return Ok(0);
        }
        let mut qb = QueryBuilder::new(
            "UPDATE accounts SET assigned_worker = NULL, updated_at = ",
        );
        qb.push_bind(now_ts());
        qb.push(" WHERE assigned_worker IN (");
        let mut separated = qb.separated(", ");
        for worker in workers {
            separated.push_bind(worker);
        }
        separated.push_unseparated(")");
        let result = qb.build().execute(self.pool()).await?;
        Ok(result.rows_affected())
    }

    /// Active account counts per assigned worker.
    pub async fn assignment_counts(&self) -> Result<Vec<(String, i64)>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT assigned_worker, COUNT(*) FROM accounts
            WHERE assigned_worker IS NOT NULL AND state IN ('active', 'provisioning')
            GROUP BY assigned_worker
            "#,
        )
        .fetch_all(self.pool())
        .await
    }
}
