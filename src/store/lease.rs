// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Worker leases and the coordinator leadership row.

use sqlx::QueryBuilder;

use crate::store::Store;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WorkerLeaseRow {
    pub worker_id: String,
    pub heartbeat_at: i64,
    pub generation: i64,
    pub started_at: i64,
}

impl Store {
    pub async fn heartbeat_worker(&self, worker_id: &str, now: i64) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO worker_leases (worker_id, heartbeat_at, generation, started_at)
            VALUES (?, ?, 0, ?)
            ON CONFLICT(worker_id) DO UPDATE SET
                heartbeat_at = excluded.heartbeat_at,
                generation = worker_leases.generation + 1
            "#,
        )
        .bind(worker_id)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn remove_worker_lease(&self, worker_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM worker_leases WHERE worker_id = ?")
            .bind(worker_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Workers whose heartbeat is fresher than `max_age_secs`.
    pub async fn live_workers(
        &self,
        now: i64,
        max_age_secs: i64,
    ) -> Result<Vec<String>, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT worker_id FROM worker_leases WHERE heartbeat_at >= ? ORDER BY worker_id",
        )
        .bind(now - max_age_secs)
        .fetch_all(self.pool())
        .await
    }

    /// Workers considered dead: heartbeat older than `max_age_secs` (two
    /// missed heartbeat intervals).
    pub async fn dead_workers(
        &self,
        now: i64,
        max_age_secs: i64,
    ) -> Result<Vec<String>, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT worker_id FROM worker_leases WHERE heartbeat_at < ? ORDER BY worker_id",
        )
        .bind(now - max_age_secs)
        .fetch_all(self.pool())
        .await
    }

    pub async fn prune_leases(&self, workers: &[String]) -> Result<(), sqlx::Error> {
        if workers.is_empty() {
            return Ok(());
        }
        let mut qb = QueryBuilder::new("DELETE FROM worker_leases WHERE worker_id IN (");
        let mut separated = qb.separated(", ");
        for worker in workers {
            separated.push_bind(worker);
        }
        separated.push_unseparated(")");
        qb.build().execute(self.pool()).await?;
        Ok(())
    }

    /// Take or renew coordinator leadership. The lease row has a TTL; any
    /// worker may claim it once it expires.
    pub async fn try_acquire_leadership(
        &self,
        candidate: &str,
        now: i64,
        ttl_secs: i64,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE coordinator_lease
            SET leader_id = ?, expires_at = ?
            WHERE id = 1 AND (leader_id IS NULL OR leader_id = ? OR expires_at < ?)
            "#,
        )
        .bind(candidate)
        .bind(now + ttl_secs)
        .bind(candidate)
        .bind(now)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn current_leader(&self) -> Result<Option<String>, sqlx::Error> {
        sqlx::query_scalar("SELECT leader_id FROM coordinator_lease WHERE id = 1")
            .fetch_one(self.pool())
            .await
    }
}
