// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Cluster coordinator: leader-elected account partitioning.
//!
//! Any worker may hold the coordinator lease (a TTL row). The leader marks
//! workers dead after two missed heartbeats, unassigns their accounts, and
//! places unassigned accounts by rendezvous hashing with a bounded-load cap
//! of 110% of the mean. Every reassignment bumps the account's generation;
//! a supervisor holding the old generation yields instead of fighting.

use std::collections::HashMap;
use std::time::Duration;

use log::{debug, error, info};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use crate::store::{now_ts, Store};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub heartbeat_interval_secs: i64,
    pub lease_ttl_secs: i64,
    pub rebalance_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 5,
            lease_ttl_secs: 15,
            rebalance_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RebalanceSummary {
    pub live_workers: usize,
    pub dead_workers: usize,
    pub reassigned: usize,
}

pub struct Coordinator {
    store: Store,
    worker_id: String,
    config: CoordinatorConfig,
}

impl Coordinator {
    pub fn new(store: Store, worker_id: String, config: CoordinatorConfig) -> Self {
        Self {
            store,
            worker_id,
            config,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        info!("coordinator candidate {} started", self.worker_id);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.rebalance_interval) => {}
                _ = cancel.cancelled() => return,
            }
            let now = now_ts();
            match self
                .store
                .try_acquire_leadership(&self.worker_id, now, self.config.lease_ttl_secs)
                .await
            {
                Ok(true) => {
                    if let Err(e) = self.rebalance(now).await {
                        error!("rebalance failed: {}", e);
                    }
                }
                Ok(false) => {
                    debug!("{}: not the coordinator leader", self.worker_id);
                }
                Err(e) => error!("leadership check failed: {}", e),
            }
        }
    }

    /// One rebalance pass. Public so the cluster tests drive it directly.
    pub async fn rebalance(&self, now: i64) -> Result<RebalanceSummary, sqlx::Error> {
        // Dead after two consecutive missed heartbeats.
        let dead_after = 2 * self.config.heartbeat_interval_secs;
        let live = self.store.live_workers(now, dead_after).await?;
        let dead = self.store.dead_workers(now, dead_after).await?;

        if !dead.is_empty() {
            let freed = self.store.unassign_workers(&dead).await?;
            self.store.prune_leases(&dead).await?;
            info!(
                "workers {:?} dead, {} accounts freed for reassignment",
                dead, freed
            );
        }

        let mut summary = RebalanceSummary {
            live_workers: live.len(),
            dead_workers: dead.len(),
            ..Default::default()
        };
        if live.is_empty() {
            return Ok(summary);
        }

        let accounts = self.store.active_accounts().await?;
        let mut counts: HashMap<&str, i64> = live.iter().map(|w| (w.as_str(), 0)).collect();
        for account in &accounts {
            if let Some(worker) = account.assigned_worker.as_deref() {
                if let Some(count) = counts.get_mut(worker) {
                    *count += 1;
                }
            }
        }

        // Bounded load: no worker takes more than ~110% of the mean.
        let cap = (((accounts.len() as f64) / (live.len() as f64)) * 1.1).ceil() as i64;
        let cap = cap.max(1);

        for account in &accounts {
            let assigned_to_live = account
                .assigned_worker
                .as_deref()
                .map(|w| counts.contains_key(w))
                .unwrap_or(false);
            if assigned_to_live {
                continue;
            }

            let mut ranked: Vec<&str> = live.iter().map(|w| w.as_str()).collect();
            ranked.sort_by_key(|w| std::cmp::Reverse(rendezvous_score(w, account.id)));
            let target = ranked
                .iter()
                .find(|w| counts.get(*w).copied().unwrap_or(0) < cap)
                .copied()
                .or_else(|| {
                    // Everyone at cap: fall back to the least-loaded worker.
                    counts
                        .iter()
                        .min_by_key(|(_, c)| **c)
                        .map(|(w, _)| *w)
                });

            if let Some(target) = target {
                self.store.assign_account(account.id, target).await?;
                *counts.entry(target).or_insert(0) += 1;
                summary.reassigned += 1;
            }
        }

        if summary.reassigned > 0 {
            info!(
                "rebalanced {} accounts across {} workers",
                summary.reassigned, summary.live_workers
            );
        }
        Ok(summary)
    }
}

/// Stable per-(worker, account) score for rendezvous placement.
pub fn rendezvous_score(worker_id: &str, account_id: i64) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(worker_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(account_id.to_le_bytes());
    let digest = hasher.finalize();
    u64::from_be_bytes([
        digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
    ])
}
