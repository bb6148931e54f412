// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Worker process: hosts account supervisors and reports liveness.
//!
//! In `cluster` mode the worker syncs exactly the accounts the coordinator
//! assigned to its id; in `single` mode it syncs every active account. The
//! assignment set and account lifecycle changes are re-read every poll
//! interval. Shutdown cancels all supervisors and waits out the grace
//! deadline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::imap::SessionPool;
use crate::store::{now_ts, AccountRow, AccountState, FolderState, Store};
use crate::sync::supervisor::{restart_backoff, AccountSupervisor, SupervisorExit};
use crate::sync::SyncConfig;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub supervisor_cap: usize,
    pub heartbeat_interval: Duration,
    pub poll_interval: Duration,
    pub grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            supervisor_cap: 500,
            heartbeat_interval: Duration::from_secs(5),
            poll_interval: Duration::from_secs(2),
            grace: Duration::from_secs(20),
        }
    }
}

/// How this worker decides which accounts it owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentMode {
    /// Single-process deployment: all active accounts, no coordinator.
    All,
    /// Cluster deployment: only accounts leased to this worker id.
    Assigned,
}

struct SupervisorHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    generation: i64,
}

pub struct Worker {
    store: Store,
    pool: Arc<SessionPool>,
    sync_config: SyncConfig,
    config: WorkerConfig,
    worker_id: String,
    mode: AssignmentMode,
}

impl Worker {
    pub fn new(
        store: Store,
        pool: Arc<SessionPool>,
        sync_config: SyncConfig,
        config: WorkerConfig,
        worker_id: String,
        mode: AssignmentMode,
    ) -> Self {
        Self {
            store,
            pool,
            sync_config,
            config,
            worker_id,
            mode,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub async fn run(&self, cancel: CancellationToken) {
        info!("worker {} started ({:?} mode)", self.worker_id, self.mode);
        let mut supervisors: HashMap<i64, SupervisorHandle> = HashMap::new();

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        let mut poll = tokio::time::interval(self.config.poll_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = heartbeat.tick() => {
                    if let Err(e) = self.store.heartbeat_worker(&self.worker_id, now_ts()).await {
                        error!("worker {} heartbeat failed: {}", self.worker_id, e);
                    }
                }
                _ = poll.tick() => {
                    self.reconcile(&cancel, &mut supervisors).await;
                }
            }
        }

        info!(
            "worker {} shutting down, cancelling {} supervisors",
            self.worker_id,
            supervisors.len()
        );
        for handle in supervisors.values() {
            handle.cancel.cancel();
        }
        let drain = async {
            for (_, handle) in supervisors.drain() {
                let _ = handle.task.await;
            }
        };
        if tokio::time::timeout(self.config.grace, drain).await.is_err() {
            warn!(
                "worker {} grace deadline elapsed with supervisors still stopping",
                self.worker_id
            );
        }
        if let Err(e) = self.store.remove_worker_lease(&self.worker_id).await {
            warn!("worker {} failed to drop lease: {}", self.worker_id, e);
        }
        info!("worker {} stopped", self.worker_id);
    }

    /// Bring the running supervisor set in line with the desired account
    /// set.
    async fn reconcile(
        &self,
        cancel: &CancellationToken,
        supervisors: &mut HashMap<i64, SupervisorHandle>,
    ) {
        let desired = match self.mode {
            AssignmentMode::All => self.store.active_accounts().await,
            AssignmentMode::Assigned => self.store.accounts_for_worker(&self.worker_id).await,
        };
        let desired = match desired {
            Ok(accounts) => accounts,
            Err(e) => {
                error!("worker {} failed to read assignments: {}", self.worker_id, e);
                return;
            }
        };
        let desired_by_id: HashMap<i64, &AccountRow> =
            desired.iter().map(|a| (a.id, a)).collect();

        // Stop supervisors for accounts we no longer own (or whose lease
        // generation moved).
        let stale: Vec<i64> = supervisors
            .iter()
            .filter(|(id, handle)| match desired_by_id.get(id) {
                Some(account) => {
                    self.mode == AssignmentMode::Assigned
                        && account.assignment_generation != handle.generation
                }
                None => true,
            })
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            if let Some(handle) = supervisors.remove(&id) {
                info!("worker {} releasing account {}", self.worker_id, id);
                handle.cancel.cancel();
            }
            self.quiesce_if_retired(id).await;
        }

        // Reap naturally finished supervisors so they can restart on the
        // next pass if still desired.
        supervisors.retain(|_, handle| !handle.task.is_finished());

        for account in &desired {
            if supervisors.contains_key(&account.id) {
                continue;
            }
            if supervisors.len() >= self.config.supervisor_cap {
                warn!(
                    "worker {} at supervisor cap ({}), leaving account {} unserved",
                    self.worker_id, self.config.supervisor_cap, account.id
                );
                break;
            }
            supervisors.insert(account.id, self.start_supervisor(cancel, account));
        }
    }

    /// A disabled or deleted account gives up its sessions and its folders
    /// leave the sync rotation.
    async fn quiesce_if_retired(&self, account_id: i64) {
        let account = match self.store.account(account_id).await {
            Ok(Some(account)) => account,
            _ => return,
        };
        if !matches!(
            account.state,
            AccountState::Disabled | AccountState::Deleted
        ) {
            return;
        }
        self.pool.evict_account(account_id).await;
        if let Ok(folders) = self.store.folders(account_id).await {
            for folder in folders {
                if folder.sync_state != FolderState::Orphaned {
                    if let Err(e) = self
                        .store
                        .set_folder_state(
                            folder.id,
                            FolderState::Orphaned,
                            None,
                        )
                        .await
                    {
                        warn!(
                            "failed to orphan folder {} of retired account {}: {}",
                            folder.id, account_id, e
                        );
                    }
                }
            }
        }
        info!("worker {} quiesced retired account {}", self.worker_id, account_id);
    }

    fn start_supervisor(
        &self,
        cancel: &CancellationToken,
        account: &AccountRow,
    ) -> SupervisorHandle {
        let supervisor_cancel = cancel.child_token();
        let store = self.store.clone();
        let pool = Arc::clone(&self.pool);
        let sync_config = self.sync_config.clone();
        let account_id = account.id;
        let email = account.email.clone();
        let assignment = match self.mode {
            AssignmentMode::All => None,
            AssignmentMode::Assigned => {
                Some((self.worker_id.clone(), account.assignment_generation))
            }
        };
        let task_cancel = supervisor_cancel.clone();
        let restart_base = sync_config.restart_base;
        let restart_cap = sync_config.restart_cap;

        info!("worker {} starting supervisor for {}", self.worker_id, email);
        let task = tokio::spawn(async move {
            let mut attempt = 0u32;
            loop {
                if task_cancel.is_cancelled() {
                    return;
                }
                let account = match store.account(account_id).await {
                    Ok(Some(account))
                        if matches!(
                            account.state,
                            AccountState::Active | AccountState::Provisioning
                        ) =>
                    {
                        account
                    }
                    Ok(_) => return,
                    Err(e) => {
                        error!("supervisor for {} could not load account: {}", email, e);
                        return;
                    }
                };
                let supervisor = AccountSupervisor::new(
                    store.clone(),
                    pool.clone(),
                    account,
                    sync_config.clone(),
                    task_cancel.clone(),
                    assignment.clone(),
                );
                match supervisor.run().await {
                    Ok(SupervisorExit::Cancelled) => return,
                    Ok(SupervisorExit::AuthError) => {
                        info!("supervisor for {} quiesced on auth error", email);
                        return;
                    }
                    Ok(SupervisorExit::Yielded) => return,
                    Err(e) => {
                        attempt += 1;
                        let delay = restart_backoff(restart_base, restart_cap, attempt);
                        warn!(
                            "supervisor for {} failed ({}), restart #{} in {:?}",
                            email, e, attempt, delay
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = task_cancel.cancelled() => return,
                        }
                    }
                }
            }
        });

        SupervisorHandle {
            cancel: supervisor_cancel,
            task,
            generation: account.assignment_generation,
        }
    }
}
