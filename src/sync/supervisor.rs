// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Account supervisor: owns every folder sync unit for one account.
//!
//! Discovers folders, launches units, restarts transient failures with
//! exponential backoff and full jitter, and quiesces the whole account on
//! authentication failure. Single-tenant by construction; the only shared
//! resources are the session pool and host limiter.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use rand::Rng;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::imap::SessionPool;
use crate::store::{AccountRow, AccountState, FolderState, Store};
use crate::sync::folder::{FolderSyncUnit, UnitExit};
use crate::sync::{SyncConfig, SyncError};
use crate::webhook::payload::{account_object, Event, TriggerKind};

/// Why the supervisor stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorExit {
    Cancelled,
    /// Credentials rejected; account moved to auth_error and quiesced.
    AuthError,
    /// Assignment moved to another worker (stale lease generation).
    Yielded,
}

pub struct AccountSupervisor {
    store: Store,
    pool: Arc<SessionPool>,
    account: AccountRow,
    config: SyncConfig,
    cancel: CancellationToken,
    /// Worker identity and the assignment generation this supervisor was
    /// started under; `None` in single-process mode.
    assignment: Option<(String, i64)>,
}

impl AccountSupervisor {
    pub fn new(
        store: Store,
        pool: Arc<SessionPool>,
        account: AccountRow,
        config: SyncConfig,
        cancel: CancellationToken,
        assignment: Option<(String, i64)>,
    ) -> Self {
        Self {
            store,
            pool,
            account,
            config,
            cancel,
            assignment,
        }
    }

    pub async fn run(mut self) -> Result<SupervisorExit, SyncError> {
        let unit_cancel = self.cancel.child_token();
        let mut units: JoinSet<(String, Result<UnitExit, SyncError>)> = JoinSet::new();
        let mut running: HashMap<String, ()> = HashMap::new();
        let mut attempts: HashMap<String, u32> = HashMap::new();

        // Initial discovery doubles as the credential check.
        match self.discover_folders().await {
            Ok(names) => {
                for name in names {
                    self.spawn_unit(&mut units, &mut running, &unit_cancel, name);
                }
            }
            Err(e) if e.is_auth() => {
                self.fail_auth(&e).await?;
                return Ok(SupervisorExit::AuthError);
            }
            Err(e) => return Err(e),
        }

        let mut refresh = tokio::time::interval(self.config.folder_refresh);
        refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        refresh.tick().await; // immediate first tick already handled above

        let cancelled = self.cancel.clone();
        loop {
            tokio::select! {
                _ = cancelled.cancelled() => {
                    unit_cancel.cancel();
                    while units.join_next().await.is_some() {}
                    return Ok(SupervisorExit::Cancelled);
                }
                _ = refresh.tick() => {
                    if self.assignment_is_stale().await? {
                        info!("{}: assignment moved, yielding", self.account.email);
                        unit_cancel.cancel();
                        while units.join_next().await.is_some() {}
                        return Ok(SupervisorExit::Yielded);
                    }
                    match self.discover_folders().await {
                        Ok(names) => {
                            for name in names {
                                if !running.contains_key(&name) {
                                    self.spawn_unit(&mut units, &mut running, &unit_cancel, name);
                                }
                            }
                        }
                        Err(e) if e.is_auth() => {
                            unit_cancel.cancel();
                            while units.join_next().await.is_some() {}
                            self.fail_auth(&e).await?;
                            return Ok(SupervisorExit::AuthError);
                        }
                        Err(e) => warn!("{}: folder listing failed: {}", self.account.email, e),
                    }
                }
                Some(joined) = units.join_next() => {
                    let (name, outcome) = match joined {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!("{}: unit task panicked: {}", self.account.email, e);
                            continue;
                        }
                    };
                    running.remove(&name);
                    match outcome {
                        Ok(UnitExit::Cancelled) => {}
                        Ok(UnitExit::Orphaned) => {
                            info!("{}/{} orphaned, unit stopped", self.account.email, name);
                            attempts.remove(&name);
                        }
                        Err(e) if e.is_auth() => {
                            unit_cancel.cancel();
                            while units.join_next().await.is_some() {}
                            self.fail_auth(&e).await?;
                            return Ok(SupervisorExit::AuthError);
                        }
                        Err(e) => {
                            let n = attempts.entry(name.clone()).or_insert(0);
                            *n += 1;
                            let delay = restart_backoff(self.config.restart_base, self.config.restart_cap, *n);
                            warn!(
                                "{}/{} unit error ({}), restart #{} in {:?}",
                                self.account.email, name, e, n, delay
                            );
                            let respawn_cancel = unit_cancel.clone();
                            let unit = self.make_unit(name.clone(), unit_cancel.child_token());
                            running.insert(name.clone(), ());
                            units.spawn(async move {
                                tokio::select! {
                                    _ = tokio::time::sleep(delay) => {}
                                    _ = respawn_cancel.cancelled() => {
                                        return (name, Ok(UnitExit::Cancelled));
                                    }
                                }
                                let result = unit.run().await;
                                (name, result)
                            });
                        }
                    }
                }
            }
        }
    }

    /// LIST the hierarchy and persist any new folders. The first successful
    /// listing flips a provisioning account to active and announces it.
    pub async fn discover_folders(&mut self) -> Result<Vec<String>, SyncError> {
        let lease = self.pool.borrow(&self.account).await?;
        let result = lease.session().list_folders().await;
        match result {
            Ok(names) => {
                self.pool.give_back(lease).await;
                for name in &names {
                    let folder = self.store.upsert_folder(self.account.id, name).await?;
                    // A folder that vanished and came back starts over.
                    if folder.sync_state == FolderState::Orphaned {
                        self.store
                            .set_folder_state(folder.id, FolderState::New, None)
                            .await?;
                    }
                }
                if self.account.state == AccountState::Provisioning {
                    self.store
                        .set_account_state(self.account.id, AccountState::Active, None)
                        .await?;
                    self.store
                        .enqueue_event(
                            &self.account,
                            &Event::new(
                                TriggerKind::AccountConnected,
                                account_object(&self.account),
                            ),
                        )
                        .await?;
                    self.account.state = AccountState::Active;
                    info!("{} connected", self.account.email);
                }
                Ok(names)
            }
            Err(e) => {
                drop(lease);
                Err(e.into())
            }
        }
    }

    fn make_unit(&self, folder_name: String, cancel: CancellationToken) -> FolderSyncUnit {
        FolderSyncUnit::new(
            self.store.clone(),
            Arc::clone(&self.pool),
            self.account.clone(),
            folder_name,
            self.config.clone(),
            cancel,
        )
    }

    fn spawn_unit(
        &self,
        units: &mut JoinSet<(String, Result<UnitExit, SyncError>)>,
        running: &mut HashMap<String, ()>,
        unit_cancel: &CancellationToken,
        name: String,
    ) {
        debug!("{}: starting unit for {}", self.account.email, name);
        let unit = self.make_unit(name.clone(), unit_cancel.child_token());
        running.insert(name.clone(), ());
        units.spawn(async move {
            let result = unit.run().await;
            (name, result)
        });
    }

    /// A supervisor never acts on an account whose lease generation moved on.
    async fn assignment_is_stale(&self) -> Result<bool, SyncError> {
        let (worker_id, generation) = match &self.assignment {
            Some(a) => a,
            None => return Ok(false),
        };
        match self.store.account_assignment(self.account.id).await? {
            Some((assigned, current_gen)) => {
                Ok(assigned.as_deref() != Some(worker_id.as_str()) || current_gen != *generation)
            }
            None => Ok(true),
        }
    }

    async fn fail_auth(&self, err: &SyncError) -> Result<(), SyncError> {
        error!("{}: authentication failed: {}", self.account.email, err);
        self.pool.evict_account(self.account.id).await;
        self.store
            .set_account_state(
                self.account.id,
                AccountState::AuthError,
                Some(&err.to_string()),
            )
            .await?;
        self.store
            .enqueue_event(
                &self.account,
                &Event::new(
                    TriggerKind::AccountInvalidCredentials,
                    account_object(&self.account),
                ),
            )
            .await?;
        Ok(())
    }
}

/// Exponential backoff with full jitter: uniform in [0, base * 2^(n-1)],
/// capped.
pub fn restart_backoff(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let ceiling = base
        .saturating_mul(2u32.saturating_pow(exp))
        .min(cap);
    let millis = ceiling.as_millis().max(1) as u64;
    Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
}
