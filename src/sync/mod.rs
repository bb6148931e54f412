// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The sync engine: per-folder state machines under per-account supervisors.

use std::time::Duration;

use thiserror::Error;

use crate::imap::{ImapError, PoolError};

pub mod folder;
pub mod supervisor;
pub mod threading;

pub use folder::{FolderSyncUnit, UnitExit};
pub use supervisor::AccountSupervisor;

/// Tuning for folder sync units and their supervisors.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub backfill_batch: usize,
    /// Service-wide default backfill bound; 0 means all history. A non-zero
    /// per-account horizon wins.
    pub backfill_horizon: i64,
    pub idle_wait: Duration,
    pub poll_fallback: Duration,
    pub flag_window: u32,
    pub restart_base: Duration,
    pub restart_cap: Duration,
    pub folder_refresh: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            backfill_batch: 200,
            backfill_horizon: 0,
            idle_wait: Duration::from_secs(28 * 60),
            poll_fallback: Duration::from_secs(60),
            flag_window: 500,
            restart_base: Duration::from_secs(2),
            restart_cap: Duration::from_secs(300),
            folder_refresh: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("imap: {0}")]
    Imap(#[from] ImapError),
    #[error("pool: {0}")]
    Pool(#[from] PoolError),
    #[error("database: {0}")]
    Db(#[from] sqlx::Error),
    #[error("folder {0} failed after repeated protocol errors")]
    FolderFailed(String),
}

impl SyncError {
    /// True only for a login the server actually rejected. Operational
    /// failures to resolve credential material stay out of this class and
    /// get the retry-with-backoff treatment instead.
    pub fn is_auth(&self) -> bool {
        match self {
            SyncError::Imap(e) => e.is_auth(),
            SyncError::Pool(e) => e.is_auth(),
            _ => false,
        }
    }
}
