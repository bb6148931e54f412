// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Service configuration.
//!
//! Values come from an optional TOML file overlaid with `MAILHOOK`-prefixed
//! environment variables (`MAILHOOK_WORKER__HEARTBEAT_SECS=5`). Every knob
//! has a default so a bare environment with just a database URL runs.

use config::{Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// Maximum supervisors hosted by one worker process.
    pub supervisor_cap: usize,
    pub heartbeat_secs: u64,
    /// How often assignments and account lifecycle changes are re-read.
    pub poll_secs: u64,
    /// Shutdown grace deadline.
    pub grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImapSettings {
    pub command_timeout_secs: u64,
    /// Open sessions allowed per account (servers commonly cap around 15).
    pub per_account_sessions: usize,
    pub session_idle_ttl_secs: u64,
    pub session_max_age_secs: u64,
    pub acquire_timeout_secs: u64,
    /// Concurrent sessions allowed per IMAP host across all accounts.
    pub host_max_sessions: usize,
    /// Minimum spacing between new connection opens on one host.
    pub host_open_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Messages per backfill batch.
    pub backfill_batch: usize,
    /// Default initial-enumeration bound; 0 means all history. Accounts may
    /// override per tenant policy.
    pub backfill_horizon: i64,
    /// IDLE renewal ceiling; kept under the 29-minute protocol cap.
    pub idle_wait_secs: u64,
    /// Poll interval for servers without IDLE.
    pub poll_fallback_secs: u64,
    /// Width of the recent-UID window checked for expunges and flag changes
    /// on servers without CONDSTORE.
    pub flag_window: u32,
    pub restart_base_secs: u64,
    pub restart_cap_secs: u64,
    pub folder_refresh_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSettings {
    pub max_attempts: i64,
    pub backoff_base_secs: u64,
    pub backoff_cap_secs: u64,
    pub http_timeout_secs: u64,
    pub poll_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSettings {
    pub lease_ttl_secs: i64,
    pub rebalance_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub database_url: String,
    /// Hex-encoded 32-byte key for sealing account credentials at rest.
    pub credential_key: Option<String>,
    pub log: LogConfig,
    pub worker: WorkerSettings,
    pub imap: ImapSettings,
    pub sync: SyncSettings,
    pub webhook: WebhookSettings,
    pub cluster: ClusterSettings,
}

impl Settings {
    pub fn new(config_path: Option<&str>) -> Result<Self, config::ConfigError> {
        let path_to_use = config_path.unwrap_or("config/default.toml");

        let builder = config::Config::builder()
            .set_default("database_url", "sqlite:data/mailhook.db")?
            .set_default("log.level", "info")?
            .set_default("worker.supervisor_cap", 500_i64)?
            .set_default("worker.heartbeat_secs", 5_i64)?
            .set_default("worker.poll_secs", 2_i64)?
            .set_default("worker.grace_secs", 20_i64)?
            .set_default("imap.command_timeout_secs", 60_i64)?
            .set_default("imap.per_account_sessions", 4_i64)?
            .set_default("imap.session_idle_ttl_secs", 600_i64)?
            .set_default("imap.session_max_age_secs", 3600_i64)?
            .set_default("imap.acquire_timeout_secs", 30_i64)?
            .set_default("imap.host_max_sessions", 50_i64)?
            .set_default("imap.host_open_interval_ms", 100_i64)?
            .set_default("sync.backfill_batch", 200_i64)?
            .set_default("sync.backfill_horizon", 0_i64)?
            .set_default("sync.idle_wait_secs", 1680_i64)?
            .set_default("sync.poll_fallback_secs", 60_i64)?
            .set_default("sync.flag_window", 500_i64)?
            .set_default("sync.restart_base_secs", 2_i64)?
            .set_default("sync.restart_cap_secs", 300_i64)?
            .set_default("sync.folder_refresh_secs", 300_i64)?
            .set_default("webhook.max_attempts", 12_i64)?
            .set_default("webhook.backoff_base_secs", 30_i64)?
            .set_default("webhook.backoff_cap_secs", 3600_i64)?
            .set_default("webhook.http_timeout_secs", 30_i64)?
            .set_default("webhook.poll_secs", 2_i64)?
            .set_default("cluster.lease_ttl_secs", 15_i64)?
            .set_default("cluster.rebalance_secs", 5_i64)?
            .add_source(File::with_name(path_to_use).required(false))
            .add_source(Environment::with_prefix("MAILHOOK").separator("__"));

        builder.build()?.try_deserialize()
    }

    pub fn limiter_config(&self) -> crate::imap::LimiterConfig {
        crate::imap::LimiterConfig {
            max_sessions_per_host: self.imap.host_max_sessions,
            min_open_interval: Duration::from_millis(self.imap.host_open_interval_ms),
            acquire_timeout: Duration::from_secs(self.imap.acquire_timeout_secs),
        }
    }

    pub fn pool_config(&self) -> crate::imap::PoolConfig {
        crate::imap::PoolConfig {
            per_account_cap: self.imap.per_account_sessions,
            idle_ttl: Duration::from_secs(self.imap.session_idle_ttl_secs),
            max_session_age: Duration::from_secs(self.imap.session_max_age_secs),
            acquire_timeout: Duration::from_secs(self.imap.acquire_timeout_secs),
            capacity_backoff: Duration::from_secs(60),
        }
    }

    pub fn sync_config(&self) -> crate::sync::SyncConfig {
        crate::sync::SyncConfig {
            backfill_batch: self.sync.backfill_batch,
            backfill_horizon: self.sync.backfill_horizon,
            idle_wait: Duration::from_secs(self.sync.idle_wait_secs),
            poll_fallback: Duration::from_secs(self.sync.poll_fallback_secs),
            flag_window: self.sync.flag_window,
            restart_base: Duration::from_secs(self.sync.restart_base_secs),
            restart_cap: Duration::from_secs(self.sync.restart_cap_secs),
            folder_refresh: Duration::from_secs(self.sync.folder_refresh_secs),
        }
    }

    pub fn dispatch_config(&self) -> crate::webhook::DispatchConfig {
        crate::webhook::DispatchConfig {
            max_attempts: self.webhook.max_attempts,
            backoff_base: Duration::from_secs(self.webhook.backoff_base_secs),
            backoff_cap: Duration::from_secs(self.webhook.backoff_cap_secs),
            poll_interval: Duration::from_secs(self.webhook.poll_secs),
            claim_batch: 32,
            // The claim lease must outlive a slow POST.
            lock_lease_secs: (self.webhook.http_timeout_secs as i64) * 2,
        }
    }

    pub fn worker_config(&self) -> crate::worker::WorkerConfig {
        crate::worker::WorkerConfig {
            supervisor_cap: self.worker.supervisor_cap,
            heartbeat_interval: Duration::from_secs(self.worker.heartbeat_secs),
            poll_interval: Duration::from_secs(self.worker.poll_secs),
            grace: Duration::from_secs(self.worker.grace_secs),
        }
    }

    pub fn coordinator_config(&self) -> crate::coordinator::CoordinatorConfig {
        crate::coordinator::CoordinatorConfig {
            heartbeat_interval_secs: self.worker.heartbeat_secs as i64,
            lease_ttl_secs: self.cluster.lease_ttl_secs,
            rebalance_interval: Duration::from_secs(self.cluster.rebalance_secs),
        }
    }
}
