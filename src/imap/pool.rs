// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Account-keyed IMAP session pool.
//!
//! Commercial servers cap simultaneous sessions per user, so the pool holds
//! at most `per_account_cap` open sessions per account (default 4) and
//! multiplexes borrowers onto them. New opens go through the per-host
//! limiter. Sessions are probed with NOOP on return and discarded when the
//! probe fails, when they sat idle past the TTL, or when they exceed the
//! maximum session age.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, warn};
use thiserror::Error;
use tokio::sync::{Mutex as TokioMutex, OwnedSemaphorePermit, Semaphore};

use crate::imap::error::ImapError;
use crate::imap::limiter::{HostLimiter, HostPermit};
use crate::imap::session::ImapSession;
use crate::store::secrets::SecretError;
use crate::store::AccountRow;

/// Errors surfaced to borrowers.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("timed out waiting for a session slot for {0}")]
    AcquireTimeout(String),
    #[error("failed to open session: {0}")]
    Open(#[from] ImapError),
    /// The service-side credential material could not be resolved (missing
    /// sealing key, corrupt ciphertext). Operational, not a rejected login:
    /// never classified as an account auth failure.
    #[error("credential resolution failed: {0}")]
    Credentials(#[from] SecretError),
    #[error("pool is shutting down")]
    ShuttingDown,
}

impl PoolError {
    pub fn is_auth(&self) -> bool {
        matches!(self, PoolError::Open(e) if e.is_auth())
    }

    pub fn is_transient(&self) -> bool {
        match self {
            PoolError::AcquireTimeout(_) | PoolError::ShuttingDown => true,
            PoolError::Open(e) => e.is_transient(),
            PoolError::Credentials(_) => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Open sessions allowed per account (borrowed + parked).
    pub per_account_cap: usize,
    /// How long a parked session may sit idle before being discarded.
    pub idle_ttl: Duration,
    /// Maximum total age of a session before it is retired on return.
    pub max_session_age: Duration,
    /// Deadline for a borrower to obtain a slot.
    pub acquire_timeout: Duration,
    /// How long to hold off new opens on a host that rejected for capacity.
    pub capacity_backoff: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            per_account_cap: 4,
            idle_ttl: Duration::from_secs(600),
            max_session_age: Duration::from_secs(3600),
            acquire_timeout: Duration::from_secs(30),
            capacity_backoff: Duration::from_secs(60),
        }
    }
}

/// Opens a fresh authenticated session for an account. Implementations
/// return `PoolError::Open` for IMAP-level failures and
/// `PoolError::Credentials` when the login material itself cannot be
/// resolved.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self, account: &AccountRow) -> Result<Arc<dyn ImapSession>, PoolError>;
}

struct ParkedSession {
    session: Arc<dyn ImapSession>,
    opened_at: Instant,
    parked_at: Instant,
    _host: HostPermit,
}

struct AccountSlot {
    borrows: Arc<Semaphore>,
    parked: TokioMutex<VecDeque<ParkedSession>>,
}

/// A borrowed session. Dropping the lease discards the session (used for
/// broken sessions); well-behaved borrowers hand it back with
/// [`SessionPool::give_back`].
pub struct SessionLease {
    session: Arc<dyn ImapSession>,
    account_id: i64,
    opened_at: Instant,
    host: Option<HostPermit>,
    _borrow: OwnedSemaphorePermit,
}

impl std::fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease")
            .field("account_id", &self.account_id)
            .field("opened_at", &self.opened_at)
            .field("host", &self.host)
            .finish()
    }
}

impl SessionLease {
    pub fn session(&self) -> &Arc<dyn ImapSession> {
        &self.session
    }
}

pub struct SessionPool {
    config: PoolConfig,
    limiter: Arc<HostLimiter>,
    factory: Arc<dyn SessionFactory>,
    accounts: DashMap<i64, Arc<AccountSlot>>,
}

impl SessionPool {
    pub fn new(
        limiter: Arc<HostLimiter>,
        factory: Arc<dyn SessionFactory>,
        config: PoolConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            limiter,
            factory,
            accounts: DashMap::new(),
        })
    }

    fn slot(&self, account_id: i64) -> Arc<AccountSlot> {
        let entry = self.accounts.entry(account_id).or_insert_with(|| {
            Arc::new(AccountSlot {
                borrows: Arc::new(Semaphore::new(self.config.per_account_cap)),
                parked: TokioMutex::new(VecDeque::new()),
            })
        });
        Arc::clone(entry.value())
    }

    /// Borrow a session for the account: reuse a parked one, or open a new
    /// one subject to the host limiter, or wait until a slot frees up.
    pub async fn borrow(&self, account: &AccountRow) -> Result<SessionLease, PoolError> {
        let slot = self.slot(account.id);

        let borrow = tokio::time::timeout(
            self.config.acquire_timeout,
            slot.borrows.clone().acquire_owned(),
        )
        .await
        .map_err(|_| PoolError::AcquireTimeout(account.email.clone()))?
        .map_err(|_| PoolError::ShuttingDown)?;

        {
            let mut parked = slot.parked.lock().await;
            while let Some(entry) = parked.pop_front() {
                if entry.parked_at.elapsed() > self.config.idle_ttl {
                    debug!("discarding idle-expired session for account {}", account.id);
                    continue;
                }
                return Ok(SessionLease {
                    session: entry.session,
                    account_id: account.id,
                    opened_at: entry.opened_at,
                    host: Some(entry._host),
                    _borrow: borrow,
                });
            }
        }

        let host_permit = self.limiter.acquire(&account.imap_host).await?;
        let session = match self.factory.open(account).await {
            Ok(session) => session,
            Err(e) => {
                if matches!(e, PoolError::Open(ImapError::ServerCapacity(_))) {
                    self.limiter
                        .penalize(&account.imap_host, self.config.capacity_backoff);
                }
                return Err(e);
            }
        };

        debug!("opened new IMAP session for account {}", account.id);
        Ok(SessionLease {
            session,
            account_id: account.id,
            opened_at: Instant::now(),
            host: Some(host_permit),
            _borrow: borrow,
        })
    }

    /// Return a session. It is NOOP-probed and parked for reuse, or
    /// discarded when too old or unhealthy.
    pub async fn give_back(&self, mut lease: SessionLease) {
        if lease.opened_at.elapsed() > self.config.max_session_age {
            debug!("retiring aged session for account {}", lease.account_id);
            return;
        }
        if let Err(e) = lease.session.noop().await {
            warn!(
                "liveness probe failed for account {} session: {}",
                lease.account_id, e
            );
            return;
        }
        let host = match lease.host.take() {
            Some(host) => host,
            None => return,
        };
        let slot = self.slot(lease.account_id);
        let mut parked = slot.parked.lock().await;
        parked.push_back(ParkedSession {
            session: Arc::clone(&lease.session),
            opened_at: lease.opened_at,
            parked_at: Instant::now(),
            _host: host,
        });
        // The borrow permit drops with the lease, freeing the slot.
    }

    /// Drop every parked session for an account. Used when quiescing.
    pub async fn evict_account(&self, account_id: i64) {
        if let Some((_, slot)) = self.accounts.remove(&account_id) {
            let mut parked = slot.parked.lock().await;
            let n = parked.len();
            parked.clear();
            if n > 0 {
                debug!("evicted {} parked sessions for account {}", n, account_id);
            }
        }
    }
}
