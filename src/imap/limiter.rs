// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Per-server connection gate.
//!
//! Two bounds per IMAP host: maximum concurrent sessions and a minimum
//! spacing between new connection opens. Waiters queue FIFO on the host
//! semaphore and give up at the acquire deadline. A host that answers with a
//! capacity rejection can be penalized, which pushes out the next allowed
//! open.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use log::{debug, warn};
use tokio::sync::{Mutex as TokioMutex, OwnedSemaphorePermit, Semaphore};

use crate::imap::pool::PoolError;

#[derive(Debug, Clone)]
pub struct LimiterConfig {
    /// Maximum concurrent sessions per host, across all accounts.
    pub max_sessions_per_host: usize,
    /// Minimum spacing between new connection opens on one host.
    pub min_open_interval: Duration,
    /// Deadline for a waiter to obtain a slot.
    pub acquire_timeout: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_sessions_per_host: 50,
            min_open_interval: Duration::from_millis(100),
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

struct OpenState {
    last_open: Option<Instant>,
    blocked_until: Option<Instant>,
}

struct HostGate {
    slots: Arc<Semaphore>,
    open_state: TokioMutex<OpenState>,
}

impl HostGate {
    fn new(max_sessions: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(max_sessions)),
            open_state: TokioMutex::new(OpenState {
                last_open: None,
                blocked_until: None,
            }),
        }
    }
}

/// Holding a permit means one session slot on the host is in use. Dropping
/// it frees the slot.
#[derive(Debug)]
pub struct HostPermit {
    _slot: OwnedSemaphorePermit,
}

pub struct HostLimiter {
    config: LimiterConfig,
    hosts: DashMap<String, Arc<HostGate>>,
}

impl HostLimiter {
    pub fn new(config: LimiterConfig) -> Self {
        Self {
            config,
            hosts: DashMap::new(),
        }
    }

    fn gate(&self, host: &str) -> Arc<HostGate> {
        let entry = self
            .hosts
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(HostGate::new(self.config.max_sessions_per_host)));
        Arc::clone(entry.value())
    }

    /// Wait for a session slot on `host`, respecting the open-rate spacing
    /// and any capacity penalty. Fails with `AcquireTimeout` at the deadline.
    pub async fn acquire(&self, host: &str) -> Result<HostPermit, PoolError> {
        let gate = self.gate(host);

        let acquire = async {
            let slot = gate
                .slots
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| PoolError::ShuttingDown)?;

            // The open-state mutex doubles as the FIFO queue for the rate
            // gate: whoever holds it next performs the next open.
            let mut state = gate.open_state.lock().await;
            let now = Instant::now();
            let mut earliest = state
                .last_open
                .map(|t| t + self.config.min_open_interval)
                .unwrap_or(now);
            if let Some(blocked) = state.blocked_until {
                if blocked > earliest {
                    earliest = blocked;
                }
            }
            if earliest > now {
                tokio::time::sleep(earliest - now).await;
            }
            state.last_open = Some(Instant::now());
            state.blocked_until = None;
            Ok(HostPermit { _slot: slot })
        };

        match tokio::time::timeout(self.config.acquire_timeout, acquire).await {
            Ok(result) => result,
            Err(_) => {
                debug!("session slot wait timed out for host {}", host);
                Err(PoolError::AcquireTimeout(host.to_string()))
            }
        }
    }

    /// Back off new opens on a host that rejected a connection for capacity
    /// reasons. Existing sessions are unaffected.
    pub fn penalize(&self, host: &str, hold: Duration) {
        let gate = self.gate(host);
        warn!("backing off new sessions to {} for {:?}", host, hold);
        // try_lock: a concurrent opener will observe the penalty on its next
        // pass; losing this race only shortens the hold.
        if let Ok(mut state) = gate.open_state.try_lock() {
            state.blocked_until = Some(Instant::now() + hold);
        };
    }
}
