// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Webhook dispatcher: drains the durable delivery queue.
//!
//! Claims only the earliest pending delivery per (account, subscription), so
//! a later event is never POSTed while an earlier one is still pending. A
//! claim takes a short lease under this dispatcher's id, which keeps the
//! dispatchers of other worker processes off the row while the POST is in
//! flight — each delivery attempt happens exactly once across the fleet.
//! 2xx settles a delivery; 4xx (other than 408/429) fails it permanently;
//! everything else retries on a capped exponential schedule until the
//! attempt ceiling, after which it expires.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use rand::Rng;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::store::{now_ts, DeliveryRow, DeliveryStatus, Store};
use crate::webhook::payload::sign_body;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("database: {0}")]
    Db(#[from] sqlx::Error),
    #[error("network: {0}")]
    Network(String),
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub max_attempts: i64,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub poll_interval: Duration,
    pub claim_batch: i64,
    /// How long a claimed delivery stays fenced off from other dispatchers.
    /// Must outlive the HTTP timeout so an in-flight POST is never claimed
    /// twice.
    pub lock_lease_secs: i64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 12,
            backoff_base: Duration::from_secs(30),
            backoff_cap: Duration::from_secs(3600),
            poll_interval: Duration::from_secs(2),
            claim_batch: 32,
            lock_lease_secs: 60,
        }
    }
}

/// The HTTP seam. The production transport POSTs with reqwest; tests script
/// responses.
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    /// POST `body` to `url` with the signature header. Returns the HTTP
    /// status, or an error for network-level failures.
    async fn post(&self, url: &str, body: &str, signature: &str) -> Result<u16, DispatchError>;
}

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DispatchError::Network(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DeliveryTransport for HttpTransport {
    async fn post(&self, url: &str, body: &str, signature: &str) -> Result<u16, DispatchError> {
        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header("X-Signature", signature)
            .body(body.to_string())
            .send()
            .await
            .map_err(|e| DispatchError::Network(e.to_string()))?;
        Ok(response.status().as_u16())
    }
}

/// What to do with a delivery after one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptVerdict {
    Delivered,
    Retry,
    PermanentFailure,
}

fn classify_status(status: u16) -> AttemptVerdict {
    match status {
        200..=299 => AttemptVerdict::Delivered,
        408 | 429 => AttemptVerdict::Retry,
        400..=499 => AttemptVerdict::PermanentFailure,
        _ => AttemptVerdict::Retry,
    }
}

pub struct Dispatcher {
    store: Store,
    transport: Arc<dyn DeliveryTransport>,
    config: DispatchConfig,
    /// Identity written into delivery leases; the hosting worker's id.
    claimant: String,
}

impl Dispatcher {
    pub fn new(
        store: Store,
        transport: Arc<dyn DeliveryTransport>,
        config: DispatchConfig,
        claimant: String,
    ) -> Self {
        Self {
            store,
            transport,
            config,
            claimant,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            "webhook dispatcher {} started (poll {:?}, max attempts {})",
            self.claimant, self.config.poll_interval, self.config.max_attempts
        );
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let processed = match self.run_once(now_ts()).await {
                Ok(n) => n,
                Err(e) => {
                    error!("dispatch pass failed: {}", e);
                    0
                }
            };
            if processed == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    _ = cancel.cancelled() => return,
                }
            }
        }
    }

    /// One dispatch pass: claim due deliveries under this dispatcher's
    /// lease and attempt each. Returns the number attempted.
    pub async fn run_once(&self, now: i64) -> Result<usize, DispatchError> {
        let due = self
            .store
            .claim_due_deliveries(
                &self.claimant,
                now,
                self.config.lock_lease_secs,
                self.config.claim_batch,
            )
            .await?;
        for delivery in &due {
            self.attempt(delivery, now).await?;
        }
        Ok(due.len())
    }

    async fn attempt(&self, delivery: &DeliveryRow, now: i64) -> Result<(), DispatchError> {
        let subscription = match self.store.subscription(delivery.subscription_id).await? {
            Some(sub) => sub,
            None => {
                // Subscription deleted out from under the queue.
                self.store
                    .mark_delivery_terminal(
                        delivery.id,
                        DeliveryStatus::PermanentlyFailed,
                        None,
                        "subscription no longer exists",
                    )
                    .await?;
                return Ok(());
            }
        };

        let signature = sign_body(&subscription.secret, &delivery.payload);
        let result = self
            .transport
            .post(&subscription.url, &delivery.payload, &signature)
            .await;

        match result {
            Ok(status) => match classify_status(status) {
                AttemptVerdict::Delivered => {
                    debug!("delivery {} settled with HTTP {}", delivery.public_id, status);
                    self.store
                        .mark_delivery_delivered(delivery.id, status, now)
                        .await?;
                }
                AttemptVerdict::PermanentFailure => {
                    // Internal alert; later events to this subscription are
                    // not blocked.
                    error!(
                        "delivery {} permanently failed with HTTP {} (url {})",
                        delivery.public_id, status, subscription.url
                    );
                    self.store
                        .mark_delivery_terminal(
                            delivery.id,
                            DeliveryStatus::PermanentlyFailed,
                            Some(status),
                            &format!("HTTP {}", status),
                        )
                        .await?;
                }
                AttemptVerdict::Retry => {
                    self.schedule_retry(delivery, now, Some(status), &format!("HTTP {}", status))
                        .await?;
                }
            },
            Err(DispatchError::Network(err)) => {
                self.schedule_retry(delivery, now, None, &err).await?;
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    async fn schedule_retry(
        &self,
        delivery: &DeliveryRow,
        now: i64,
        status: Option<u16>,
        error_text: &str,
    ) -> Result<(), DispatchError> {
        let attempts = delivery.attempts + 1;
        if attempts >= self.config.max_attempts {
            error!(
                "delivery {} expired after {} attempts: {}",
                delivery.public_id, attempts, error_text
            );
            self.store
                .mark_delivery_terminal(delivery.id, DeliveryStatus::Expired, status, error_text)
                .await?;
            return Ok(());
        }

        let delay = backoff_delay(self.config.backoff_base, self.config.backoff_cap, attempts);
        warn!(
            "delivery {} attempt {} failed ({}), retrying in {}s",
            delivery.public_id,
            attempts,
            error_text,
            delay.as_secs()
        );
        self.store
            .mark_delivery_retry(delivery.id, now + delay.as_secs() as i64, status, error_text)
            .await?;
        Ok(())
    }
}

/// Exponential backoff: base * 2^(attempt-1), capped, with ±20% jitter.
pub fn backoff_delay(base: Duration, cap: Duration, attempt: i64) -> Duration {
    let exp = (attempt - 1).clamp(0, 16) as u32;
    let ceiling = base.saturating_mul(2u32.saturating_pow(exp)).min(cap);
    let millis = ceiling.as_millis() as u64;
    let jitter = rand::thread_rng().gen_range(0.8..1.2);
    Duration::from_millis(((millis as f64) * jitter) as u64)
}
