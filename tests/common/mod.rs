// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Shared test fixtures: an in-memory store, a scripted in-memory IMAP
//! server behind the `ImapSession` seam, and a scripted webhook transport.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use mailhook::imap::{
    Address, CapabilitySet, EnvelopeMeta, FolderSelection, HostLimiter, IdleOutcome, ImapError,
    ImapSession, LimiterConfig, MessageMeta, PoolConfig, PoolError, SessionFactory, SessionPool,
};
use mailhook::store::{AccountRow, AccountState, NewAccount, Store, SubscriptionRow};
use mailhook::sync::SyncConfig;
use mailhook::webhook::dispatcher::{DeliveryTransport, DispatchError};
use mailhook::webhook::TriggerKind;

pub async fn memory_store() -> Store {
    Store::connect_in_memory()
        .await
        .expect("in-memory store should initialize")
}

/// An account in `active` state, ready to sync.
pub async fn seed_account(store: &Store) -> AccountRow {
    let row = store
        .create_account(NewAccount {
            grant_id: "grant-inbox-1",
            application_id: "app-1",
            email: "user@example.com",
            imap_host: "imap.example.com",
            imap_port: 993,
            auth_user: "user@example.com",
            auth_secret: "hunter2",
            backfill_horizon: 0,
        })
        .await
        .expect("account insert");
    store
        .set_account_state(row.id, AccountState::Active, None)
        .await
        .expect("activate account");
    store.account(row.id).await.unwrap().unwrap()
}

pub async fn seed_subscription(store: &Store) -> SubscriptionRow {
    store
        .create_subscription(
            "app-1",
            "https://hooks.example.com/sink",
            "whsec_test",
            &[
                TriggerKind::MessageCreated,
                TriggerKind::MessageUpdated,
                TriggerKind::FolderUpdated,
                TriggerKind::AccountConnected,
                TriggerKind::AccountInvalidCredentials,
            ],
        )
        .await
        .expect("subscription insert")
}

/// Sync tuning with short waits so tests run fast.
pub fn test_sync_config() -> SyncConfig {
    SyncConfig {
        backfill_batch: 200,
        backfill_horizon: 0,
        idle_wait: Duration::from_secs(60),
        poll_fallback: Duration::from_millis(20),
        flag_window: 500,
        restart_base: Duration::from_millis(10),
        restart_cap: Duration::from_millis(100),
        folder_refresh: Duration::from_millis(50),
    }
}

/// Poll `probe` until it returns true or the deadline elapses.
pub async fn wait_until<F, Fut>(what: &str, mut probe: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if probe().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// --- In-memory IMAP server ---

#[derive(Debug, Clone)]
pub struct FakeMessage {
    pub meta: MessageMeta,
    pub modseq: u64,
}

#[derive(Debug, Clone)]
pub struct FakeMailbox {
    pub uidvalidity: u32,
    pub uidnext: u32,
    pub modseq: u64,
    pub messages: BTreeMap<u32, FakeMessage>,
}

impl FakeMailbox {
    pub fn new(uidvalidity: u32) -> Self {
        Self {
            uidvalidity,
            uidnext: 1,
            modseq: 1,
            messages: BTreeMap::new(),
        }
    }

    pub fn deliver(&mut self, uid: u32, subject: &str, from: &str, message_id: &str) {
        self.modseq += 1;
        let meta = MessageMeta {
            uid,
            flags: Vec::new(),
            internal_date: Some(Utc.timestamp_opt(1_700_000_000 + uid as i64, 0).unwrap()),
            size: Some(1024),
            envelope: EnvelopeMeta {
                subject: Some(subject.to_string()),
                from: vec![Address {
                    name: None,
                    email: from.to_string(),
                }],
                to: vec![Address {
                    name: None,
                    email: "user@example.com".to_string(),
                }],
                cc: Vec::new(),
                bcc: Vec::new(),
                message_id: Some(message_id.to_string()),
                in_reply_to: None,
                references: Vec::new(),
            },
        };
        self.messages.insert(
            uid,
            FakeMessage {
                meta,
                modseq: self.modseq,
            },
        );
        if uid >= self.uidnext {
            self.uidnext = uid + 1;
        }
    }

    pub fn set_flags(&mut self, uid: u32, flags: &[&str]) {
        self.modseq += 1;
        if let Some(message) = self.messages.get_mut(&uid) {
            message.meta.flags = flags.iter().map(|f| f.to_string()).collect();
            message.modseq = self.modseq;
        }
    }

    pub fn expunge(&mut self, uid: u32) {
        self.modseq += 1;
        self.messages.remove(&uid);
    }
}

#[derive(Debug, Clone, Copy)]
pub enum IdleStep {
    Changed,
    Timeout,
    Drop,
}

pub struct FakeServer {
    pub caps: CapabilitySet,
    folders: StdMutex<HashMap<String, FakeMailbox>>,
    idle_script: StdMutex<VecDeque<IdleStep>>,
}

impl FakeServer {
    pub fn new(caps: CapabilitySet) -> Arc<Self> {
        Arc::new(Self {
            caps,
            folders: StdMutex::new(HashMap::new()),
            idle_script: StdMutex::new(VecDeque::new()),
        })
    }

    pub fn caps_plain() -> CapabilitySet {
        CapabilitySet {
            idle: true,
            condstore: false,
            mv: false,
            uidplus: false,
        }
    }

    pub fn caps_condstore() -> CapabilitySet {
        CapabilitySet {
            idle: true,
            condstore: true,
            mv: false,
            uidplus: false,
        }
    }

    pub fn create_folder(&self, name: &str, uidvalidity: u32) {
        self.folders
            .lock()
            .unwrap()
            .insert(name.to_string(), FakeMailbox::new(uidvalidity));
    }

    pub fn remove_folder(&self, name: &str) {
        self.folders.lock().unwrap().remove(name);
    }

    pub fn replace_folder(&self, name: &str, mailbox: FakeMailbox) {
        self.folders
            .lock()
            .unwrap()
            .insert(name.to_string(), mailbox);
    }

    pub fn mailbox<F: FnOnce(&mut FakeMailbox)>(&self, name: &str, f: F) {
        let mut folders = self.folders.lock().unwrap();
        let mailbox = folders.get_mut(name).expect("mailbox exists");
        f(mailbox);
    }

    pub fn push_idle(&self, step: IdleStep) {
        self.idle_script.lock().unwrap().push_back(step);
    }
}

pub struct FakeSession {
    server: Arc<FakeServer>,
    caps: CapabilitySet,
    selected_folder: StdMutex<Option<String>>,
}

impl FakeSession {
    fn with_mailbox<T>(
        &self,
        folder: &str,
        f: impl FnOnce(&FakeMailbox) -> T,
    ) -> Result<T, ImapError> {
        let folders = self.server.folders.lock().unwrap();
        match folders.get(folder) {
            Some(mailbox) => Ok(f(mailbox)),
            None => Err(ImapError::MissingMailbox(format!(
                "[NONEXISTENT] Unknown Mailbox: {}",
                folder
            ))),
        }
    }

    /// The selected folder, tracked per session like a real SELECT.
    fn selected(&self) -> Result<String, ImapError> {
        self.selected_folder
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| ImapError::Protocol("no folder selected".to_string()))
    }
}

pub struct FakeFactory {
    server: Arc<FakeServer>,
    pub opened: AtomicUsize,
    /// Simulate the server rejecting the LOGIN.
    pub fail_auth: AtomicBool,
    /// Simulate the service failing to resolve credential material
    /// (missing sealing key, corrupt ciphertext).
    pub fail_credentials: AtomicBool,
}

impl FakeFactory {
    pub fn new(server: Arc<FakeServer>) -> Arc<Self> {
        Arc::new(Self {
            server,
            opened: AtomicUsize::new(0),
            fail_auth: AtomicBool::new(false),
            fail_credentials: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl SessionFactory for FakeFactory {
    async fn open(&self, _account: &AccountRow) -> Result<Arc<dyn ImapSession>, PoolError> {
        if self.fail_credentials.load(Ordering::SeqCst) {
            return Err(PoolError::Credentials(
                mailhook::store::secrets::SecretError::KeyNotConfigured,
            ));
        }
        if self.fail_auth.load(Ordering::SeqCst) {
            return Err(PoolError::Open(ImapError::Auth(
                "LOGIN failed: invalid credentials".into(),
            )));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeSession {
            server: Arc::clone(&self.server),
            caps: self.server.caps.clone(),
            selected_folder: StdMutex::new(None),
        }))
    }
}

/// Build a session pool wired to the fake server.
pub fn fake_pool(server: &Arc<FakeServer>) -> (Arc<SessionPool>, Arc<FakeFactory>) {
    let factory = FakeFactory::new(Arc::clone(server));
    let limiter = Arc::new(HostLimiter::new(LimiterConfig {
        max_sessions_per_host: 50,
        min_open_interval: Duration::from_millis(0),
        acquire_timeout: Duration::from_secs(1),
    }));
    let pool = SessionPool::new(
        limiter,
        Arc::clone(&factory) as Arc<dyn SessionFactory>,
        PoolConfig {
            per_account_cap: 4,
            idle_ttl: Duration::from_secs(600),
            max_session_age: Duration::from_secs(3600),
            acquire_timeout: Duration::from_secs(1),
            capacity_backoff: Duration::from_millis(50),
        },
    );
    (pool, factory)
}

fn parse_uid_token(token: &str, mailbox: &FakeMailbox) -> Vec<u32> {
    if let Some((lo, hi)) = token.split_once(':') {
        let lo: u32 = lo.parse().unwrap_or(1);
        let hi: u32 = if hi == "*" {
            mailbox.messages.keys().next_back().copied().unwrap_or(lo)
        } else {
            hi.parse().unwrap_or(lo)
        };
        let (lo, hi) = (lo.min(hi), lo.max(hi));
        mailbox
            .messages
            .keys()
            .copied()
            .filter(|uid| (lo..=hi).contains(uid))
            .collect()
    } else {
        match token.parse::<u32>() {
            Ok(uid) if mailbox.messages.contains_key(&uid) => vec![uid],
            _ => Vec::new(),
        }
    }
}

fn parse_uid_set(set: &str, mailbox: &FakeMailbox) -> Vec<u32> {
    let mut uids: Vec<u32> = set
        .split(',')
        .flat_map(|token| parse_uid_token(token.trim(), mailbox))
        .collect();
    uids.sort_unstable();
    uids.dedup();
    uids
}

#[async_trait]
impl ImapSession for FakeSession {
    fn capabilities(&self) -> &CapabilitySet {
        &self.caps
    }

    async fn select(&self, folder: &str) -> Result<FolderSelection, ImapError> {
        let sel = self.with_mailbox(folder, |mailbox| FolderSelection {
            uidvalidity: Some(mailbox.uidvalidity),
            uidnext: Some(mailbox.uidnext),
            exists: mailbox.messages.len() as u32,
            highest_modseq: if self.caps.condstore {
                Some(mailbox.modseq)
            } else {
                None
            },
        })?;
        *self.selected_folder.lock().unwrap() = Some(folder.to_string());
        Ok(sel)
    }

    async fn list_folders(&self) -> Result<Vec<String>, ImapError> {
        let mut names: Vec<String> = self
            .server
            .folders
            .lock()
            .unwrap()
            .keys()
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }

    async fn uid_search(&self, criteria: &str) -> Result<Vec<u32>, ImapError> {
        let folder = self.selected()?;
        self.with_mailbox(&folder, |mailbox| {
            let criteria = criteria.trim();
            let mut uids: Vec<u32> = if criteria.eq_ignore_ascii_case("ALL") {
                mailbox.messages.keys().copied().collect()
            } else if let Some(rest) = criteria.strip_prefix("UID ") {
                parse_uid_set(rest, mailbox)
            } else if let Some(rest) = criteria.strip_prefix("MODSEQ ") {
                let since: u64 = rest.trim().parse().unwrap_or(0);
                mailbox
                    .messages
                    .values()
                    .filter(|m| m.modseq >= since)
                    .map(|m| m.meta.uid)
                    .collect()
            } else {
                Vec::new()
            };
            uids.sort_unstable();
            uids
        })
    }

    async fn fetch_meta(&self, uid_set: &str) -> Result<Vec<MessageMeta>, ImapError> {
        let folder = self.selected()?;
        self.with_mailbox(&folder, |mailbox| {
            parse_uid_set(uid_set, mailbox)
                .into_iter()
                .filter_map(|uid| mailbox.messages.get(&uid).map(|m| m.meta.clone()))
                .collect()
        })
    }

    async fn fetch_flags(&self, uid_set: &str) -> Result<Vec<(u32, Vec<String>)>, ImapError> {
        let folder = self.selected()?;
        self.with_mailbox(&folder, |mailbox| {
            parse_uid_set(uid_set, mailbox)
                .into_iter()
                .filter_map(|uid| {
                    mailbox
                        .messages
                        .get(&uid)
                        .map(|m| (uid, m.meta.flags.clone()))
                })
                .collect()
        })
    }

    async fn idle(
        &self,
        wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<IdleOutcome, ImapError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let step = self.server.idle_script.lock().unwrap().pop_front();
            match step {
                Some(IdleStep::Changed) => return Ok(IdleOutcome::Changed),
                Some(IdleStep::Timeout) => return Ok(IdleOutcome::Timeout),
                Some(IdleStep::Drop) => return Err(ImapError::Closed),
                None => {}
            }
            if cancel.is_cancelled() {
                return Ok(IdleOutcome::Cancelled);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(IdleOutcome::Timeout);
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(2)) => {}
                _ = cancel.cancelled() => return Ok(IdleOutcome::Cancelled),
            }
        }
    }

    async fn noop(&self) -> Result<(), ImapError> {
        Ok(())
    }

    async fn logout(&self) -> Result<(), ImapError> {
        Ok(())
    }
}

// --- Scripted webhook transport ---

#[derive(Debug, Clone)]
pub struct RecordedPost {
    pub url: String,
    pub body: String,
    pub signature: String,
}

pub struct ScriptedTransport {
    responses: StdMutex<VecDeque<Result<u16, String>>>,
    pub calls: StdMutex<Vec<RecordedPost>>,
}

impl ScriptedTransport {
    /// Responds with the scripted statuses in order, then 200 forever.
    pub fn new<I: IntoIterator<Item = Result<u16, String>>>(script: I) -> Arc<Self> {
        Arc::new(Self {
            responses: StdMutex::new(script.into_iter().collect()),
            calls: StdMutex::new(Vec::new()),
        })
    }

    pub fn statuses<I: IntoIterator<Item = u16>>(script: I) -> Arc<Self> {
        Self::new(script.into_iter().map(Ok))
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl DeliveryTransport for ScriptedTransport {
    async fn post(&self, url: &str, body: &str, signature: &str) -> Result<u16, DispatchError> {
        self.calls.lock().unwrap().push(RecordedPost {
            url: url.to_string(),
            body: body.to_string(),
            signature: signature.to_string(),
        });
        match self.responses.lock().unwrap().pop_front() {
            Some(Ok(status)) => Ok(status),
            Some(Err(network)) => Err(DispatchError::Network(network)),
            None => Ok(200),
        }
    }
}
