// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Authenticated IMAP session: the `ImapSession` trait every sync component
//! talks through, and the `async-imap` + native-tls implementation behind it.
//!
//! Commands serialize on the session mutex. A session that fails with a
//! network error is treated as broken by its borrower and never reused.

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::TryStreamExt;
use log::{debug, error, info, warn};
use tokio::net::TcpStream as TokioTcpStream;
use tokio::sync::Mutex as TokioMutex;
use tokio_native_tls::native_tls;
use tokio_native_tls::TlsConnector;
use tokio_util::sync::CancellationToken;

use crate::imap::error::ImapError;
use crate::imap::pool::PoolError;
use crate::imap::types::{flag_name, CapabilitySet, FolderSelection, IdleOutcome, MessageMeta};

pub type TlsCompatStream = tokio_native_tls::TlsStream<TokioTcpStream>;
pub type TlsImapSession = async_imap::Session<TlsCompatStream>;

/// FETCH attribute list for metadata sync. RFC822.HEADER rides along so the
/// References chain is available for thread assignment; bodies are never
/// requested.
const META_FETCH_QUERY: &str = "(UID FLAGS INTERNALDATE RFC822.SIZE ENVELOPE RFC822.HEADER)";

/// Asynchronous IMAP operations needed by the sync engine.
#[async_trait]
pub trait ImapSession: Send + Sync {
    /// Extension set discovered at login.
    fn capabilities(&self) -> &CapabilitySet;

    /// SELECT a folder, preferring SELECT (CONDSTORE) when the server
    /// advertises it so HIGHESTMODSEQ is reported.
    async fn select(&self, folder: &str) -> Result<FolderSelection, ImapError>;

    /// LIST "" "*" — flat folder names.
    async fn list_folders(&self) -> Result<Vec<String>, ImapError>;

    /// UID SEARCH with a raw criteria string; results sorted ascending.
    async fn uid_search(&self, criteria: &str) -> Result<Vec<u32>, ImapError>;

    /// UID FETCH of index metadata (envelope, flags, size, internal date,
    /// header block) for the given UID set.
    async fn fetch_meta(&self, uid_set: &str) -> Result<Vec<MessageMeta>, ImapError>;

    /// UID FETCH of flags only.
    async fn fetch_flags(&self, uid_set: &str) -> Result<Vec<(u32, Vec<String>)>, ImapError>;

    /// Enter IDLE for at most `wait`. Cancellation sends DONE before the
    /// session is handed back.
    async fn idle(
        &self,
        wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<IdleOutcome, ImapError>;

    /// NOOP keepalive / liveness probe.
    async fn noop(&self) -> Result<(), ImapError>;

    /// LOGOUT and drop the connection.
    async fn logout(&self) -> Result<(), ImapError>;
}

/// `ImapSession` over a TLS async-imap session.
///
/// The inner session lives in an `Option` so IDLE (which consumes the
/// session by value) can take it out and put it back.
pub struct AsyncImapSessionWrapper {
    session: TokioMutex<Option<TlsImapSession>>,
    capabilities: CapabilitySet,
    command_timeout: Duration,
}

impl Debug for AsyncImapSessionWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncImapSessionWrapper")
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

impl AsyncImapSessionWrapper {
    /// Connect, perform the TLS handshake and LOGIN, and discover the
    /// capability set. Authentication rejections map to `ImapError::Auth`.
    pub async fn connect(
        host: &str,
        port: u16,
        username: &str,
        password: &str,
        command_timeout: Duration,
    ) -> Result<Self, ImapError> {
        let tls = native_tls::TlsConnector::builder()
            .build()
            .map_err(|e| ImapError::Tls(e.to_string()))?;
        let tls_connector = TlsConnector::from(tls);

        let tcp_stream =
            tokio::time::timeout(command_timeout, TokioTcpStream::connect((host, port)))
                .await
                .map_err(|_| ImapError::Timeout(format!("connect to {}:{}", host, port)))?
                .map_err(|e| ImapError::Connection(e.to_string()))?;

        tcp_stream
            .set_nodelay(true)
            .map_err(|e| ImapError::Connection(e.to_string()))?;

        let tls_stream =
            tokio::time::timeout(command_timeout, tls_connector.connect(host, tcp_stream))
                .await
                .map_err(|_| ImapError::Timeout("TLS handshake".to_string()))?
                .map_err(|e| ImapError::Tls(e.to_string()))?;

        debug!("TLS established to {}:{}", host, port);

        let client = async_imap::Client::new(tls_stream);
        let mut session = tokio::time::timeout(command_timeout, client.login(username, password))
            .await
            .map_err(|_| ImapError::Timeout("LOGIN".to_string()))?
            .map_err(|(err, _client)| match err {
                async_imap::error::Error::No(msg) | async_imap::error::Error::Bad(msg) => {
                    ImapError::Auth(format!("login failed: {}", msg))
                }
                other => ImapError::Auth(format!("login failed: {}", other)),
            })?;

        info!("IMAP login successful for {} on {}", username, host);

        let caps = session.capabilities().await.map_err(ImapError::from)?;
        let capabilities = CapabilitySet {
            idle: caps.has_str("IDLE"),
            condstore: caps.has_str("CONDSTORE"),
            mv: caps.has_str("MOVE"),
            uidplus: caps.has_str("UIDPLUS"),
        };

        Ok(Self {
            session: TokioMutex::new(Some(session)),
            capabilities,
            command_timeout,
        })
    }
}

#[async_trait]
impl ImapSession for AsyncImapSessionWrapper {
    fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    async fn select(&self, folder: &str) -> Result<FolderSelection, ImapError> {
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or(ImapError::Closed)?;

        let select = async {
            if self.capabilities.condstore {
                session.select_condstore(folder).await
            } else {
                session.select(folder).await
            }
        };
        let mailbox = tokio::time::timeout(self.command_timeout, select)
            .await
            .map_err(|_| ImapError::Timeout("SELECT".to_string()))?
            .map_err(ImapError::from)?;

        Ok(FolderSelection {
            uidvalidity: mailbox.uid_validity,
            uidnext: mailbox.uid_next,
            exists: mailbox.exists,
            highest_modseq: mailbox.highest_modseq,
        })
    }

    async fn list_folders(&self) -> Result<Vec<String>, ImapError> {
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or(ImapError::Closed)?;

        let list = async {
            let mut stream = session.list(None, Some("*")).await?;
            let mut names = Vec::new();
            while let Some(name) = stream.try_next().await? {
                names.push(name.name().to_string());
            }
            Ok::<_, async_imap::error::Error>(names)
        };
        tokio::time::timeout(self.command_timeout, list)
            .await
            .map_err(|_| ImapError::Timeout("LIST".to_string()))?
            .map_err(ImapError::from)
    }

    async fn uid_search(&self, criteria: &str) -> Result<Vec<u32>, ImapError> {
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or(ImapError::Closed)?;

        let uids = tokio::time::timeout(self.command_timeout, session.uid_search(criteria))
            .await
            .map_err(|_| ImapError::Timeout("UID SEARCH".to_string()))?
            .map_err(ImapError::from)?;

        let mut uids: Vec<u32> = uids.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    async fn fetch_meta(&self, uid_set: &str) -> Result<Vec<MessageMeta>, ImapError> {
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or(ImapError::Closed)?;

        let fetch = async {
            let mut stream = session.uid_fetch(uid_set, META_FETCH_QUERY).await?;
            let mut out = Vec::new();
            while let Some(fetch) = stream.try_next().await? {
                if let Some(meta) = MessageMeta::from_fetch(&fetch) {
                    out.push(meta);
                }
            }
            Ok::<_, async_imap::error::Error>(out)
        };
        let mut out = tokio::time::timeout(self.command_timeout, fetch)
            .await
            .map_err(|_| ImapError::Timeout("UID FETCH".to_string()))?
            .map_err(ImapError::from)?;

        out.sort_by_key(|m| m.uid);
        Ok(out)
    }

    async fn fetch_flags(&self, uid_set: &str) -> Result<Vec<(u32, Vec<String>)>, ImapError> {
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or(ImapError::Closed)?;

        let fetch = async {
            let mut stream = session.uid_fetch(uid_set, "(UID FLAGS)").await?;
            let mut out = Vec::new();
            while let Some(fetch) = stream.try_next().await? {
                if let Some(uid) = fetch.uid {
                    let flags: Vec<String> = fetch.flags().map(|f| flag_name(&f)).collect();
                    out.push((uid, flags));
                }
            }
            Ok::<_, async_imap::error::Error>(out)
        };
        let mut out = tokio::time::timeout(self.command_timeout, fetch)
            .await
            .map_err(|_| ImapError::Timeout("UID FETCH (FLAGS)".to_string()))?
            .map_err(ImapError::from)?;

        out.sort_by_key(|(uid, _)| *uid);
        Ok(out)
    }

    async fn idle(
        &self,
        wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<IdleOutcome, ImapError> {
        use async_imap::extensions::idle::IdleResponse;

        let mut guard = self.session.lock().await;
        let session = guard.take().ok_or(ImapError::Closed)?;

        let mut handle = session.idle();
        if let Err(e) = handle.init().await {
            match handle.done().await {
                Ok(session) => *guard = Some(session),
                Err(done_err) => warn!("failed to exit IDLE after init error: {:?}", done_err),
            }
            return Err(ImapError::from(e));
        }

        let outcome = {
            let (wait_fut, stop_source) = handle.wait_with_timeout(wait);
            tokio::select! {
                result = wait_fut => {
                    drop(stop_source);
                    match result {
                        Ok(IdleResponse::NewData(_)) => Ok(IdleOutcome::Changed),
                        Ok(IdleResponse::Timeout) => Ok(IdleOutcome::Timeout),
                        Ok(IdleResponse::ManualInterrupt) => Ok(IdleOutcome::Cancelled),
                        Err(e) => Err(ImapError::from(e)),
                    }
                }
                _ = cancel.cancelled() => Ok(IdleOutcome::Cancelled),
            }
        };

        // done() sends DONE and returns the session in every path, including
        // cancellation.
        match handle.done().await {
            Ok(session) => *guard = Some(session),
            Err(e) => {
                warn!("IDLE DONE failed, session dropped: {:?}", e);
                return Err(ImapError::from(e));
            }
        }

        outcome
    }

    async fn noop(&self) -> Result<(), ImapError> {
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or(ImapError::Closed)?;

        tokio::time::timeout(self.command_timeout, session.noop())
            .await
            .map_err(|_| ImapError::Timeout("NOOP".to_string()))?
            .map_err(ImapError::from)
    }

    async fn logout(&self) -> Result<(), ImapError> {
        let mut guard = self.session.lock().await;
        match guard.as_mut() {
            Some(session) => {
                let result = tokio::time::timeout(self.command_timeout, session.logout())
                    .await
                    .map_err(|_| ImapError::Timeout("LOGOUT".to_string()))?
                    .map_err(ImapError::from);
                *guard = None;
                result
            }
            None => Ok(()),
        }
    }
}

/// Production session factory: resolves credentials through the provider
/// and opens a TLS session.
///
/// Failure to resolve credentials (missing service sealing key, corrupt
/// ciphertext) is an operational problem, not a rejected login: it surfaces
/// as `PoolError::Credentials` so supervisors retry with backoff instead of
/// quiescing the account and notifying the tenant. Only the server actually
/// rejecting the LOGIN becomes an auth failure.
pub struct TlsSessionFactory {
    provider: std::sync::Arc<dyn crate::store::CredentialProvider>,
    command_timeout: Duration,
}

impl TlsSessionFactory {
    pub fn new(
        provider: std::sync::Arc<dyn crate::store::CredentialProvider>,
        command_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            command_timeout,
        }
    }
}

#[async_trait]
impl crate::imap::pool::SessionFactory for TlsSessionFactory {
    async fn open(
        &self,
        account: &crate::store::AccountRow,
    ) -> Result<std::sync::Arc<dyn ImapSession>, PoolError> {
        let creds = self.provider.credentials(account).await.map_err(|e| {
            error!(
                "credential resolution failed for {} (service key / sealed secret problem): {}",
                account.email, e
            );
            PoolError::Credentials(e)
        })?;
        let session = AsyncImapSessionWrapper::connect(
            &account.imap_host,
            account.imap_port as u16,
            &creds.user,
            &creds.secret,
            self.command_timeout,
        )
        .await
        .map_err(PoolError::Open)?;
        Ok(std::sync::Arc::new(session))
    }
}
