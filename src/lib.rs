// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Library core for mailhook: a headless multi-tenant IMAP sync engine
//! with durable webhook delivery.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod imap;
pub mod store;
pub mod sync;
pub mod webhook;
pub mod worker;

pub use error::{Error, EXIT_OK, EXIT_RUNTIME, EXIT_STARTUP};

/// Common imports for binaries and tests.
pub mod prelude {
    pub use crate::config::Settings;
    pub use crate::coordinator::{Coordinator, CoordinatorConfig};
    pub use crate::imap::{
        AsyncImapSessionWrapper, HostLimiter, ImapError, ImapSession, LimiterConfig, PoolConfig,
        SessionFactory, SessionPool,
    };
    pub use crate::store::{
        now_ts, AccountRow, AccountState, CredentialCipher, FolderState, SealedCredentialProvider,
        Store,
    };
    pub use crate::sync::{AccountSupervisor, FolderSyncUnit, SyncConfig};
    pub use crate::webhook::{DispatchConfig, Dispatcher, Event, HttpTransport, TriggerKind};
    pub use crate::worker::{AssignmentMode, Worker, WorkerConfig};

    pub use log::{debug, error, info, trace, warn};
    pub use std::sync::Arc;
}
