// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! IMAP layer: session wrapper, per-host limiter and account-keyed pool.

pub mod error;
pub mod limiter;
pub mod pool;
pub mod session;
pub mod types;

pub use error::ImapError;
pub use limiter::{HostLimiter, LimiterConfig};
pub use pool::{PoolConfig, PoolError, SessionFactory, SessionLease, SessionPool};
pub use session::{AsyncImapSessionWrapper, ImapSession};
pub use types::{Address, CapabilitySet, EnvelopeMeta, FolderSelection, IdleOutcome, MessageMeta};
