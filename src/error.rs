// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use thiserror::Error;

/// Process exit codes: 0 normal, 1 fatal startup error, 2 unrecoverable
/// runtime error.
pub const EXIT_OK: i32 = 0;
pub const EXIT_STARTUP: i32 = 1;
pub const EXIT_RUNTIME: i32 = 2;

/// Top-level service error. Only configuration and database failures are
/// fatal to a worker process; everything else is contained by the
/// supervisors and the dispatcher.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("credential error: {0}")]
    Secret(#[from] crate::store::secrets::SecretError),

    #[error("webhook dispatch error: {0}")]
    Dispatch(#[from] crate::webhook::DispatchError),

    #[error("sync error: {0}")]
    Sync(#[from] crate::sync::SyncError),

    #[error("runtime failure: {0}")]
    Runtime(String),
}

impl Error {
    /// Everything that can fail after startup is a runtime error; the rest
    /// only surfaces while the process is coming up.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Runtime(_) => EXIT_RUNTIME,
            _ => EXIT_STARTUP,
        }
    }
}
