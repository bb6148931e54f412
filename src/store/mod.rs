// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Durable state: typed row structs and queries over SQLite.
//!
//! Each sub-module contributes an `impl Store` block for one table family.
//! Writes that must be atomic with event enqueues take a transaction
//! connection; everything else goes straight through the pool.

use std::str::FromStr;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

pub mod account;
pub mod folder;
pub mod lease;
pub mod message;
pub mod secrets;
pub mod webhook;

pub use account::{AccountRow, AccountState, NewAccount};
pub use folder::{FolderRow, FolderState};
pub use lease::WorkerLeaseRow;
pub use message::MessageRow;
pub use secrets::{CredentialCipher, CredentialProvider, Credentials, SealedCredentialProvider};
pub use webhook::{DeliveryRow, DeliveryStatus, SubscriptionRow};

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

/// Current wall clock as unix seconds. All schedule columns use this.
pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating the database file if needed) and apply the embedded
    /// schema.
    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory store for tests. A single connection keeps the shared
    /// memory database alive.
    pub async fn connect_in_memory() -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        MIGRATOR.run(&self.pool).await.map_err(sqlx::Error::from)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<sqlx::Transaction<'static, sqlx::Sqlite>, sqlx::Error> {
        self.pool.begin().await
    }
}
