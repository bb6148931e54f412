// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Service binary.
//!
//! `single` runs one in-process worker over every active account with no
//! coordinator; `cluster` adds lease heartbeats and coordinator leadership
//! election so multiple processes can share the account set.
//!
//! Exit codes: 0 normal, 1 fatal startup error, 2 unrecoverable runtime
//! error. SIGTERM/SIGINT begin a graceful shutdown with a grace deadline.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use log::{error, info};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use mailhook::config::Settings;
use mailhook::coordinator::Coordinator;
use mailhook::imap::session::TlsSessionFactory;
use mailhook::imap::{HostLimiter, SessionPool};
use mailhook::store::{CredentialCipher, SealedCredentialProvider, Store};
use mailhook::webhook::{Dispatcher, HttpTransport};
use mailhook::worker::{AssignmentMode, Worker};
use mailhook::{Error, EXIT_OK, EXIT_STARTUP};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// One in-process worker, no coordinator.
    Single,
    /// Worker plus coordinator leadership election.
    Cluster,
}

#[derive(Parser)]
#[command(name = "mailhook", about = "Headless IMAP sync engine with webhook delivery")]
struct Cli {
    #[arg(long, value_enum, env = "MAILHOOK_MODE", default_value = "single")]
    mode: Mode,

    /// Overrides the configured database DSN.
    #[arg(long, env = "MAILHOOK_DATABASE_URL")]
    database_url: Option<String>,

    /// Stable worker identity; generated when omitted.
    #[arg(long, env = "MAILHOOK_WORKER_ID")]
    worker_id: Option<String>,

    /// Optional TOML configuration file.
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let settings = match Settings::new(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("failed to load configuration: {}", e);
            std::process::exit(EXIT_STARTUP);
        }
    };

    env_logger::init_from_env(
        env_logger::Env::new().default_filter_or(settings.log.level.clone()),
    );

    let exit_code = match run(cli, settings).await {
        Ok(()) => EXIT_OK,
        Err(e) => {
            error!("{}", e);
            e.exit_code()
        }
    };
    std::process::exit(exit_code);
}

async fn run(cli: Cli, settings: Settings) -> Result<(), Error> {
    let database_url = cli
        .database_url
        .clone()
        .unwrap_or_else(|| settings.database_url.clone());
    info!(
        "starting mailhook ({:?} mode), database {}",
        cli.mode, database_url
    );

    let store = Store::connect(&database_url).await?;

    let cipher = CredentialCipher::new(settings.credential_key.as_deref())?;
    let provider = Arc::new(SealedCredentialProvider::new(cipher));

    let limiter = Arc::new(HostLimiter::new(settings.limiter_config()));
    let factory = Arc::new(TlsSessionFactory::new(
        provider,
        Duration::from_secs(settings.imap.command_timeout_secs),
    ));
    let pool = SessionPool::new(limiter, factory, settings.pool_config());

    let worker_id = cli
        .worker_id
        .clone()
        .unwrap_or_else(|| format!("worker-{}", Uuid::new_v4()));
    let mode = match cli.mode {
        Mode::Single => AssignmentMode::All,
        Mode::Cluster => AssignmentMode::Assigned,
    };

    let cancel = CancellationToken::new();

    let transport = Arc::new(HttpTransport::new(Duration::from_secs(
        settings.webhook.http_timeout_secs,
    ))?);
    let dispatcher = Dispatcher::new(
        store.clone(),
        transport,
        settings.dispatch_config(),
        worker_id.clone(),
    );
    let dispatcher_cancel = cancel.clone();
    let dispatcher_task = tokio::spawn(async move {
        dispatcher.run(dispatcher_cancel).await;
    });

    let coordinator_task = match cli.mode {
        Mode::Cluster => {
            let coordinator = Coordinator::new(
                store.clone(),
                worker_id.clone(),
                settings.coordinator_config(),
            );
            let coordinator_cancel = cancel.clone();
            Some(tokio::spawn(async move {
                coordinator.run(coordinator_cancel).await;
            }))
        }
        Mode::Single => None,
    };

    let worker = Worker::new(
        store.clone(),
        pool,
        settings.sync_config(),
        settings.worker_config(),
        worker_id,
        mode,
    );
    let worker_cancel = cancel.clone();
    let worker_task = tokio::spawn(async move {
        worker.run(worker_cancel).await;
    });

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");
    cancel.cancel();

    worker_task
        .await
        .map_err(|e| Error::Runtime(format!("worker task failed: {}", e)))?;
    dispatcher_task
        .await
        .map_err(|e| Error::Runtime(format!("dispatcher task failed: {}", e)))?;
    if let Some(task) = coordinator_task {
        task.await
            .map_err(|e| Error::Runtime(format!("coordinator task failed: {}", e)))?;
    }

    info!("shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
