// This file is part of corvid-indexer.
// Copyright (C) 2026 Corvid Project
// SPDX-License-Identifier: Apache-2.0

use crate::{
    domain::{
        ChainNotification,
        chain::{BlockProcessor, PeerManager},
        daemon::Daemon,
        mempool::Mempool,
        storage::Db,
    },
    infra,
    infra::api::manager::SessionManager,
};
use anyhow::Context as AnyhowContext;
use indexer_common::domain::Event;
use log::warn;
use serde::Deserialize;
use tokio::{select, signal::unix::Signal, sync::mpsc, task};

/// Chain identity of the served index.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub coin: String,
    pub ticker: String,
    pub genesis_hash: String,
}

/// Run the session layer until SIGTERM or an operator `stop` command. The
/// external listeners start once `ready` is triggered; `notifications`
/// delivers chain updates from the block processor.
#[allow(clippy::too_many_arguments)]
pub async fn run<D, M, R, P, B>(
    config: Config,
    api_config: infra::api::Config,
    db: D,
    mempool: M,
    daemon: R,
    peers: P,
    bp: B,
    notifications: mpsc::Receiver<ChainNotification>,
    ready: Event,
    mut sigterm: Signal,
) -> anyhow::Result<()>
where
    D: Db,
    M: Mempool,
    R: Daemon,
    P: PeerManager,
    B: BlockProcessor,
{
    let shutdown = Event::new();
    let manager = SessionManager::new(
        config,
        api_config,
        db,
        mempool,
        daemon,
        peers,
        bp,
        shutdown.clone(),
    )
    .context("create session manager")?;

    let mut serve_task = task::spawn(manager.clone().serve(notifications, ready));

    select! {
        result = &mut serve_task => {
            return result
                .context("serve_task panicked")
                .and_then(|result| result.context("serve_task failed"));
        }

        _ = sigterm.recv() => {
            warn!("SIGTERM received");
            shutdown.set();
        }
    }

    // Let the manager run its teardown: close listeners, then sessions.
    serve_task
        .await
        .context("serve_task panicked")
        .and_then(|result| result.context("serve_task failed"))
}
