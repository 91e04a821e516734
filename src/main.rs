// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::Cli;
use courier_bot::{Orchestrator, TelegramApi};
use courier_claude::history::SessionResolver;
use courier_claude::manager::ClientManager;
use courier_claude::options::OptionsBuilder;
use courier_storage::SessionStore;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.debug);

    match run(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal error");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli) -> anyhow::Result<()> {
    let config = Arc::new(
        courier_config::load(cli.config_file.as_deref()).context("loading configuration")?,
    );

    if config.bot.token.is_empty() {
        anyhow::bail!(
            "no bot token configured; set bot.token in the config file \
             or the COURIER_BOT_TOKEN environment variable"
        );
    }
    if config.claude.approved_directories.is_empty() {
        anyhow::bail!("no approved directories configured; set claude.approved_directories");
    }

    let store = Arc::new(
        SessionStore::open(&config.storage.database_path).context("opening session store")?,
    );
    let options = OptionsBuilder::new(
        config.claude.settings_path(),
        config.claude.cli_path.clone(),
    );
    let resolver = SessionResolver::new(config.claude.history_path());
    let manager = ClientManager::new(
        store,
        options,
        resolver,
        Duration::from_secs(config.claude.idle_timeout_secs),
    );

    let api = Arc::new(TelegramApi::new(&config.bot.token));
    let orchestrator = Orchestrator::new(api.clone(), manager.clone(), config.clone());

    info!(
        approved = config.claude.approved_directories.len(),
        "courier starting"
    );

    let poll_timeout = config.bot.poll_timeout_secs;
    let mut offset = 0i64;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let batch = tokio::select! {
            biased;
            _ = &mut shutdown => break,
            batch = api.get_updates(offset, poll_timeout) => batch,
        };

        match batch {
            Ok(updates) => {
                for update in updates {
                    offset = offset.max(update.update_id + 1);
                    let orchestrator = orchestrator.clone();
                    tokio::spawn(async move {
                        orchestrator.handle_update(update).await;
                    });
                }
            }
            Err(e) => {
                warn!(error = %e, "getUpdates failed; backing off");
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    }

    info!("shutting down; disconnecting all clients");
    manager.disconnect_all().await;
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let Ok(mut sigterm) = signal(SignalKind::terminate()) else {
            let _ = tokio::signal::ctrl_c().await;
            return;
        };
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = tokio::signal::ctrl_c() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn init_logging(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
