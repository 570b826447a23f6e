// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::error;

use droverd::config::{ControlConfig, SUPPORTED_PROTOCOL_VERSION};

#[derive(Debug, Parser)]
#[command(name = "droverd", version, about = "Control plane for a fleet of AI agent processes")]
struct Cli {
    #[command(flatten)]
    config: ControlConfig,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if cli.config.protocol_version != SUPPORTED_PROTOCOL_VERSION {
        error!(
            "unsupported protocol version {} (this build speaks {SUPPORTED_PROTOCOL_VERSION})",
            cli.config.protocol_version
        );
        std::process::exit(64);
    }
    if let Err(e) = cli.config.validate() {
        error!("config error: {e:#}");
        std::process::exit(2);
    }

    let shutdown = CancellationToken::new();
    let signalled = Arc::new(AtomicBool::new(false));
    spawn_signal_handler(shutdown.clone(), Arc::clone(&signalled));

    if let Err(e) = droverd::run(cli.config, shutdown).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }

    if signalled.load(Ordering::Relaxed) {
        std::process::exit(130);
    }
}

fn spawn_signal_handler(shutdown: CancellationToken, signalled: Arc<AtomicBool>) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    error!("failed to install SIGTERM handler: {e}");
                    let _ = ctrl_c.await;
                    signalled.store(true, Ordering::Relaxed);
                    shutdown.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }

        tracing::info!("shutdown signal received");
        signalled.store(true, Ordering::Relaxed);
        shutdown.cancel();
    });
}
