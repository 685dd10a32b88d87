//! Voice Worker
//!
//! Child-process voice worker. Speaks the worker protocol over stdio:
//! commands arrive on stdin, events leave on stdout, and JSON logs go to
//! stderr so they never corrupt the frame stream.
//!
//! # Configuration
//!
//! - `VOICE_WORKER_NAME`: name used in logs (default: `voice-worker`)
//! - `RUST_LOG`: log filter (default: `voice_worker=info`)

#![warn(clippy::pedantic)]

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use voice_worker::{serve, DiscardTransport};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_worker=info,vc=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
        .init();

    let name = std::env::var("VOICE_WORKER_NAME").unwrap_or_else(|_| "voice-worker".to_string());
    info!(worker = %name, pid = std::process::id(), "Starting voice worker");

    let cancel_token = CancellationToken::new();
    let signal_token = cancel_token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping worker");
            signal_token.cancel();
        }
    });

    let exit = serve(
        &name,
        tokio::io::stdin(),
        tokio::io::stdout(),
        DiscardTransport::default(),
        cancel_token,
    )
    .await
    .with_context(|| format!("voice worker {name} failed"))?;

    info!(worker = %name, exit = ?exit, "Voice worker exiting");
    Ok(())
}
