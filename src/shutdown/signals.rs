//! Stop-request sources.
//!
//! ## Unix
//! `SIGINT`, `SIGTERM` and `SIGQUIT` are treated as stop requests, with
//! [`tokio::signal::ctrl_c`] awaited as a fallback.
//!
//! ## Windows
//! Only [`tokio::signal::ctrl_c`] is awaited.

use futures::future::{self, FutureExt};
use tokio_util::sync::CancellationToken;

/// Completes as soon as any of `sources` is cancelled.
///
/// With no sources the returned future never completes.
pub async fn first_of(sources: Vec<CancellationToken>) {
    if sources.is_empty() {
        return future::pending::<()>().await;
    }

    let waits = sources
        .into_iter()
        .map(|source| source.cancelled_owned().boxed());
    future::select_all(waits).await;
}

/// Waits for a termination signal.
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    let name = tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = sigint.recv() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
        _ = sigquit.recv() => "SIGQUIT",
    };
    Ok(name)
}

/// Waits for a termination signal.
#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("Ctrl+C")
}
