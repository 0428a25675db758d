use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Install a shutdown handler that listens for SIGTERM and SIGINT.
///
/// Returns a `CancellationToken` that is cancelled when either signal is
/// received, or right away if the handlers cannot be installed.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        let signals = signal(SignalKind::terminate())
            .and_then(|term| Ok((term, signal(SignalKind::interrupt())?)));
        let (mut sigterm, mut sigint) = match signals {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handlers");
                token_clone.cancel();
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, stopping background tasks");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, stopping background tasks");
            }
        }

        token_clone.cancel();
    });

    token
}
