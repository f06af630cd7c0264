//! Graceful shutdown utilities
//!
//! Signal handling for long-running twinrule commands. A signal cancels the
//! run's token; the engine then stops its actors without publishing partial
//! output.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Wait for shutdown signal (Ctrl+C or SIGTERM on Unix)
pub async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term_signal = match signal(SignalKind::terminate()) {
            Ok(sig) => Some(sig),
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}. Only Ctrl+C will stop the run", e);
                None
            },
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = async {
                match term_signal.as_mut() {
                    Some(sig) => {
                        sig.recv().await;
                    },
                    None => std::future::pending::<()>().await,
                }
            } => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Token cancelled on the first shutdown signal
///
/// # Example
///
/// ```ignore
/// let cancel = common::shutdown::cancel_on_shutdown();
/// engine.run_realtime(rx, sinks, &cancel).await?;
/// ```
pub fn cancel_on_shutdown() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = wait_for_shutdown() => {
                info!("Shutdown signal received, cancelling run");
                token.cancel();
            },
            _ = token.cancelled() => {},
        }
    });
    cancel
}
