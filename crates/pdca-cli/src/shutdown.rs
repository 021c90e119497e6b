use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Exit status for a run stopped by SIGINT/SIGTERM.
pub const EXIT_INTERRUPTED: u8 = 130;

/// Cancels the returned token on the first SIGINT or SIGTERM.
pub fn register_handlers() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();

    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(err) = signal::ctrl_c().await {
                error!(error = %err, "failed to install SIGINT handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(err) => {
                    error!(error = %err, "failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("received SIGINT, finishing the current tick"),
            _ = terminate => info!("received SIGTERM, finishing the current tick"),
        }
        cancel.cancel();
    });

    token
}
