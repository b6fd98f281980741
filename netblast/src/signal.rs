use std::sync::Arc;
use tokio::sync::watch;
use tracing::warn;

/// Sets the shutdown flag on SIGINT or SIGTERM; in-flight work drains on
/// its own.
pub(crate) async fn shutdown_on_signal(shutdown_tx: Arc<watch::Sender<bool>>) {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            warn!("cannot install SIGTERM handler: {:?}", e);
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
    eprintln!("Received interrupt.  Shutting down.");
    let _ = shutdown_tx.send(true);
}
