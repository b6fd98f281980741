//! The worker's blast server: accepts inbound peer connections and speaks
//! the responder side of the blast wire protocol. The accept loop runs in
//! its own task so a slow in-progress transfer cannot starve `accept`.

use crate::blast;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{info, warn};

/// Accept loop; runs until shutdown is signalled. Each accepted connection
/// is served in its own task. The responder never reports to the manager,
/// the initiator reports both directions.
pub async fn serve(listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(handle(stream, peer));
                }
                Err(e) => warn!("blast accept failed: {:?}", e),
            },
            _ = shutdown.changed() => break,
        }
    }
}

async fn handle(stream: TcpStream, peer: SocketAddr) {
    match blast::respond(stream).await {
        Ok((role, outcome)) => info!(
            "served {} blast from {}: sent {} received {} bytes in {:.2} seconds",
            role, peer, outcome.bytes_sent, outcome.bytes_received, outcome.elapsed
        ),
        Err(e) => warn!("blast from {} failed: {:?}", peer, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Direction;
    use std::time::Duration;

    #[tokio::test]
    async fn responds_to_blasts() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let serving = tokio::spawn(serve(listener, shutdown_rx));

        // a bidirectional blast moves bytes both ways
        let stream = TcpStream::connect(addr).await.unwrap();
        let outcome =
            blast::run_initiator(stream, Direction::Both, Duration::from_secs(1))
                .await
                .unwrap();
        assert!(outcome.bytes_sent > 0);
        assert!(outcome.bytes_received > 0);

        // a send-only blast receives nothing back
        let stream = TcpStream::connect(addr).await.unwrap();
        let outcome = blast::run_initiator(
            stream,
            Direction::Send,
            Duration::from_millis(100),
        )
        .await
        .unwrap();
        assert!(outcome.bytes_sent > 0);
        assert_eq!(outcome.bytes_received, 0);

        shutdown_tx.send(true).unwrap();
        serving.await.unwrap();
    }
}
