//! TCP listener for clients and peer daemons

use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::connection::handle_client;
use crate::state::SharedState;

/// Run the TCP accept loop until shutdown
pub async fn run_tcp_accept_loop(listener: TcpListener, shared_state: SharedState) {
    match listener.local_addr() {
        Ok(addr) => info!("TCP listener bound to {}", addr),
        Err(e) => debug!("TCP listener address unknown: {}", e),
    }

    let mut shutdown_rx = shared_state.subscribe_shutdown();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        debug!("New TCP connection from {}", peer_addr);
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("set_nodelay on {}: {}", peer_addr, e);
                        }
                        let state_clone = shared_state.clone();
                        let peer_host = peer_addr.ip().to_string();
                        tokio::spawn(async move {
                            handle_client(stream, peer_host, state_clone).await;
                        });
                    }
                    Err(e) => {
                        error!("TCP accept error: {}", e);
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received, stopping TCP accept loop");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_state;
    use std::sync::Arc;
    use std::time::Duration;
    use xpd_client::{Connection, LoginParams};
    use xpd_protocol::{Role, DAEMON_VERSION};

    #[tokio::test]
    async fn test_tcp_listener_serves_and_stops() {
        let root = tempfile::tempdir().unwrap();
        let shared_state = Arc::new(test_state(&root));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let handle = tokio::spawn(run_tcp_accept_loop(listener, Arc::clone(&shared_state)));

        let mut conn = Connection::new(format!("127.0.0.1:{}", port)).with_timeout(Duration::from_secs(2));
        conn.connect().await.unwrap();
        assert_eq!(conn.server_version(), Some(DAEMON_VERSION));
        conn.login(&LoginParams::new("alice", Role::Admin)).await.unwrap();

        shared_state.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(result.is_ok(), "TCP listener did not shut down");
    }
}
