//! `BroadcastResponder` — the UDP listener that answers `GET_NSURI`
//! discovery queries with the current name-server URI.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::net::UdpSocket;
use tracing::{debug, warn};

use pyro_core::sockutil::create_broadcast;
use pyro_core::uri::Uri;

const QUERY: &[u8] = b"GET_NSURI";
const MAX_DATAGRAM: usize = 100;

pub struct BroadcastResponder {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    ns_uri: Uri,
    stopped: Arc<AtomicBool>,
}

impl BroadcastResponder {
    pub async fn bind(bind_addr: SocketAddr, ns_uri: Uri) -> std::io::Result<Self> {
        let socket = create_broadcast(Some(bind_addr)).await?;
        let local_addr = socket.local_addr()?;
        Ok(BroadcastResponder {
            socket: Arc::new(socket),
            local_addr,
            ns_uri,
            stopped: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn socket(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.socket)
    }

    /// Receive and answer queries until `shutdown` is called. Every
    /// socket-level error is logged and swallowed; only a genuine
    /// shutdown signal ends the loop.
    pub async fn run(&self) {
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            let (n, peer) = match self.socket.recv_from(&mut buf).await {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(error = %err, "broadcast responder socket error");
                    continue;
                }
            };

            if self.stopped.load(Ordering::Acquire) {
                return;
            }

            if &buf[..n] == QUERY {
                let reply = self.ns_uri.to_string();
                if let Err(err) = self.socket.send_to(reply.as_bytes(), peer).await {
                    warn!(error = %err, %peer, "failed to answer GET_NSURI");
                } else {
                    debug!(%peer, "answered GET_NSURI");
                }
            }
        }
    }

    /// Close the responder's receive loop. Since a blocking `recv_from`
    /// won't observe the stop flag on its own, this sends the socket a
    /// dummy datagram addressed to itself to unblock it.
    pub async fn shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
        let _ = self.socket.send_to(b"\0", self.local_addr).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::UdpSocket as ClientSocket;

    #[tokio::test]
    async fn answers_get_nsuri_with_current_uri() {
        let ns_uri = Uri::pyro("Pyro.NameServer", "127.0.0.1", 9090);
        let responder = BroadcastResponder::bind("127.0.0.1:0".parse().unwrap(), ns_uri.clone())
            .await
            .unwrap();
        let addr = responder.local_addr();

        let responder = Arc::new(responder);
        let run_task = {
            let responder = Arc::clone(&responder);
            tokio::spawn(async move { responder.run().await })
        };

        let client = ClientSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(QUERY, addr).await.unwrap();

        let mut buf = [0u8; MAX_DATAGRAM];
        let (n, _) = tokio::time::timeout(Duration::from_millis(500), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], ns_uri.to_string().as_bytes());

        responder.shutdown().await;
        let _ = tokio::time::timeout(Duration::from_millis(200), run_task).await;
    }

    #[tokio::test]
    async fn ignores_unrecognized_payloads() {
        let ns_uri = Uri::pyro("Pyro.NameServer", "127.0.0.1", 9090);
        let responder = BroadcastResponder::bind("127.0.0.1:0".parse().unwrap(), ns_uri)
            .await
            .unwrap();
        let addr = responder.local_addr();
        let responder = Arc::new(responder);
        let run_task = {
            let responder = Arc::clone(&responder);
            tokio::spawn(async move { responder.run().await })
        };

        let client = ClientSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"not a query", addr).await.unwrap();

        let mut buf = [0u8; MAX_DATAGRAM];
        let result = tokio::time::timeout(Duration::from_millis(100), client.recv_from(&mut buf)).await;
        assert!(result.is_err(), "responder must not reply to unrecognized payloads");

        responder.shutdown().await;
        let _ = tokio::time::timeout(Duration::from_millis(200), run_task).await;
    }
}
