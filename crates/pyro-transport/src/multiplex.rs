//! The Multiplex `TransportServer` variant: a single
//! cooperative loop over the listener, all client connections, and any
//! auxiliary socket, so no two `handleRequest` calls are ever in flight
//! at once on the same daemon.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use pyro_core::error::{CommunicationError, PyroError};

use crate::connection::Connection;
use crate::handler::{RequestHandler, is_connection_fatal};
use crate::server::{AuxiliarySocket, LoopCondition, TransportServer};

/// One client slot driven by the multiplex loop: the socket plus the
/// metadata bound to it during the handshake.
struct Client {
    stream: TcpStream,
    conn: Arc<Connection>,
}

/// Processes exactly one request on a client. `Ok(Some(client))`
/// re-inserts it into the connection set; `Ok(None)` drops it silently
/// (peer closed, or a connection-fatal error); `Err` is a non-fatal
/// error that must propagate out of `request_loop` so the loop halts
/// instead of papering over it.
async fn service_one(
    mut client: Client,
    handler: Arc<dyn RequestHandler>,
) -> Result<Option<Client>, PyroError> {
    match handler.handle_request(&client.conn, &mut client.stream).await {
        Ok(()) => Ok(Some(client)),
        Err(err) if is_connection_fatal(&err) => {
            debug!(peer = %client.conn.peer_addr(), error = %err, "closing connection");
            Ok(None)
        }
        Err(err) => {
            warn!(peer = %client.conn.peer_addr(), error = %err, "non-fatal handler error, halting loop");
            Err(err)
        }
    }
}

pub struct MultiplexServer {
    listener: StdMutex<Option<Arc<TcpListener>>>,
    local_addr: SocketAddr,
    handler: Arc<dyn RequestHandler>,
    poll_timeout: Duration,
}

impl MultiplexServer {
    pub fn new(
        listener: TcpListener,
        handler: Arc<dyn RequestHandler>,
        poll_timeout: Duration,
    ) -> Result<Self, PyroError> {
        let local_addr = listener.local_addr()?;
        Ok(MultiplexServer {
            listener: StdMutex::new(Some(Arc::new(listener))),
            local_addr,
            handler,
            poll_timeout,
        })
    }

    fn current_listener(&self) -> Option<Arc<TcpListener>> {
        self.listener.lock().expect("listener lock poisoned").clone()
    }
}

#[async_trait]
impl TransportServer for MultiplexServer {
    fn location_str(&self) -> String {
        self.local_addr.to_string()
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn request_loop(
        &self,
        condition: LoopCondition,
        others: Option<AuxiliarySocket>,
    ) -> Result<(), PyroError> {
        let mut in_flight = FuturesUnordered::new();
        let mut idle_clients: Vec<Client> = Vec::new();

        while condition.is_running() {
            let listener = match self.current_listener() {
                Some(l) => l,
                None => return Err(CommunicationError::ConnectionClosed { partial: vec![] }.into()),
            };

            // Kick off one handler future per currently-idle client.
            while let Some(client) = idle_clients.pop() {
                let handler = Arc::clone(&self.handler);
                in_flight.push(service_one(client, handler));
            }

            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((mut stream, peer)) => {
                            let conn = Arc::new(Connection::new(peer));
                            match self.handler.handshake(&conn, &mut stream).await {
                                Ok(true) => idle_clients.push(Client { stream, conn }),
                                Ok(false) => debug!(%peer, "handshake declined"),
                                Err(err) => warn!(%peer, error = %err, "handshake failed"),
                            }
                        }
                        Err(err) if is_retryable(&err) => {
                            warn!(error = %err, "retryable accept error");
                        }
                        Err(err) => {
                            warn!(error = %err, "listener socket destroyed");
                            return Err(CommunicationError::Io(err).into());
                        }
                    }
                }
                Some(result) = in_flight.next(), if !in_flight.is_empty() => {
                    match result {
                        Ok(Some(client)) => idle_clients.push(client),
                        Ok(None) => {}
                        Err(err) => return Err(err),
                    }
                }
                Some(()) = poll_auxiliary(&others) => {}
                _ = tokio::time::sleep(self.poll_timeout) => {}
            }
        }

        self.close().await;
        Ok(())
    }

    async fn close(&self) {
        self.listener.lock().expect("listener lock poisoned").take();
    }
}

fn is_retryable(err: &std::io::Error) -> bool {
    use std::io::ErrorKind::*;
    matches!(err.kind(), WouldBlock | Interrupted | ConnectionAborted)
}

/// Polls the auxiliary socket's readiness, invoking its handler on
/// readability. Resolves to `None` forever (never wins the `select!`)
/// when no auxiliary socket was supplied.
async fn poll_auxiliary(others: &Option<AuxiliarySocket>) -> Option<()> {
    match others {
        Some(aux) => {
            let mut buf = [0u8; 1];
            let _ = aux.socket.peek(&mut buf).await;
            (aux.on_readable)();
            Some(())
        }
        None => std::future::pending().await,
    }
}
