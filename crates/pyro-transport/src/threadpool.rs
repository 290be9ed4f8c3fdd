//! The ThreadPool `TransportServer` variant: a dedicated
//! accept loop hands each connection to a `WorkerPool` job, so distinct
//! connections can be serviced in parallel.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use pyro_core::error::{CommunicationError, PyroError};

use crate::connection::Connection;
use crate::handler::{RequestHandler, is_connection_fatal};
use crate::pool::WorkerPool;
use crate::server::{AuxiliarySocket, LoopCondition, TransportServer};

pub struct ThreadPoolServer {
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    handler: Arc<dyn RequestHandler>,
    pool: WorkerPool,
    poll_timeout: Duration,
}

impl ThreadPoolServer {
    pub fn new(
        listener: TcpListener,
        handler: Arc<dyn RequestHandler>,
        pool: WorkerPool,
        poll_timeout: Duration,
    ) -> Result<Self, PyroError> {
        let local_addr = listener.local_addr()?;
        Ok(ThreadPoolServer {
            listener: Mutex::new(Some(listener)),
            local_addr,
            handler,
            pool,
            poll_timeout,
        })
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }
}

/// The job a worker runs for one accepted connection: handshake, then
/// loop `handle_request` until the socket errors or closes. A non-fatal
/// error panics the job so `pool.rs`'s `catch_unwind` halts the worker,
/// rather than silently dropping the connection like a fatal error does.
async fn service_connection(
    mut stream: tokio::net::TcpStream,
    conn: Arc<Connection>,
    handler: Arc<dyn RequestHandler>,
) {
    match handler.handshake(&conn, &mut stream).await {
        Ok(true) => {}
        Ok(false) => {
            debug!(peer = %conn.peer_addr(), "handshake declined");
            return;
        }
        Err(err) => {
            warn!(peer = %conn.peer_addr(), error = %err, "handshake failed");
            return;
        }
    }

    loop {
        match handler.handle_request(&conn, &mut stream).await {
            Ok(()) => continue,
            Err(err) if is_connection_fatal(&err) => {
                debug!(peer = %conn.peer_addr(), error = %err, "closing connection");
                return;
            }
            Err(err) => {
                warn!(peer = %conn.peer_addr(), error = %err, "non-fatal handler error, halting worker");
                panic!("non-fatal handler error on {}: {err}", conn.peer_addr());
            }
        }
    }
}

#[async_trait]
impl TransportServer for ThreadPoolServer {
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
        while condition.is_running() {
            let listener_guard = self.listener.lock().await;
            let listener = match listener_guard.as_ref() {
                Some(l) => l,
                None => return Err(CommunicationError::ConnectionClosed { partial: vec![] }.into()),
            };

            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let conn = Arc::new(Connection::new(peer));
                            let handler = Arc::clone(&self.handler);
                            self.pool.process(Box::pin(service_connection(stream, conn, handler)));
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
                Some(()) = poll_auxiliary(&others) => {}
                _ = tokio::time::sleep(self.poll_timeout) => {}
            }
        }

        self.close().await;
        Ok(())
    }

    /// Close the listener and push one `Halt` sentinel per current
    /// worker onto the job queue. Does not wait for
    /// in-flight jobs to finish; call `pool().drain()` first if that is
    /// required.
    async fn close(&self) {
        self.listener.lock().await.take();
        self.pool.close();
    }
}

fn is_retryable(err: &std::io::Error) -> bool {
    use std::io::ErrorKind::*;
    matches!(err.kind(), WouldBlock | Interrupted | ConnectionAborted)
}

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

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait as async_trait_attr;
    use pyro_core::sockutil::bind_stream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    struct SlowEchoHandler {
        calls: Arc<AtomicUsize>,
        delay: Duration,
    }

    #[async_trait_attr]
    impl RequestHandler for SlowEchoHandler {
        async fn handshake(&self, _conn: &Connection, _stream: &mut TcpStream) -> Result<bool, PyroError> {
            Ok(true)
        }

        async fn handle_request(
            &self,
            _conn: &Connection,
            stream: &mut TcpStream,
        ) -> Result<(), PyroError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut byte = [0u8; 1];
            let n = stream.read(&mut byte).await.map_err(CommunicationError::from)?;
            if n == 0 {
                return Err(CommunicationError::ConnectionClosed { partial: vec![] }.into());
            }
            tokio::time::sleep(self.delay).await;
            stream.write_all(&byte).await.map_err(CommunicationError::from)?;
            Ok(())
        }
    }

    struct ProtocolErrorHandler;

    #[async_trait_attr]
    impl RequestHandler for ProtocolErrorHandler {
        async fn handshake(&self, _conn: &Connection, _stream: &mut TcpStream) -> Result<bool, PyroError> {
            Ok(true)
        }

        async fn handle_request(
            &self,
            _conn: &Connection,
            stream: &mut TcpStream,
        ) -> Result<(), PyroError> {
            let mut byte = [0u8; 1];
            stream.read(&mut byte).await.map_err(CommunicationError::from)?;
            Err(CommunicationError::Protocol("malformed frame".to_string()).into())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn non_fatal_handler_error_halts_the_worker() {
        let listener = bind_stream("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let handler = Arc::new(ProtocolErrorHandler);
        let pool = WorkerPool::new(1, 1, Duration::from_secs(5));
        let server = Arc::new(
            ThreadPoolServer::new(listener, handler, pool.clone(), Duration::from_millis(50)).unwrap(),
        );
        let addr = server.local_addr();

        let condition = LoopCondition::new();
        let server_task = {
            let server = Arc::clone(&server);
            let condition = condition.clone();
            tokio::spawn(async move { server.request_loop(condition, None).await })
        };

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"x").await.unwrap();

        // the panic runs through `catch_unwind` in pool.rs, so the worker
        // count should drop to zero instead of staying at MIN=1.
        let mut dropped = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if pool.worker_count() == 0 {
                dropped = true;
                break;
            }
        }
        assert!(dropped, "worker must halt after a non-fatal handler error");

        condition.stop();
        drop(stream);
        let _ = tokio::time::timeout(Duration::from_millis(200), server_task).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn two_connections_are_serviced_in_parallel() {
        let listener = bind_stream("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = Arc::new(SlowEchoHandler {
            calls: Arc::clone(&calls),
            delay: Duration::from_millis(100),
        });
        let pool = WorkerPool::new(2, 4, Duration::from_secs(5));
        let server = Arc::new(
            ThreadPoolServer::new(listener, handler, pool, Duration::from_millis(50)).unwrap(),
        );
        let addr = server.local_addr();

        let condition = LoopCondition::new();
        let server_task = {
            let server = Arc::clone(&server);
            let condition = condition.clone();
            tokio::spawn(async move { server.request_loop(condition, None).await })
        };

        let started = Instant::now();
        let mut a = TcpStream::connect(addr).await.unwrap();
        let mut b = TcpStream::connect(addr).await.unwrap();
        a.write_all(b"a").await.unwrap();
        b.write_all(b"b").await.unwrap();
        let mut buf = [0u8; 1];
        a.read_exact(&mut buf).await.unwrap();
        b.read_exact(&mut buf).await.unwrap();
        let elapsed = started.elapsed();

        // Two 100ms handlers overlapping should take well under 200ms.
        assert!(elapsed < Duration::from_millis(180), "elapsed={elapsed:?}");
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        condition.stop();
        drop(a);
        drop(b);
        let _ = tokio::time::timeout(Duration::from_millis(200), server_task).await;
    }
}
