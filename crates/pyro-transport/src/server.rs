//! The `TransportServer` contract shared by the Multiplex and ThreadPool
//! variants.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::net::UdpSocket;

use pyro_core::error::PyroError;

/// An auxiliary datagram listener a `TransportServer` can drive inside
/// its own `requestLoop` tick, used to fold `BroadcastResponder` into the
/// same loop as the TCP listener.
pub struct AuxiliarySocket {
    pub socket: Arc<UdpSocket>,
    pub on_readable: Box<dyn Fn() + Send + Sync>,
}

/// A handle a caller flips to request `requestLoop` termination; observed
/// on the next `POLLTIMEOUT` tick.
#[derive(Clone, Default)]
pub struct LoopCondition {
    running: Arc<AtomicBool>,
}

impl LoopCondition {
    pub fn new() -> Self {
        LoopCondition {
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

#[async_trait]
pub trait TransportServer: Send + Sync {
    /// Human-readable `host:port`.
    fn location_str(&self) -> String;

    fn local_addr(&self) -> SocketAddr;

    /// Run until `condition.is_running()` returns false. `others` lets the
    /// caller fold an auxiliary listener (e.g. a broadcast responder)
    /// into the same loop.
    async fn request_loop(
        &self,
        condition: LoopCondition,
        others: Option<AuxiliarySocket>,
    ) -> Result<(), PyroError>;

    /// Close the listener and all client connections. Further calls are
    /// no-ops.
    async fn close(&self);
}
