//! `Connection` — the object-id binding and peer metadata associated with
//! one accepted socket. The socket itself is owned by
//! whichever loop drives it (the Multiplex task's connection set, or a
//! `WorkerPool` worker); `Connection` carries only what a `RequestHandler`
//! needs across calls to `handshake`/`handle_request`.

use std::net::SocketAddr;
use std::sync::Mutex;

/// Metadata bound to one accepted client socket, created on accept and
/// dropped on close or detected peer loss.
#[derive(Debug)]
pub struct Connection {
    peer_addr: SocketAddr,
    object_id: Mutex<Option<String>>,
}

impl Connection {
    pub fn new(peer_addr: SocketAddr) -> Self {
        Connection {
            peer_addr,
            object_id: Mutex::new(None),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Set during the handler's `handshake` step.
    pub fn set_object_id(&self, id: String) {
        *self.object_id.lock().expect("connection lock poisoned") = Some(id);
    }

    pub fn object_id(&self) -> Option<String> {
        self.object_id.lock().expect("connection lock poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_id_starts_unset() {
        let conn = Connection::new("127.0.0.1:0".parse().unwrap());
        assert!(conn.object_id().is_none());
        conn.set_object_id("obj-1".to_string());
        assert_eq!(conn.object_id().as_deref(), Some("obj-1"));
    }
}
