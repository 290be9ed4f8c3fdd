//! The callback contract a `TransportServer` drives:
//! "a callback object with two methods: `handshake(conn) -> bool` ...
//! and `handleRequest(conn)`".

use async_trait::async_trait;
use tokio::net::TcpStream;

use pyro_core::error::{CommunicationError, PyroError};

use crate::connection::Connection;

/// Implemented by whatever owns the object table a transport dispatches
/// into — in this workspace, `pyro_switch::Daemon`.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Complete any protocol handshake on a freshly accepted connection.
    /// Returns `true` on success; `false` tells the transport to close
    /// the connection without entering the request loop.
    async fn handshake(&self, conn: &Connection, stream: &mut TcpStream) -> Result<bool, PyroError>;

    /// Process exactly one framed request on `stream` and write its
    /// reply. Errors of kind `ConnectionClosedError` or a generic socket
    /// error close the connection; any other error propagates to the
    /// transport's caller.
    async fn handle_request(
        &self,
        conn: &Connection,
        stream: &mut TcpStream,
    ) -> Result<(), PyroError>;
}

/// True when an error closes the connection rather than propagating:
/// only `ConnectionClosed` and a generic socket error close the
/// connection; everything else (a protocol violation, a timeout)
/// propagates so the caller halts instead of quietly dropping it.
pub fn is_connection_fatal(err: &PyroError) -> bool {
    matches!(
        err,
        PyroError::Communication(CommunicationError::ConnectionClosed { .. })
            | PyroError::Communication(CommunicationError::Io(_))
    )
}
