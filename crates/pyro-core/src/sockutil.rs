//! Socket creation and framed send/recv helpers.
//!
//! Grounded on the socket-configuration technique in
//! `spark-transport-tcp::channel::TcpSocketConfig::apply`, which reaches
//! through `socket2::SockRef` to set options Tokio doesn't expose
//! directly (there, `SO_LINGER`; here, `SO_REUSEADDR`/`SO_KEEPALIVE`/
//! `SO_BROADCAST`).

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use socket2::{Domain, Protocol as SockProtocol, SockRef, Socket as Socket2, Type};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::timeout;

use crate::error::CommunicationError;

const LISTEN_BACKLOG: i32 = 200;

/// Bind a TCP listener with `SO_REUSEADDR`/`SO_KEEPALIVE` and a backlog of
/// 200, mirroring the reference implementation's `createStream(bind=...)`.
pub async fn bind_stream(addr: SocketAddr) -> io::Result<TcpListener> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket2::new(domain, Type::STREAM, Some(SockProtocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    TcpListener::from_std(socket.into())
}

/// Connect a TCP stream with `SO_KEEPALIVE` set, mirroring
/// `createStream(connect=...)`.
pub async fn connect_stream(addr: SocketAddr) -> io::Result<TcpStream> {
    let stream = TcpStream::connect(addr).await?;
    SockRef::from(&stream).set_keepalive(true)?;
    Ok(stream)
}

/// Create a UDP broadcast socket. When `bind` is given with an empty host,
/// tries `["<broadcast>", "", "255.255.255.255"]` in turn until one binds.
pub async fn create_broadcast(bind: Option<SocketAddr>) -> io::Result<UdpSocket> {
    let socket = Socket2::new(Domain::IPV4, Type::DGRAM, Some(SockProtocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;

    if let Some(addr) = bind {
        if !addr.ip().is_unspecified() {
            socket.bind(&addr.into())?;
            return UdpSocket::from_std(socket.into());
        }

        let candidates = ["255.255.255.255", "0.0.0.0", "255.255.255.255"];
        let mut last_err = None;
        for host in candidates {
            let candidate: SocketAddr = format!("{host}:{}", addr.port())
                .parse()
                .expect("candidate broadcast address is well-formed");
            match socket.bind(&candidate.into()) {
                Ok(()) => return UdpSocket::from_std(socket.into()),
                Err(err) => last_err = Some(err),
            }
        }
        return Err(last_err.unwrap_or_else(|| io::Error::other("failed to bind broadcast socket")));
    }

    UdpSocket::from_std(socket.into())
}

/// Read exactly `n` bytes, mapping a timeout or short read/close into
/// `CommunicationError`. The partial bytes already read are carried on
/// `ConnectionClosed` so callers can log diagnostics.
pub async fn recv_exact<R>(
    reader: &mut R,
    n: usize,
    deadline: Option<Duration>,
) -> Result<Vec<u8>, CommunicationError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; n];
    let read_all = async {
        let mut filled = 0usize;
        while filled < n {
            let read = reader.read(&mut buf[filled..]).await?;
            if read == 0 {
                return Err(CommunicationError::ConnectionClosed {
                    partial: buf[..filled].to_vec(),
                });
            }
            filled += read;
        }
        Ok(())
    };

    match deadline {
        Some(d) => match timeout(d, read_all).await {
            Ok(result) => result?,
            Err(_) => return Err(CommunicationError::Timeout),
        },
        None => read_all.await?,
    }

    Ok(buf)
}

/// Write all bytes, mapping a timeout into `CommunicationError::Timeout`.
/// Tokio's `write_all` already loops past `Interrupted`/`WouldBlock`
/// internally, so no manual retry loop is needed here.
pub async fn send_all<W>(
    writer: &mut W,
    bytes: &[u8],
    deadline: Option<Duration>,
) -> Result<(), CommunicationError>
where
    W: AsyncWrite + Unpin,
{
    let write_all = writer.write_all(bytes);
    match deadline {
        Some(d) => match timeout(d, write_all).await {
            Ok(result) => result.map_err(CommunicationError::from),
            Err(_) => Err(CommunicationError::Timeout),
        },
        None => write_all.await.map_err(CommunicationError::from),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn recv_exact_returns_requested_bytes() {
        let mut cursor = Cursor::new(vec![1, 2, 3, 4, 5]);
        let data = recv_exact(&mut cursor, 5, None).await.unwrap();
        assert_eq!(data, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn recv_exact_reports_partial_on_short_read() {
        let mut cursor = Cursor::new(vec![1, 2, 3]);
        let err = recv_exact(&mut cursor, 5, None).await.unwrap_err();
        assert_eq!(err.partial_data(), Some(&[1u8, 2, 3][..]));
    }

    #[tokio::test]
    async fn recv_exact_times_out() {
        let (mut client, _server) = tokio::io::duplex(16);
        let err = recv_exact(&mut client, 5, Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, CommunicationError::Timeout));
    }
}
