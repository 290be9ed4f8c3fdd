//! `Resolver` — turns any `Uri` into a concrete `PYRO` uri, dialing
//! out to a remote daemon or name server when the input doesn't
//! already carry a location.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpStream;
use tracing::debug;

use pyro_core::config::Config;
use pyro_core::error::{CommunicationError, PyroError};
use pyro_core::frame::{self, ReplyFrame, ReplyStatus, RequestFrame};
use pyro_core::sockutil::{connect_stream, create_broadcast};
use pyro_core::uri::{Protocol, Uri};

use crate::daemon::RESERVED_DAEMON_ID;
use crate::nameserver::RESERVED_NAMESERVER_ID;

const BROADCAST_QUERY: &[u8] = b"GET_NSURI";
const BROADCAST_ATTEMPTS: u32 = 3;
const BROADCAST_TIMEOUT: Duration = Duration::from_millis(700);

pub struct Resolver {
    ns_host: String,
    ns_port: u16,
    ns_bcport: u16,
}

impl Resolver {
    pub fn new(config: &Config) -> Self {
        Resolver {
            ns_host: config.ns_host.clone(),
            ns_port: config.ns_port,
            ns_bcport: config.ns_bcport,
        }
    }

    /// `PYRO` returns as-is; `PYROLOC` resolves through the named
    /// daemon's reserved management object; `PYRONAME` resolves through
    /// a name server located via [`Self::locate_ns`].
    pub async fn resolve(&self, uri: &Uri) -> Result<Uri, PyroError> {
        match uri.protocol() {
            Protocol::Pyro => Ok(uri.clone()),
            Protocol::Pyroloc => {
                let location = uri.location().ok_or_else(|| PyroError::InvalidUri {
                    uri: uri.to_string(),
                    reason: "PYROLOC uri without a host:port location".to_string(),
                })?;
                let resolved = self
                    .call(
                        &location.host,
                        location.port,
                        RESERVED_DAEMON_ID,
                        "resolve",
                        Bytes::copy_from_slice(uri.object().as_bytes()),
                    )
                    .await?;
                parse_reply_uri(&resolved)
            }
            Protocol::Pyroname => {
                let (ns_host, ns_port) = {
                    let ns_uri = self.locate_ns(None, None).await?;
                    let location = ns_uri.location().expect("locate_ns always returns a located uri");
                    (location.host.clone(), location.port)
                };
                let resolved = self
                    .call(
                        &ns_host,
                        ns_port,
                        RESERVED_NAMESERVER_ID,
                        "lookup",
                        Bytes::copy_from_slice(uri.object().as_bytes()),
                    )
                    .await?;
                parse_reply_uri(&resolved)
            }
            // `Uri::parse` already rejects any protocol string outside
            // {PYRO, PYRONAME, PYROLOC}, so there is no fourth variant
            // to dispatch here.
        }
    }

    /// Locate the reachable name server's `PYRO` uri.
    ///
    /// With an explicit `host`, this constructs
    /// `PYROLOC:Pyro.NameServer@host:port` and resolves it through the
    /// same `PYROLOC` mechanism [`Self::resolve`] uses for any other
    /// object — no broadcast involved. Without one, broadcasts
    /// `"GET_NSURI"` up to three times before falling back to directly
    /// contacting the configured `(ns_host, ns_port)`.
    pub async fn locate_ns(&self, host: Option<&str>, port: Option<u16>) -> Result<Uri, PyroError> {
        if let Some(host) = host {
            let port = port.unwrap_or(self.ns_port);
            let proxy = Uri::pyroloc(RESERVED_NAMESERVER_ID, host.to_string(), port);
            return self.resolve(&proxy).await;
        }

        for attempt in 0..BROADCAST_ATTEMPTS {
            match self.try_broadcast_once().await {
                Ok(uri) => return Ok(uri),
                Err(err) => debug!(attempt, error = %err, "broadcast discovery attempt failed"),
            }
        }

        self.call(&self.ns_host, self.ns_port, RESERVED_NAMESERVER_ID, "ping", Bytes::new())
            .await
            .map_err(|_| PyroError::Communication(CommunicationError::Timeout))?;
        Ok(Uri::pyro(RESERVED_NAMESERVER_ID, self.ns_host.clone(), self.ns_port))
    }

    async fn try_broadcast_once(&self) -> Result<Uri, PyroError> {
        let socket = create_broadcast(Some("0.0.0.0:0".parse().unwrap()))
            .await
            .map_err(CommunicationError::from)?;
        let target: SocketAddr = format!("255.255.255.255:{}", self.ns_bcport)
            .parse()
            .expect("well-formed broadcast address");
        socket
            .send_to(BROADCAST_QUERY, target)
            .await
            .map_err(CommunicationError::from)?;

        let mut buf = [0u8; 256];
        let (n, _) = tokio::time::timeout(BROADCAST_TIMEOUT, socket.recv_from(&mut buf))
            .await
            .map_err(|_| CommunicationError::Timeout)?
            .map_err(CommunicationError::from)?;

        Uri::parse(std::str::from_utf8(&buf[..n]).map_err(|err| {
            CommunicationError::Protocol(format!("GET_NSURI reply is not valid UTF-8: {err}"))
        })?)
    }

    /// Dial `host:port`, issue one framed request against `object_id`,
    /// and return the reply payload (or a `PyroError::Remote` built from
    /// the reply's traceback on an error status).
    async fn call(
        &self,
        host: &str,
        port: u16,
        object_id: &str,
        method: &str,
        payload: Bytes,
    ) -> Result<Bytes, PyroError> {
        let addr = resolve_addr(host, port).await.map_err(|_| PyroError::InvalidUri {
            uri: format!("{host}:{port}"),
            reason: "not a resolvable host:port".to_string(),
        })?;

        let mut stream: TcpStream = connect_stream(addr).await.map_err(CommunicationError::from)?;
        let request = RequestFrame {
            seq: 0,
            oneway: false,
            object_id: object_id.to_string(),
            method: method.to_string(),
            payload,
        };
        frame::write_request(&mut stream, &request).await?;
        let reply: ReplyFrame = frame::read_reply(&mut stream).await?;
        match reply.status {
            ReplyStatus::Success | ReplyStatus::OnewayAck => Ok(reply.payload),
            ReplyStatus::Error => Err(PyroError::Remote {
                message: reply.traceback.clone().unwrap_or_default(),
                traceback: reply.traceback.unwrap_or_default(),
            }),
        }
    }
}

fn parse_reply_uri(payload: &Bytes) -> Result<Uri, PyroError> {
    let text = std::str::from_utf8(payload).map_err(|err| {
        PyroError::Communication(CommunicationError::Protocol(format!(
            "reply payload is not valid UTF-8: {err}"
        )))
    })?;
    Uri::parse(text)
}

pub(crate) async fn resolve_addr(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    if let Ok(addr) = format!("{host}:{port}").parse() {
        return Ok(addr);
    }
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses for host"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nameserver::NameServer;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn pyro_uris_resolve_to_themselves_synchronously() {
        let uri = Uri::pyro("echo", "127.0.0.1", 9999);
        assert_eq!(uri.protocol(), Protocol::Pyro);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn locate_ns_with_explicit_host_goes_through_pyroloc() {
        let config = Config {
            server_type: pyro_core::config::ServerType::Multiplex,
            poll_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let ns = NameServer::start(&config, Some("127.0.0.1"), Some(0), false, None, None)
            .await
            .unwrap();
        let addr = ns.daemon().local_addr();
        let expected = ns.ns_uri().clone();

        let ns = Arc::new(ns);
        let condition = pyro_transport::LoopCondition::new();
        let server_task = {
            let ns = Arc::clone(&ns);
            let condition = condition.clone();
            tokio::spawn(async move { ns.request_loop(condition, None).await })
        };

        let resolver = Resolver::new(&config);
        let located = resolver.locate_ns(Some("127.0.0.1"), Some(addr.port())).await.unwrap();
        assert_eq!(located, expected);

        condition.stop();
        let _ = tokio::time::timeout(Duration::from_millis(200), server_task).await;
    }
}
