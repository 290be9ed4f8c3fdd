//! `NameServer` — a `Registry` exposed through a `Daemon` under the
//! reserved id `Pyro.NameServer`, plus the optional `BroadcastResponder`
//! that answers discovery queries for it.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::TcpListener;
use tracing::debug;

use pyro_core::config::Config;
use pyro_core::error::{CommunicationError, DaemonError, PyroError};
use pyro_core::sockutil::bind_stream;
use pyro_core::uri::Uri;

use crate::broadcast::BroadcastResponder;
use crate::daemon::{Daemon, PyroObject};
use crate::registry::Registry;
use crate::resolver::resolve_addr;

/// Every name server reserves this id for the registry it exposes.
pub const RESERVED_NAMESERVER_ID: &str = "Pyro.NameServer";

/// `Registry` as a `PyroObject`: `ping`/`register`/`lookup`/`remove`/`list`
/// over a small text wire encoding, since the registry itself only ever
/// carries names and `Uri` strings.
struct NameServerObject {
    registry: Arc<Registry>,
}

fn decode_utf8(payload: &Bytes) -> Result<String, PyroError> {
    std::str::from_utf8(payload)
        .map(str::to_string)
        .map_err(|err| PyroError::Communication(CommunicationError::Protocol(format!("payload is not valid UTF-8: {err}"))))
}

fn protocol_err(message: impl Into<String>) -> PyroError {
    PyroError::Communication(CommunicationError::Protocol(message.into()))
}

/// Parses a `list` call's filter payload: empty means no filter, and
/// otherwise the payload is `"prefix:<value>"` or `"regex:<value>"`.
fn parse_list_filter(text: &str) -> Result<(Option<String>, Option<String>), PyroError> {
    if text.is_empty() {
        return Ok((None, None));
    }
    if let Some(prefix) = text.strip_prefix("prefix:") {
        return Ok((Some(prefix.to_string()), None));
    }
    if let Some(pattern) = text.strip_prefix("regex:") {
        return Ok((None, Some(pattern.to_string())));
    }
    Err(protocol_err("list payload must be empty, \"prefix:<value>\", or \"regex:<value>\""))
}

#[async_trait]
impl PyroObject for NameServerObject {
    async fn invoke(&self, method: &str, payload: Bytes) -> Result<Bytes, PyroError> {
        match method {
            "ping" => {
                self.registry.ping();
                Ok(Bytes::new())
            }
            "register" => {
                let text = decode_utf8(&payload)?;
                let (name, uri_str) = text
                    .split_once('\n')
                    .ok_or_else(|| protocol_err("register payload must be \"name\\nuri\""))?;
                let uri = Uri::parse(uri_str)?;
                self.registry.register(name.to_string(), uri)?;
                Ok(Bytes::new())
            }
            "lookup" => {
                let name = decode_utf8(&payload)?;
                let uri = self.registry.lookup(&name)?;
                Ok(Bytes::from(uri.to_string()))
            }
            "remove" => {
                let name = decode_utf8(&payload)?;
                self.registry.remove(&name);
                Ok(Bytes::new())
            }
            "list" => {
                let text = decode_utf8(&payload)?;
                let (prefix, regex) = parse_list_filter(&text)?;
                let entries = self.registry.list(prefix.as_deref(), regex.as_deref())?;
                let body = entries
                    .into_iter()
                    .map(|(name, uri)| format!("{name}={uri}"))
                    .collect::<Vec<_>>()
                    .join("\n");
                Ok(Bytes::from(body))
            }
            other => Err(PyroError::from(DaemonError::UnknownMethod { method: other.to_string() })),
        }
    }
}

/// The running name service: its `Registry`, the `Daemon` exposing that
/// registry under [`RESERVED_NAMESERVER_ID`], and (usually) the
/// broadcast responder that lets clients find it without knowing its
/// host ahead of time.
pub struct NameServer {
    registry: Arc<Registry>,
    daemon: Arc<Daemon>,
    ns_uri: Uri,
    broadcast: Option<Arc<BroadcastResponder>>,
}

impl NameServer {
    /// Bind and start a name server. `host`/`port` default to
    /// `config.ns_host`/`config.ns_port`; `bchost`/`bcport` default to
    /// `config.ns_bchost`/`config.ns_bcport`. The broadcast responder is
    /// started unless `enable_broadcast` is false or the bound host
    /// resolves to loopback (broadcasting on loopback reaches no one).
    ///
    /// Fails immediately if `config.dotted_names` is set: this workspace
    /// has no attribute-traversal dispatch to gate behind that flag.
    pub async fn start(
        config: &Config,
        host: Option<&str>,
        port: Option<u16>,
        enable_broadcast: bool,
        bchost: Option<&str>,
        bcport: Option<u16>,
    ) -> Result<Self, PyroError> {
        if config.dotted_names {
            return Err(DaemonError::DottedNamesUnsupported.into());
        }

        let host = host.unwrap_or(&config.ns_host);
        let port = port.unwrap_or(config.ns_port);
        let bind_addr = resolve_addr(host, port).await.map_err(|_| PyroError::InvalidUri {
            uri: format!("{host}:{port}"),
            reason: "not a resolvable host:port".to_string(),
        })?;

        let listener: TcpListener = bind_stream(bind_addr).await.map_err(CommunicationError::from)?;
        let daemon = Arc::new(Daemon::new(config, listener).await?);

        let registry = Arc::new(Registry::new());
        daemon.register(
            Arc::new(NameServerObject { registry: Arc::clone(&registry) }),
            Some(RESERVED_NAMESERVER_ID.to_string()),
        )?;
        let ns_uri = daemon.uri_for_id(RESERVED_NAMESERVER_ID);

        let broadcast = if enable_broadcast && !bind_addr.ip().is_loopback() {
            let bchost = bchost.unwrap_or(&config.ns_bchost);
            let bcport = bcport.unwrap_or(config.ns_bcport);
            let bc_addr = if bchost.is_empty() {
                format!("0.0.0.0:{bcport}").parse().expect("well-formed broadcast bind address")
            } else {
                resolve_addr(bchost, bcport).await.map_err(CommunicationError::from)?
            };
            let responder = Arc::new(BroadcastResponder::bind(bc_addr, ns_uri.clone()).await.map_err(CommunicationError::from)?);
            let task_responder = Arc::clone(&responder);
            tokio::spawn(async move { task_responder.run().await });
            debug!(uri = %ns_uri, addr = %responder.local_addr(), "broadcast responder listening");
            Some(responder)
        } else {
            debug!(uri = %ns_uri, loopback = bind_addr.ip().is_loopback(), "broadcast responder suppressed");
            None
        };

        Ok(NameServer { registry, daemon, ns_uri, broadcast })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn daemon(&self) -> &Arc<Daemon> {
        &self.daemon
    }

    pub fn ns_uri(&self) -> &Uri {
        &self.ns_uri
    }

    pub fn broadcast(&self) -> Option<&Arc<BroadcastResponder>> {
        self.broadcast.as_ref()
    }

    pub async fn request_loop(
        &self,
        condition: pyro_transport::LoopCondition,
        others: Option<pyro_transport::AuxiliarySocket>,
    ) -> Result<(), PyroError> {
        self.daemon.request_loop(condition, others).await
    }

    pub async fn close(&self) -> Result<(), PyroError> {
        if let Some(responder) = &self.broadcast {
            responder.shutdown().await;
        }
        self.daemon.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use pyro_core::config::ServerType;
    use pyro_core::frame::{self, ReplyStatus, RequestFrame};
    use std::time::Duration;
    use tokio::net::TcpStream;

    fn test_config() -> Config {
        Config {
            server_type: ServerType::Multiplex,
            poll_timeout: Duration::from_millis(50),
            ..Default::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn loopback_start_suppresses_broadcast_and_serves_register_lookup() {
        let ns = NameServer::start(&test_config(), Some("127.0.0.1"), Some(0), true, None, None)
            .await
            .unwrap();
        assert!(ns.broadcast().is_none(), "loopback bind must suppress the broadcast responder");

        let addr = ns.daemon().local_addr();
        let condition = pyro_transport::LoopCondition::new();
        let ns_arc = Arc::new(ns);
        let server_task = {
            let ns_arc = Arc::clone(&ns_arc);
            let condition = condition.clone();
            tokio::spawn(async move { ns_arc.request_loop(condition, None).await })
        };

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let target = Uri::pyro("echo", "127.0.0.1", 4242);
        let register_payload = format!("echo.server\n{target}");
        let request = RequestFrame {
            seq: 1,
            oneway: false,
            object_id: RESERVED_NAMESERVER_ID.to_string(),
            method: "register".to_string(),
            payload: Bytes::from(register_payload),
        };
        frame::write_request(&mut stream, &request).await.unwrap();
        let reply = frame::read_reply(&mut stream).await.unwrap();
        assert_eq!(reply.status, ReplyStatus::Success);

        let request = RequestFrame {
            seq: 2,
            oneway: false,
            object_id: RESERVED_NAMESERVER_ID.to_string(),
            method: "lookup".to_string(),
            payload: Bytes::from_static(b"echo.server"),
        };
        frame::write_request(&mut stream, &request).await.unwrap();
        let reply = frame::read_reply(&mut stream).await.unwrap();
        assert_eq!(reply.status, ReplyStatus::Success);
        assert_eq!(reply.payload, Bytes::from(target.to_string()));

        condition.stop();
        drop(stream);
        let _ = tokio::time::timeout(Duration::from_millis(200), server_task).await;
    }

    #[tokio::test]
    async fn dotted_names_config_is_rejected() {
        let config = Config { dotted_names: true, ..test_config() };
        let err = NameServer::start(&config, Some("127.0.0.1"), Some(0), false, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, PyroError::Daemon(DaemonError::DottedNamesUnsupported)));
    }
}
