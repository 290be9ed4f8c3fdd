//! `Daemon` — owns a `TransportServer`, maps object ids to handler
//! objects, and decodes/dispatches framed requests against that table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error};

use pyro_core::config::{Config, ServerType};
use pyro_core::error::{DaemonError, PyroError};
use pyro_core::frame::{self, ReplyFrame, RequestFrame};
use pyro_core::uri::Uri;
use pyro_transport::multiplex::MultiplexServer;
use pyro_transport::threadpool::ThreadPoolServer;
use pyro_transport::{AuxiliarySocket, Connection, LoopCondition, RequestHandler, TransportServer, WorkerPool};

/// Every daemon reserves this id for its own management object.
pub const RESERVED_DAEMON_ID: &str = "Pyro.Daemon";

/// A remote object exposed through a `Daemon`'s object table. Object
/// serialization of the argument/result payload is intentionally out of
/// scope: callers and implementors agree their own encoding for
/// `payload` and the returned bytes.
#[async_trait]
pub trait PyroObject: Send + Sync {
    async fn invoke(&self, method: &str, payload: Bytes) -> Result<Bytes, PyroError>;
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Shared daemon state: the object table, id allocation, and the
/// decode/dispatch/encode logic `handle_request` runs. Split out from
/// `Daemon` so the built-in management object can hold a `Weak` back to
/// it without an `Arc` cycle, and so `DaemonHandler` can implement
/// `RequestHandler` without the daemon needing to construct a
/// `TransportServer` and a handler pointing at itself simultaneously.
struct DaemonCore {
    location: (String, u16),
    objects: Mutex<HashMap<String, Arc<dyn PyroObject>>>,
    next_seq: AtomicU64,
    epoch_nanos: u64,
    closed: AtomicBool,
}

impl DaemonCore {
    fn new(location: (String, u16)) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<DaemonCore>| {
            let mut objects: HashMap<String, Arc<dyn PyroObject>> = HashMap::new();
            objects.insert(
                RESERVED_DAEMON_ID.to_string(),
                Arc::new(DaemonObject { core: weak.clone() }) as Arc<dyn PyroObject>,
            );
            DaemonCore {
                location,
                objects: Mutex::new(objects),
                next_seq: AtomicU64::new(0),
                epoch_nanos: now_nanos(),
                closed: AtomicBool::new(false),
            }
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn allocate_id(&self) -> String {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        format!("obj-{:x}-{:x}", self.epoch_nanos, seq)
    }

    fn register(
        &self,
        obj: Arc<dyn PyroObject>,
        object_id: Option<String>,
    ) -> Result<String, DaemonError> {
        if let Some(id) = &object_id {
            if id == RESERVED_DAEMON_ID {
                return Err(DaemonError::ReservedObjectId { id: id.clone() });
            }
        }

        let mut objects = self.objects.lock().expect("daemon lock poisoned");
        if objects
            .values()
            .any(|existing| Arc::ptr_eq(existing, &obj))
        {
            return Err(DaemonError::DuplicateObject);
        }

        let id = match object_id {
            Some(id) => {
                if objects.contains_key(&id) {
                    return Err(DaemonError::IdAlreadyUsed { id });
                }
                id
            }
            None => self.allocate_id(),
        };

        objects.insert(id.clone(), obj);
        Ok(id)
    }

    fn unregister(&self, object_id: &str) {
        self.objects.lock().expect("daemon lock poisoned").remove(object_id);
    }

    fn unregister_object(&self, obj: &Arc<dyn PyroObject>) {
        let mut objects = self.objects.lock().expect("daemon lock poisoned");
        let id = objects
            .iter()
            .find(|(_, existing)| Arc::ptr_eq(existing, obj))
            .map(|(id, _)| id.clone());
        if let Some(id) = id {
            objects.remove(&id);
        }
    }

    /// Always succeeds: an id that isn't registered locally is still a
    /// valid id to build a `PYRO` URI for an object hosted elsewhere.
    fn uri_for_id(&self, object_id: &str) -> Uri {
        Uri::pyro(object_id, self.location.0.clone(), self.location.1)
    }

    fn uri_for_object(&self, obj: &Arc<dyn PyroObject>) -> Result<Uri, DaemonError> {
        let objects = self.objects.lock().expect("daemon lock poisoned");
        objects
            .iter()
            .find(|(_, existing)| Arc::ptr_eq(existing, obj))
            .map(|(id, _)| self.uri_for_id(id))
            .ok_or(DaemonError::UnknownObject {
                id: "<unregistered object>".to_string(),
            })
    }

    fn registered_ids(&self) -> Vec<String> {
        self.objects
            .lock()
            .expect("daemon lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    fn lookup(&self, object_id: &str) -> Option<Arc<dyn PyroObject>> {
        self.objects.lock().expect("daemon lock poisoned").get(object_id).cloned()
    }

    async fn dispatch(&self, request: RequestFrame) -> ReplyFrame {
        if self.is_closed() {
            return ReplyFrame::error(
                request.seq,
                DaemonError::AlreadyClosed.to_string(),
                Bytes::new(),
            );
        }

        let Some(object) = self.lookup(&request.object_id) else {
            let err = DaemonError::UnknownObject { id: request.object_id.clone() };
            return ReplyFrame::error(request.seq, err.to_string(), Bytes::new());
        };

        let outcome = object.invoke(&request.method, request.payload).await;
        if request.oneway {
            return ReplyFrame::oneway_ack(request.seq);
        }
        match outcome {
            Ok(payload) => ReplyFrame::success(request.seq, payload),
            Err(err) => {
                error!(
                    object_id = %request.object_id,
                    method = %request.method,
                    error = %err,
                    "remote handler error"
                );
                ReplyFrame::error(request.seq, err.to_string(), Bytes::new())
            }
        }
    }
}

/// The built-in object every daemon exposes under `Pyro.Daemon`:
/// `ping`, `registered`, and `resolve`.
struct DaemonObject {
    core: Weak<DaemonCore>,
}

#[async_trait]
impl PyroObject for DaemonObject {
    async fn invoke(&self, method: &str, payload: Bytes) -> Result<Bytes, PyroError> {
        let core = self
            .core
            .upgrade()
            .ok_or_else(|| PyroError::from(DaemonError::AlreadyClosed))?;

        match method {
            "ping" => Ok(Bytes::new()),
            "registered" => Ok(Bytes::from(core.registered_ids().join("\n"))),
            "resolve" => {
                let object_id = String::from_utf8(payload.to_vec()).map_err(|err| {
                    PyroError::Remote {
                        message: format!("resolve: object id is not valid UTF-8: {err}"),
                        traceback: String::new(),
                    }
                })?;
                Ok(Bytes::from(core.uri_for_id(&object_id).to_string()))
            }
            other => Err(PyroError::from(DaemonError::UnknownMethod { method: other.to_string() })),
        }
    }
}

/// Forwards the two calls a `TransportServer` drives into
/// `DaemonCore::dispatch`. Kept separate from `Daemon` so construction
/// order is: build the core, build the handler over it, build the
/// transport over the handler, then assemble `Daemon` — no cyclic `Arc`
/// needed.
struct DaemonHandler {
    core: Arc<DaemonCore>,
}

#[async_trait]
impl RequestHandler for DaemonHandler {
    async fn handshake(&self, _conn: &Connection, _stream: &mut TcpStream) -> Result<bool, PyroError> {
        Ok(true)
    }

    async fn handle_request(
        &self,
        conn: &Connection,
        stream: &mut TcpStream,
    ) -> Result<(), PyroError> {
        let request = frame::read_request(stream).await?;
        conn.set_object_id(request.object_id.clone());
        let reply = self.core.dispatch(request).await;
        frame::write_reply(stream, &reply).await?;
        Ok(())
    }
}

/// Owns one `TransportServer` realization and the object table it
/// dispatches into.
pub struct Daemon {
    core: Arc<DaemonCore>,
    transport: Arc<dyn TransportServer>,
    pool: Option<WorkerPool>,
}

impl Daemon {
    /// Bind `listener` and construct the `TransportServer` variant named
    /// by `config.server_type`.
    pub async fn new(config: &Config, listener: TcpListener) -> Result<Self, PyroError> {
        let local_addr = listener.local_addr()?;
        let location = (local_addr.ip().to_string(), local_addr.port());
        let core = DaemonCore::new(location);
        let handler: Arc<dyn RequestHandler> = Arc::new(DaemonHandler { core: Arc::clone(&core) });

        let (transport, pool): (Arc<dyn TransportServer>, Option<WorkerPool>) = match config.server_type {
            ServerType::Multiplex => {
                let server = MultiplexServer::new(listener, handler, config.poll_timeout)?;
                (Arc::new(server), None)
            }
            ServerType::ThreadPool => {
                let pool = WorkerPool::new(
                    config.threadpool_min_threads,
                    config.threadpool_max_threads,
                    config.threadpool_idle_timeout,
                );
                let server = ThreadPoolServer::new(listener, handler, pool.clone(), config.poll_timeout)?;
                (Arc::new(server), Some(pool))
            }
        };

        Ok(Daemon { core, transport, pool })
    }

    /// The pool backing a `ThreadPool` daemon, if that's the variant in
    /// use.
    pub fn worker_pool(&self) -> Option<&WorkerPool> {
        self.pool.as_ref()
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.transport.local_addr()
    }

    pub fn location_str(&self) -> String {
        self.transport.location_str()
    }

    /// Rejects the reserved id, duplicate object registration, and
    /// already-used explicit ids; otherwise indexes both directions and
    /// returns the final (possibly allocated) id.
    pub fn register(
        &self,
        obj: Arc<dyn PyroObject>,
        object_id: Option<String>,
    ) -> Result<String, PyroError> {
        Ok(self.core.register(obj, object_id)?)
    }

    /// Missing id is a no-op.
    pub fn unregister(&self, object_id: &str) {
        self.core.unregister(object_id);
    }

    pub fn unregister_object(&self, obj: &Arc<dyn PyroObject>) {
        self.core.unregister_object(obj);
    }

    /// Always succeeds, even for an id this daemon has never registered
    /// (used to build URIs that name objects hosted elsewhere).
    pub fn uri_for_id(&self, object_id: &str) -> Uri {
        self.core.uri_for_id(object_id)
    }

    pub fn uri_for_object(&self, obj: &Arc<dyn PyroObject>) -> Result<Uri, PyroError> {
        Ok(self.core.uri_for_object(obj)?)
    }

    pub async fn request_loop(
        &self,
        condition: LoopCondition,
        others: Option<AuxiliarySocket>,
    ) -> Result<(), PyroError> {
        if self.core.is_closed() {
            return Err(DaemonError::AlreadyClosed.into());
        }
        self.transport.request_loop(condition, others).await
    }

    /// Closes the transport and marks the daemon unusable; a daemon may
    /// be closed only once.
    pub async fn close(&self) -> Result<(), PyroError> {
        if self.core.closed.swap(true, Ordering::AcqRel) {
            return Err(DaemonError::AlreadyClosed.into());
        }
        self.transport.close().await;
        if let Some(pool) = &self.pool {
            pool.close();
        }
        debug!(location = %self.location_str(), "daemon closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pyro_core::sockutil::bind_stream;
    use pyro_core::uri::Protocol;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tracing_test::logs_contain;

    struct EchoObject;

    #[async_trait]
    impl PyroObject for EchoObject {
        async fn invoke(&self, method: &str, payload: Bytes) -> Result<Bytes, PyroError> {
            match method {
                "echo" => Ok(payload),
                other => Err(PyroError::from(DaemonError::UnknownMethod { method: other.to_string() })),
            }
        }
    }

    fn test_config() -> Config {
        Config {
            server_type: ServerType::Multiplex,
            poll_timeout: Duration::from_millis(50),
            ..Default::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn reserved_id_ping_roundtrips() {
        let listener = bind_stream("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let daemon = Arc::new(Daemon::new(&test_config(), listener).await.unwrap());
        let addr = daemon.local_addr();

        let condition = LoopCondition::new();
        let server_task = {
            let daemon = Arc::clone(&daemon);
            let condition = condition.clone();
            tokio::spawn(async move { daemon.request_loop(condition, None).await })
        };

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = RequestFrame {
            seq: 1,
            oneway: false,
            object_id: RESERVED_DAEMON_ID.to_string(),
            method: "ping".to_string(),
            payload: Bytes::new(),
        };
        frame::write_request(&mut stream, &request).await.unwrap();
        let reply = frame::read_reply(&mut stream).await.unwrap();
        assert_eq!(reply.status, pyro_core::frame::ReplyStatus::Success);

        condition.stop();
        drop(stream);
        let _ = tokio::time::timeout(Duration::from_millis(200), server_task).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn register_and_invoke_custom_object() {
        let listener = bind_stream("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let daemon = Arc::new(Daemon::new(&test_config(), listener).await.unwrap());
        let addr = daemon.local_addr();
        let object_id = daemon.register(Arc::new(EchoObject), None).unwrap();

        let condition = LoopCondition::new();
        let server_task = {
            let daemon = Arc::clone(&daemon);
            let condition = condition.clone();
            tokio::spawn(async move { daemon.request_loop(condition, None).await })
        };

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = RequestFrame {
            seq: 7,
            oneway: false,
            object_id,
            method: "echo".to_string(),
            payload: Bytes::from_static(b"hello"),
        };
        frame::write_request(&mut stream, &request).await.unwrap();
        let reply = frame::read_reply(&mut stream).await.unwrap();
        assert_eq!(reply.payload, Bytes::from_static(b"hello"));

        condition.stop();
        drop(stream);
        let _ = tokio::time::timeout(Duration::from_millis(200), server_task).await;
    }

    #[tracing_test::traced_test]
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn remote_handler_error_is_logged_at_error_level() {
        let listener = bind_stream("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let daemon = Arc::new(Daemon::new(&test_config(), listener).await.unwrap());
        let addr = daemon.local_addr();
        let object_id = daemon.register(Arc::new(EchoObject), None).unwrap();

        let condition = LoopCondition::new();
        let server_task = {
            let daemon = Arc::clone(&daemon);
            let condition = condition.clone();
            tokio::spawn(async move { daemon.request_loop(condition, None).await })
        };

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = RequestFrame {
            seq: 9,
            oneway: false,
            object_id,
            method: "no-such-method".to_string(),
            payload: Bytes::new(),
        };
        frame::write_request(&mut stream, &request).await.unwrap();
        let reply = frame::read_reply(&mut stream).await.unwrap();
        assert_eq!(reply.status, pyro_core::frame::ReplyStatus::Error);
        assert!(logs_contain("remote handler error"));

        condition.stop();
        drop(stream);
        let _ = tokio::time::timeout(Duration::from_millis(200), server_task).await;
    }

    #[test]
    fn registering_under_reserved_id_fails() {
        let core = DaemonCore::new(("127.0.0.1".to_string(), 9999));
        let err = core
            .register(Arc::new(EchoObject), Some(RESERVED_DAEMON_ID.to_string()))
            .unwrap_err();
        assert!(matches!(err, DaemonError::ReservedObjectId { .. }));
    }

    #[test]
    fn registering_same_object_twice_fails() {
        let core = DaemonCore::new(("127.0.0.1".to_string(), 9999));
        let obj: Arc<dyn PyroObject> = Arc::new(EchoObject);
        core.register(Arc::clone(&obj), None).unwrap();
        let err = core.register(obj, None).unwrap_err();
        assert!(matches!(err, DaemonError::DuplicateObject));
    }

    #[test]
    fn uri_for_unregistered_id_still_succeeds() {
        let core = DaemonCore::new(("127.0.0.1".to_string(), 9999));
        let uri = core.uri_for_id("never.registered");
        assert_eq!(uri.protocol(), Protocol::Pyro);
        assert_eq!(uri.object(), "never.registered");
    }
}
