//! Explicit configuration value, threaded through constructors instead of
//! read from process-global state.

use std::time::Duration;

/// Which `TransportServer` realization a `Daemon` picks at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerType {
    ThreadPool,
    Multiplex,
}

/// The full Config surface recognized by this workspace.
#[derive(Debug, Clone)]
pub struct Config {
    /// Default bind host for daemons.
    pub host: String,
    /// Name-server host.
    pub ns_host: String,
    /// Name-server port. `0` asks the OS to pick an ephemeral port.
    pub ns_port: u16,
    /// Broadcast responder bind host.
    pub ns_bchost: String,
    /// Broadcast responder bind port.
    pub ns_bcport: u16,
    /// Which transport server variant a daemon constructs.
    pub server_type: ServerType,
    /// Poll/select tick for `requestLoop`'s `loopCondition` observation.
    pub poll_timeout: Duration,
    /// Per-connection idle timeout. `None` means "no timeout", unifying
    /// `COMMTIMEOUT=0` and unset.
    pub comm_timeout: Option<Duration>,
    pub threadpool_min_threads: usize,
    pub threadpool_max_threads: usize,
    pub threadpool_idle_timeout: Duration,
    /// If true, name-server startup refuses to run attribute-traversal
    /// RPCs; `NameServer::start` rejects construction when this is set,
    /// since this workspace has no dotted-names dispatch to disable in
    /// the first place.
    pub dotted_names: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "localhost".to_string(),
            ns_host: "localhost".to_string(),
            ns_port: 9090,
            ns_bchost: "".to_string(),
            ns_bcport: 9091,
            server_type: ServerType::ThreadPool,
            poll_timeout: Duration::from_secs(2),
            comm_timeout: None,
            threadpool_min_threads: 4,
            threadpool_max_threads: 40,
            threadpool_idle_timeout: Duration::from_secs(2),
            dotted_names: false,
        }
    }
}
