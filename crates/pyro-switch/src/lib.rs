//! Name-service and dispatch layer: the object table a daemon serves
//! requests against, the registry a name server exposes, and the
//! resolver/broadcast machinery that turns a `pyroname:`/`pyroloc:` uri
//! into a concrete `pyro:` one.

pub mod broadcast;
pub mod daemon;
pub mod nameserver;
pub mod registry;
pub mod resolver;

pub use broadcast::BroadcastResponder;
pub use daemon::{Daemon, PyroObject, RESERVED_DAEMON_ID};
pub use nameserver::{NameServer, RESERVED_NAMESERVER_ID};
pub use registry::Registry;
pub use resolver::Resolver;
