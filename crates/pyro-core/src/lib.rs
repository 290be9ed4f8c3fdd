//! # pyro-core
//!
//! Shared primitives for the pyro workspace: the `PYRO`/`PYRONAME`/
//! `PYROLOC` URI scheme, the framed wire protocol, the error taxonomy,
//! explicit configuration, and socket helpers. Everything here is a leaf
//! dependency for `pyro-transport` and `pyro-switch` — it knows nothing
//! about connections, daemons, or the name registry.

pub mod config;
pub mod error;
pub mod frame;
pub mod sockutil;
pub mod uri;

pub use config::{Config, ServerType};
pub use error::{CommunicationError, DaemonError, NamingError, PyroError, Result};
pub use uri::{Location, Protocol, Uri};
