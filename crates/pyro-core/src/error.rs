//! Error taxonomy shared across the workspace.
//!
//! Mirrors the shape of `spark-core::error::CoreError`: a stable string
//! code in the `<domain>.<reason>` convention, a human-readable message,
//! and an optional boxed cause. Unlike `CoreError` this type is `std`-only
//! (no `no_std`/`alloc` split) since nothing in this workspace targets
//! embedded or `no_std` hosts.

use std::error::Error as StdError;
use std::fmt;
use std::io;

use thiserror::Error;

/// The root error type returned across crate boundaries in this workspace.
#[derive(Debug, Error)]
pub enum PyroError {
    /// Any network failure: closed connections, timeouts, bad frames.
    #[error(transparent)]
    Communication(#[from] CommunicationError),

    /// Name-server lookup/registration failure.
    #[error("{0}")]
    Naming(NamingError),

    /// Local misuse of a `Daemon` (duplicate object, reserved id, unknown object).
    #[error("{0}")]
    Daemon(DaemonError),

    /// A syntactically invalid URI string.
    #[error("invalid uri `{uri}`: {reason}")]
    InvalidUri { uri: String, reason: String },

    /// An error raised inside a remote handler, re-raised client-side with
    /// its original textual form preserved under the reserved attribute
    /// name `_pyroTraceback`.
    #[error("remote error: {message}")]
    Remote {
        message: String,
        /// Reserved attribute name per the wire protocol: `_pyroTraceback`.
        traceback: String,
    },
}

impl PyroError {
    /// Stable `<domain>.<reason>` code, following the convention
    /// `spark-core::CoreError::code()` uses for machine-readable dispatch.
    pub fn code(&self) -> &'static str {
        match self {
            PyroError::Communication(c) => c.code(),
            PyroError::Naming(n) => n.code(),
            PyroError::Daemon(d) => d.code(),
            PyroError::InvalidUri { .. } => "core.invalid_uri",
            PyroError::Remote { .. } => "daemon.remote_error",
        }
    }
}

/// `CommunicationError` — any network failure: closed connections,
/// timeouts, and malformed or out-of-version frames.
#[derive(Debug, Error)]
pub enum CommunicationError {
    /// Peer closed the connection, or the local socket died, mid-read.
    /// Carries the bytes successfully read before the failure so callers
    /// can log diagnostics.
    #[error("connection closed after {} partial bytes", partial.len())]
    ConnectionClosed { partial: Vec<u8> },

    /// A wire-level timeout expired.
    #[error("operation timed out")]
    Timeout,

    /// A malformed frame or a protocol version mismatch.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Any other I/O failure not covered by the above.
    #[error("communication failure: {0}")]
    Io(#[source] io::Error),
}

impl CommunicationError {
    pub fn code(&self) -> &'static str {
        match self {
            CommunicationError::ConnectionClosed { .. } => "comm.connection_closed",
            CommunicationError::Timeout => "comm.timeout",
            CommunicationError::Protocol(_) => "comm.protocol_error",
            CommunicationError::Io(_) => "comm.io_error",
        }
    }

    /// Bytes read so far, for callers that want to inspect a partial read
    /// without matching on the enum shape.
    pub fn partial_data(&self) -> Option<&[u8]> {
        match self {
            CommunicationError::ConnectionClosed { partial } => Some(partial),
            _ => None,
        }
    }
}

impl From<io::Error> for CommunicationError {
    fn from(err: io::Error) -> Self {
        CommunicationError::Io(err)
    }
}

impl From<io::Error> for PyroError {
    fn from(err: io::Error) -> Self {
        PyroError::Communication(CommunicationError::Io(err))
    }
}

/// `NamingError` — name-server lookup/registration failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamingError {
    NameAlreadyRegistered { name: String },
    UnknownName { name: String },
    InvalidRegex { pattern: String, reason: String },
}

impl NamingError {
    pub fn code(&self) -> &'static str {
        match self {
            NamingError::NameAlreadyRegistered { .. } => "naming.already_registered",
            NamingError::UnknownName { .. } => "naming.unknown_name",
            NamingError::InvalidRegex { .. } => "naming.invalid_regex",
        }
    }
}

impl fmt::Display for NamingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NamingError::NameAlreadyRegistered { name } => {
                write!(f, "name already registered: {name}")
            }
            NamingError::UnknownName { name } => write!(f, "unknown name: {name}"),
            NamingError::InvalidRegex { pattern, reason } => {
                write!(f, "invalid regex `{pattern}`: {reason}")
            }
        }
    }
}

impl StdError for NamingError {}

/// `DaemonError` — local misuse of a daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonError {
    ReservedObjectId { id: String },
    DuplicateObject,
    IdAlreadyUsed { id: String },
    UnknownObject { id: String },
    UnknownMethod { method: String },
    AlreadyClosed,
    DottedNamesUnsupported,
}

impl DaemonError {
    pub fn code(&self) -> &'static str {
        match self {
            DaemonError::ReservedObjectId { .. } => "daemon.reserved_id",
            DaemonError::DuplicateObject => "daemon.duplicate_object",
            DaemonError::IdAlreadyUsed { .. } => "daemon.id_already_used",
            DaemonError::UnknownObject { .. } => "daemon.unknown_object",
            DaemonError::UnknownMethod { .. } => "daemon.unknown_method",
            DaemonError::AlreadyClosed => "daemon.already_closed",
            DaemonError::DottedNamesUnsupported => "daemon.dotted_names_unsupported",
        }
    }
}

impl fmt::Display for DaemonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DaemonError::ReservedObjectId { id } => {
                write!(f, "object id `{id}` is reserved for the daemon itself")
            }
            DaemonError::DuplicateObject => {
                write!(f, "this handler is already registered under another id")
            }
            DaemonError::IdAlreadyUsed { id } => write!(f, "object id `{id}` is already in use"),
            DaemonError::UnknownObject { id } => write!(f, "no object registered as `{id}`"),
            DaemonError::UnknownMethod { method } => write!(f, "no such method `{method}`"),
            DaemonError::AlreadyClosed => write!(f, "daemon has already been closed"),
            DaemonError::DottedNamesUnsupported => write!(
                f,
                "dotted-names attribute traversal is not supported; Config::dotted_names must be false"
            ),
        }
    }
}

impl StdError for DaemonError {}

impl From<NamingError> for PyroError {
    fn from(err: NamingError) -> Self {
        PyroError::Naming(err)
    }
}

impl From<DaemonError> for PyroError {
    fn from(err: DaemonError) -> Self {
        PyroError::Daemon(err)
    }
}

pub type Result<T, E = PyroError> = std::result::Result<T, E>;
