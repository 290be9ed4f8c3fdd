//! Connection handling, the elastic worker pool, and the two
//! `TransportServer` realizations driven by `pyro_switch::Daemon`.

pub mod connection;
pub mod handler;
pub mod multiplex;
pub mod pool;
pub mod server;
pub mod threadpool;

pub use connection::Connection;
pub use handler::{RequestHandler, is_connection_fatal};
pub use multiplex::MultiplexServer;
pub use pool::{Job, PoolError, WorkerPool};
pub use server::{AuxiliarySocket, LoopCondition, TransportServer};
pub use threadpool::ThreadPoolServer;
