//! Sockets, the readiness reactor, and server assembly

pub mod conn;
pub mod reactor;
pub mod server;

pub use conn::{ConnState, Connection, ConnectionFactory, DefaultConnectionFactory};
pub use reactor::{Reactor, Readiness};
pub use server::{Server, ServerStats};
