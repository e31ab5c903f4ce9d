//! # Halley - a staged event-driven HTTP server framework
//!
//! Connections move through a chain of processing stages: a reader parses
//! requests off the socket, a handler stage runs the per-request module
//! chain, and a writer reassembles indexed body parts onto the socket in
//! order. Each stage owns a bounded priority queue and a pool of worker
//! threads; stages communicate exclusively by posting events carrying
//! shared-ownership job references. Blocking file and database work is
//! delegated to helper stages and resumes through continuation tokens.
//!
//! ```no_run
//! use halley::{Server, ServerConfig};
//!
//! fn main() -> halley::Result<()> {
//!     let server = Server::new(ServerConfig::default())?;
//!     server.start();
//!     // ... serve until asked to stop ...
//!     server.stop();
//!     Ok(())
//! }
//! ```

pub mod access_log;
pub mod config;
pub mod domain_types;
pub mod eds;
pub mod error;
pub mod http;
pub mod modules;
pub mod net;

pub use config::ServerConfig;
pub use error::{HalleyError, Result};
pub use net::server::Server;
