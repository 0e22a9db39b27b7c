//! Connections to individual server nodes.

mod connection;
#[cfg(feature = "tls")]
mod tls;

pub use connection::{Connection, ConnectionId};
