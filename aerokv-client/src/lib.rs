//! An async client for Aerospike-style key-value clusters.
//!
//! The client discovers cluster members from seed hosts, maintains a
//! partition map and per-node connection pools in a background tend
//! task, and routes record commands to the owning node with policy-
//! driven retries. Wire encoding lives in the `aerokv-core` crate.
//!
//! ```no_run
//! use aerokv_client::{Client, ClientConfig, Host, WritePolicy};
//! use aerokv_core::Key;
//!
//! # async fn example() -> aerokv_core::Result<()> {
//! let config = ClientConfig::builder()
//!     .add_seed(Host::new("127.0.0.1", 3000))
//!     .build()?;
//! let client = Client::connect(config).await?;
//!
//! let key = Key::new("test", "demo", "user-1")?;
//! client.put(&WritePolicy::new(), &key, [("visits", 1i64)]).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

mod client;

pub mod cluster;
pub mod commands;
pub mod config;
pub mod net;
pub mod policy;

pub use client::{Client, IndexType};
pub use cluster::{Cluster, ClusterObserver, ClusterView, Node};
pub use commands::batch::{BatchRead, BatchResult, BatchWrite, Bins};
pub use commands::scan::{IndexFilter, RecordStream, Task, TaskKind, TaskStatus};
pub use config::{
    AuthConfig, ClientConfig, ClientConfigBuilder, ConfigError, Host, NetworkConfig, TlsConfig,
};
pub use policy::{
    BasePolicy, BatchPolicy, CommitLevel, Expiration, GenerationPolicy, InfoPolicy, QueryPolicy,
    ReadModeAp, ReadPolicy, RecordExistsAction, Replica, ScanPolicy, WritePolicy,
};

pub use aerokv_core::{AerokvError, Key, Record, Result, ResultCode, UserKey, Value};
