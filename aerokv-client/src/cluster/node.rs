//! A cluster node and its bounded connection pool.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use aerokv_core::{AerokvError, Result};
use tokio::sync::Notify;

use crate::commands::admin::{self, Session};
use crate::config::{AuthConfig, Host, NetworkConfig};
use crate::net::Connection;

/// Consecutive tend failures after which a node is dropped.
pub const MAX_TEND_FAILURES: u32 = 5;

#[derive(Debug)]
struct Pool {
    idle: VecDeque<Connection>,
    /// Idle plus checked-out connections.
    total: usize,
}

/// One server node: identity, health counters and the connection pool.
#[derive(Debug)]
pub struct Node {
    name: String,
    host: Host,
    network: NetworkConfig,
    auth: Option<AuthConfig>,
    session: RwLock<Option<Session>>,
    pool: Mutex<Pool>,
    /// Signalled whenever a pool slot frees up.
    slot_freed: Notify,
    failures: AtomicU32,
    /// Rack id per namespace, refreshed by the tend loop.
    racks: RwLock<HashMap<String, u32>>,
}

impl Node {
    /// Creates a node with an empty pool.
    pub fn new(
        name: impl Into<String>,
        host: Host,
        network: NetworkConfig,
        auth: Option<AuthConfig>,
    ) -> Self {
        Self {
            name: name.into(),
            host,
            network,
            auth,
            session: RwLock::new(None),
            pool: Mutex::new(Pool {
                idle: VecDeque::new(),
                total: 0,
            }),
            slot_freed: Notify::new(),
            failures: AtomicU32::new(0),
            racks: RwLock::new(HashMap::new()),
        }
    }

    /// The server-assigned node id.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The address this node is reached at.
    pub fn host(&self) -> &Host {
        &self.host
    }

    /// Takes a connection from the pool, opening a new one within the
    /// pool bound if no healthy idle connection is available. With the
    /// pool exhausted, waits up to `wait` for another task to return a
    /// slot; `None` waits without limit.
    pub async fn acquire(&self, wait: Option<Duration>) -> Result<Connection> {
        let deadline = wait.map(|w| Instant::now() + w);
        loop {
            enum Slot {
                Idle(Connection),
                Open,
                Full(usize),
            }
            let slot = {
                let mut pool = self.pool.lock().expect("pool lock poisoned");
                if let Some(conn) = pool.idle.pop_front() {
                    Slot::Idle(conn)
                } else if pool.total < self.network.max_conns_per_node() {
                    pool.total += 1;
                    Slot::Open
                } else {
                    Slot::Full(pool.total)
                }
            };

            match slot {
                Slot::Idle(conn) if conn.is_idle_expired(self.network.idle_timeout()) => {
                    // Expired while pooled; drop it and try again.
                    self.forget(conn);
                }
                Slot::Idle(conn) => return Ok(conn),
                Slot::Open => match self.open_connection().await {
                    Ok(conn) => return Ok(conn),
                    Err(e) => {
                        {
                            let mut pool = self.pool.lock().expect("pool lock poisoned");
                            pool.total -= 1;
                        }
                        self.slot_freed.notify_one();
                        return Err(e);
                    }
                },
                Slot::Full(in_use) => {
                    let freed = self.slot_freed.notified();
                    match deadline {
                        Some(deadline) => {
                            let remaining = deadline.saturating_duration_since(Instant::now());
                            if remaining.is_zero()
                                || tokio::time::timeout(remaining, freed).await.is_err()
                            {
                                return Err(AerokvError::Connection(format!(
                                    "connection pool to {} exhausted ({} in use)",
                                    self.host, in_use
                                )));
                            }
                        }
                        None => freed.await,
                    }
                }
            }
        }
    }

    /// Returns a healthy connection to the pool.
    pub fn release(&self, conn: Connection) {
        {
            let mut pool = self.pool.lock().expect("pool lock poisoned");
            pool.idle.push_back(conn);
        }
        self.slot_freed.notify_one();
    }

    /// Discards a connection whose request failed.
    pub fn forget(&self, conn: Connection) {
        {
            let mut pool = self.pool.lock().expect("pool lock poisoned");
            pool.total -= 1;
        }
        self.slot_freed.notify_one();
        conn.close();
    }

    async fn open_connection(&self) -> Result<Connection> {
        let mut conn = Connection::connect(&self.host, &self.network).await?;
        if let Some(auth) = &self.auth {
            let session = self.session.read().expect("session lock poisoned").clone();
            match session {
                Some(session) => {
                    admin::authenticate(&mut conn, auth.username(), &session).await?
                }
                None => {
                    self.login_on(&mut conn, auth).await?;
                }
            }
        }
        Ok(conn)
    }

    async fn login_on(&self, conn: &mut Connection, auth: &AuthConfig) -> Result<()> {
        let login_fut = admin::login(conn, auth);
        let session = tokio::time::timeout(self.network.login_timeout(), login_fut)
            .await
            .map_err(|_| AerokvError::Timeout(format!("login to {} timed out", self.host)))??;
        *self.session.write().expect("session lock poisoned") = Some(session);
        Ok(())
    }

    /// Re-runs login to refresh the session token, using a pooled
    /// connection. Called by the tend loop before tokens expire.
    pub async fn refresh_session(&self) -> Result<()> {
        let Some(auth) = self.auth.clone() else {
            return Ok(());
        };
        let mut conn = self.acquire(Some(self.network.login_timeout())).await?;
        match self.login_on(&mut conn, &auth).await {
            Ok(()) => {
                self.release(conn);
                Ok(())
            }
            Err(e) => {
                self.forget(conn);
                Err(e)
            }
        }
    }

    /// True when the cached session token is approaching its TTL.
    pub fn session_needs_refresh(&self) -> bool {
        self.session
            .read()
            .expect("session lock poisoned")
            .as_ref()
            .is_some_and(Session::needs_refresh)
    }

    /// Records a failed tend observation; returns the new streak.
    pub fn record_failure(&self) -> u32 {
        self.failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Clears the failure streak after a healthy observation.
    pub fn reset_failures(&self) {
        self.failures.store(0, Ordering::Relaxed);
    }

    /// Consecutive failed tend observations.
    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Replaces this node's rack assignments.
    pub fn set_racks(&self, racks: HashMap<String, u32>) {
        *self.racks.write().expect("racks lock poisoned") = racks;
    }

    /// This node's rack for the namespace, if advertised.
    pub fn rack_id(&self, namespace: &str) -> Option<u32> {
        self.racks
            .read()
            .expect("racks lock poisoned")
            .get(namespace)
            .copied()
    }

    /// Closes idle connections past the idle timeout.
    pub fn sweep_idle(&self) {
        let mut swept = false;
        {
            let mut pool = self.pool.lock().expect("pool lock poisoned");
            let timeout = self.network.idle_timeout();
            while let Some(conn) = pool.idle.front() {
                if conn.is_idle_expired(timeout) {
                    let conn = pool.idle.pop_front().expect("checked front");
                    pool.total -= 1;
                    conn.close();
                    swept = true;
                } else {
                    break;
                }
            }
        }
        if swept {
            self.slot_freed.notify_one();
        }
    }

    /// Closes every pooled connection; called when the node is dropped
    /// from the cluster.
    pub fn drain(&self) {
        {
            let mut pool = self.pool.lock().expect("pool lock poisoned");
            while let Some(conn) = pool.idle.pop_front() {
                pool.total -= 1;
                conn.close();
            }
        }
        self.slot_freed.notify_waiters();
    }

    /// Idle plus in-use connection count; used by tests and metrics.
    pub fn pooled(&self) -> usize {
        self.pool.lock().expect("pool lock poisoned").total
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn test_node(host: Host, max_conns: usize) -> Node {
        let network = crate::config::NetworkConfigBuilder::new()
            .max_conns_per_node(max_conns)
            .build()
            .unwrap();
        Node::new("A1", host, network, None)
    }

    #[tokio::test]
    async fn pool_bound_enforced() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                let (socket, _) = listener.accept().await.unwrap();
                held.push(socket);
            }
        });

        let node = test_node(Host::new(addr.ip().to_string(), addr.port()), 2);
        let c1 = node.acquire(None).await.unwrap();
        let _c2 = node.acquire(None).await.unwrap();
        assert_eq!(node.pooled(), 2);

        // Nobody returns a slot within the wait, so the third acquire
        // times out.
        let err = node
            .acquire(Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, AerokvError::Connection(_)));

        // Releasing makes the slot reusable without a new connect.
        node.release(c1);
        let _c3 = node.acquire(None).await.unwrap();
        assert_eq!(node.pooled(), 2);
    }

    #[tokio::test]
    async fn acquire_waits_for_released_slot() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                let (socket, _) = listener.accept().await.unwrap();
                held.push(socket);
            }
        });

        let node = Arc::new(test_node(
            Host::new(addr.ip().to_string(), addr.port()),
            1,
        ));
        let held = node.acquire(None).await.unwrap();

        let waiter = {
            let node = Arc::clone(&node);
            tokio::spawn(async move { node.acquire(Some(Duration::from_secs(5))).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        node.release(held);

        // The waiter picks up the freed slot instead of failing.
        assert!(waiter.await.unwrap().is_ok());
        assert_eq!(node.pooled(), 1);
    }

    #[tokio::test]
    async fn failed_connect_frees_slot() {
        // A listener that is immediately dropped leaves a port nothing
        // accepts on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let node = test_node(Host::new(addr.ip().to_string(), addr.port()), 1);
        assert!(node.acquire(None).await.is_err());
        assert_eq!(node.pooled(), 0);
    }

    #[tokio::test]
    async fn drain_closes_idle() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                let (mut socket, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let mut buf = [0u8; 1];
                    let _ = socket.read(&mut buf).await;
                });
                held.push(());
            }
        });

        let node = test_node(Host::new(addr.ip().to_string(), addr.port()), 4);
        let conn = node.acquire(None).await.unwrap();
        node.release(conn);
        assert_eq!(node.pooled(), 1);
        node.drain();
        assert_eq!(node.pooled(), 0);
    }

    #[test]
    fn failure_streak() {
        let node = test_node(Host::new("127.0.0.1", 3000), 1);
        assert_eq!(node.record_failure(), 1);
        assert_eq!(node.record_failure(), 2);
        node.reset_failures();
        assert_eq!(node.failures(), 0);
    }
}
