//! Single connection to a server node.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use aerokv_core::info;
use aerokv_core::protocol::{ProtoCodec, ProtoFrame};
use aerokv_core::{AerokvError, Result};
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder};

use crate::config::{Host, NetworkConfig};

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generates a new unique connection ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw ID value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug)]
enum Stream {
    Tcp(TcpStream),
    #[cfg(feature = "tls")]
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl Stream {
    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Stream::Tcp(s) => s.write_all(buf).await,
            #[cfg(feature = "tls")]
            Stream::Tls(s) => s.write_all(buf).await,
        }
    }

    async fn read_buf(&mut self, buf: &mut BytesMut) -> std::io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read_buf(buf).await,
            #[cfg(feature = "tls")]
            Stream::Tls(s) => s.read_buf(buf).await,
        }
    }
}

/// A single-request-at-a-time connection to a server node.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    host: Host,
    stream: Stream,
    codec: ProtoCodec,
    read_buffer: BytesMut,
    created_at: Instant,
    last_used_at: Instant,
}

impl Connection {
    /// Establishes a data connection. When TLS is configured for login
    /// traffic only, this stays plaintext.
    pub async fn connect(host: &Host, network: &NetworkConfig) -> Result<Self> {
        Self::connect_inner(host, network, false).await
    }

    /// Establishes a connection that will carry a credential exchange;
    /// always TLS when TLS is enabled at all.
    pub async fn connect_for_login(host: &Host, network: &NetworkConfig) -> Result<Self> {
        Self::connect_inner(host, network, true).await
    }

    async fn connect_inner(host: &Host, network: &NetworkConfig, for_login: bool) -> Result<Self> {
        let connect = async {
            let stream = TcpStream::connect(host.address()).await.map_err(|e| {
                AerokvError::Connection(format!("failed to connect to {}: {}", host, e))
            })?;
            stream.set_nodelay(true).map_err(|e| {
                AerokvError::Connection(format!("failed to set TCP_NODELAY: {}", e))
            })?;
            Self::wrap(stream, host, network, for_login).await
        };
        let conn = tokio::time::timeout(network.connect_timeout(), connect)
            .await
            .map_err(|_| {
                AerokvError::Timeout(format!("connect to {} timed out", host))
            })??;
        tracing::debug!(id = %conn.id, host = %host, "established connection");
        Ok(conn)
    }

    #[cfg(feature = "tls")]
    async fn wrap(
        stream: TcpStream,
        host: &Host,
        network: &NetworkConfig,
        for_login: bool,
    ) -> Result<Self> {
        let tls = network.tls();
        let stream = if tls.enabled() && (for_login || !tls.for_login_only()) {
            let tls = super::tls::connect(stream, host, tls).await?;
            Stream::Tls(Box::new(tls))
        } else {
            Stream::Tcp(stream)
        };
        Ok(Self::new(stream, host.clone()))
    }

    #[cfg(not(feature = "tls"))]
    async fn wrap(
        stream: TcpStream,
        host: &Host,
        network: &NetworkConfig,
        _for_login: bool,
    ) -> Result<Self> {
        if network.tls().enabled() {
            return Err(AerokvError::Param(
                "TLS requested but the client was built without the 'tls' feature".into(),
            ));
        }
        Ok(Self::new(Stream::Tcp(stream), host.clone()))
    }

    fn new(stream: Stream, host: Host) -> Self {
        let now = Instant::now();
        Self {
            id: ConnectionId::new(),
            host,
            stream,
            codec: ProtoCodec::new(),
            read_buffer: BytesMut::with_capacity(8192),
            created_at: now,
            last_used_at: now,
        }
    }

    /// Returns the connection's unique identifier.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Returns the host this connection talks to.
    pub fn host(&self) -> &Host {
        &self.host
    }

    /// Returns when this connection was created.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// True if the connection has sat unused longer than `idle_timeout`.
    pub fn is_idle_expired(&self, idle_timeout: Duration) -> bool {
        self.last_used_at.elapsed() >= idle_timeout
    }

    /// Sends one frame.
    pub async fn send(&mut self, frame: ProtoFrame) -> Result<()> {
        let mut buf = BytesMut::new();
        self.codec.encode(frame, &mut buf)?;
        self.stream.write_all(&buf).await.map_err(|e| {
            AerokvError::Connection(format!("failed to write to {}: {}", self.host, e))
        })?;
        self.last_used_at = Instant::now();
        Ok(())
    }

    /// Receives one frame.
    ///
    /// Returns `None` if the peer closed the connection cleanly between
    /// frames.
    pub async fn receive(&mut self) -> Result<Option<ProtoFrame>> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.read_buffer)? {
                self.last_used_at = Instant::now();
                return Ok(Some(frame));
            }

            let bytes_read = self.stream.read_buf(&mut self.read_buffer).await.map_err(|e| {
                AerokvError::Connection(format!("failed to read from {}: {}", self.host, e))
            })?;

            if bytes_read == 0 {
                if self.read_buffer.is_empty() {
                    return Ok(None);
                }
                return Err(AerokvError::Connection(format!(
                    "connection to {} closed mid-frame",
                    self.host
                )));
            }
        }
    }

    /// Sends a frame and waits for the matching response.
    pub async fn round_trip(&mut self, frame: ProtoFrame) -> Result<ProtoFrame> {
        self.send(frame).await?;
        self.receive().await?.ok_or_else(|| {
            AerokvError::Connection(format!("connection to {} closed before reply", self.host))
        })
    }

    /// Issues an info request and parses the response values.
    pub async fn info(&mut self, commands: &[&str]) -> Result<HashMap<String, String>> {
        let response = self.round_trip(info::build_request(commands)).await?;
        info::parse_response(&response.payload)
    }

    /// Closes this connection.
    pub fn close(self) {
        tracing::debug!(id = %self.id, host = %self.host, "connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aerokv_core::protocol::constants::msg_type;
    use tokio::net::TcpListener;

    #[test]
    fn connection_id_uniqueness() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
        assert_eq!(ConnectionId(7).to_string(), "conn-7");
    }

    #[tokio::test]
    async fn info_round_trip_against_mock_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = vec![0u8; 13];
            socket.read_exact(&mut request).await.unwrap();
            assert_eq!(&request[8..], b"node\n");

            let body = b"node\tA1\n";
            let mut reply = Vec::new();
            reply.push(0x20);
            reply.push(msg_type::INFO);
            reply.extend_from_slice(&(body.len() as u64).to_be_bytes()[2..]);
            reply.extend_from_slice(body);
            socket.write_all(&reply).await.unwrap();
        });

        let host = Host::new(addr.ip().to_string(), addr.port());
        let network = NetworkConfig::default();
        let mut conn = Connection::connect(&host, &network).await.unwrap();
        let values = conn.info(&["node"]).await.unwrap();
        assert_eq!(values["node"], "A1");
    }

    #[tokio::test]
    async fn clean_close_yields_none() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let host = Host::new(addr.ip().to_string(), addr.port());
        let mut conn = Connection::connect(&host, &NetworkConfig::default())
            .await
            .unwrap();
        assert!(conn.receive().await.unwrap().is_none());
    }
}
