//! Client configuration types and builders.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use aerokv_core::value::SendBoolAs;

/// Default server port.
/// Port assumed when a host string carries none.
pub const DEFAULT_PORT: u16 = 3000;
/// Default connection timeout.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default login timeout.
const DEFAULT_LOGIN_TIMEOUT: Duration = Duration::from_secs(5);
/// Default cluster tend interval.
const DEFAULT_TEND_INTERVAL: Duration = Duration::from_secs(1);
/// Default connection pool limit per node.
const DEFAULT_MAX_CONNS_PER_NODE: usize = 100;
/// Default idle timeout after which pooled connections are dropped.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(55);

/// Configuration error returned when validation fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    message: String,
}

impl ConfigError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for aerokv_core::AerokvError {
    fn from(err: ConfigError) -> Self {
        aerokv_core::AerokvError::Param(err.to_string())
    }
}

/// A seed or discovered server address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Host {
    name: String,
    port: u16,
    tls_name: Option<String>,
}

impl Host {
    /// A host at `name:port`.
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
            tls_name: None,
        }
    }

    /// Attaches the TLS name the server certificate must present.
    pub fn with_tls_name(mut self, tls_name: impl Into<String>) -> Self {
        self.tls_name = Some(tls_name.into());
        self
    }

    /// Host name or address.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Expected TLS certificate name, if any.
    pub fn tls_name(&self) -> Option<&str> {
        self.tls_name.as_deref()
    }

    /// The `host:port` form used for socket connects.
    pub fn address(&self) -> String {
        format!("{}:{}", self.name, self.port)
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.port)
    }
}

impl FromStr for Host {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once(':') {
            Some((name, port)) => {
                let port = port
                    .parse()
                    .map_err(|_| ConfigError::new(format!("invalid port in host '{}'", s)))?;
                Ok(Host::new(name, port))
            }
            None => Ok(Host::new(s, DEFAULT_PORT)),
        }
    }
}

/// Network configuration for cluster connections.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    connect_timeout: Duration,
    login_timeout: Duration,
    tend_interval: Duration,
    max_conns_per_node: usize,
    idle_timeout: Duration,
    tls: TlsConfig,
}

impl NetworkConfig {
    /// Returns the per-connection connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Returns the timeout covering the login handshake.
    pub fn login_timeout(&self) -> Duration {
        self.login_timeout
    }

    /// Returns the interval between cluster tend rounds.
    pub fn tend_interval(&self) -> Duration {
        self.tend_interval
    }

    /// Returns the connection pool limit per node.
    pub fn max_conns_per_node(&self) -> usize {
        self.max_conns_per_node
    }

    /// Returns how long a pooled connection may sit idle.
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Returns the TLS configuration.
    pub fn tls(&self) -> &TlsConfig {
        &self.tls
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            login_timeout: DEFAULT_LOGIN_TIMEOUT,
            tend_interval: DEFAULT_TEND_INTERVAL,
            max_conns_per_node: DEFAULT_MAX_CONNS_PER_NODE,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            tls: TlsConfig::default(),
        }
    }
}

/// Builder for `NetworkConfig`.
#[derive(Debug, Clone, Default)]
pub struct NetworkConfigBuilder {
    connect_timeout: Option<Duration>,
    login_timeout: Option<Duration>,
    tend_interval: Option<Duration>,
    max_conns_per_node: Option<usize>,
    idle_timeout: Option<Duration>,
    tls: TlsConfigBuilder,
}

impl NetworkConfigBuilder {
    /// Creates a new network configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the per-connection connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Sets the timeout covering the login handshake.
    pub fn login_timeout(mut self, timeout: Duration) -> Self {
        self.login_timeout = Some(timeout);
        self
    }

    /// Sets the interval between cluster tend rounds.
    pub fn tend_interval(mut self, interval: Duration) -> Self {
        self.tend_interval = Some(interval);
        self
    }

    /// Sets the connection pool limit per node.
    pub fn max_conns_per_node(mut self, limit: usize) -> Self {
        self.max_conns_per_node = Some(limit);
        self
    }

    /// Sets how long a pooled connection may sit idle before being dropped.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Configures TLS settings using a builder function.
    pub fn tls<F>(mut self, f: F) -> Self
    where
        F: FnOnce(TlsConfigBuilder) -> TlsConfigBuilder,
    {
        self.tls = f(self.tls);
        self
    }

    /// Builds the network configuration.
    pub fn build(self) -> Result<NetworkConfig, ConfigError> {
        let max_conns_per_node = self.max_conns_per_node.unwrap_or(DEFAULT_MAX_CONNS_PER_NODE);
        if max_conns_per_node == 0 {
            return Err(ConfigError::new("max_conns_per_node must be at least 1"));
        }
        let tend_interval = self.tend_interval.unwrap_or(DEFAULT_TEND_INTERVAL);
        if tend_interval.is_zero() {
            return Err(ConfigError::new("tend_interval must be non-zero"));
        }
        Ok(NetworkConfig {
            connect_timeout: self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            login_timeout: self.login_timeout.unwrap_or(DEFAULT_LOGIN_TIMEOUT),
            tend_interval,
            max_conns_per_node,
            idle_timeout: self.idle_timeout.unwrap_or(DEFAULT_IDLE_TIMEOUT),
            tls: self.tls.build()?,
        })
    }
}

/// TLS configuration for secure connections.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    enabled: bool,
    for_login_only: bool,
    ca_cert_path: Option<PathBuf>,
    client_cert_path: Option<PathBuf>,
    client_key_path: Option<PathBuf>,
}

impl TlsConfig {
    /// Returns whether TLS is enabled.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Returns whether TLS covers only the login handshake, with data
    /// traffic downgraded to plain TCP afterwards.
    pub fn for_login_only(&self) -> bool {
        self.for_login_only
    }

    /// Returns the path to the CA certificate file.
    pub fn ca_cert_path(&self) -> Option<&PathBuf> {
        self.ca_cert_path.as_ref()
    }

    /// Returns the path to the client certificate file.
    pub fn client_cert_path(&self) -> Option<&PathBuf> {
        self.client_cert_path.as_ref()
    }

    /// Returns the path to the client private key file.
    pub fn client_key_path(&self) -> Option<&PathBuf> {
        self.client_key_path.as_ref()
    }

    /// Returns true if client authentication is configured.
    pub fn has_client_auth(&self) -> bool {
        self.client_cert_path.is_some() && self.client_key_path.is_some()
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            for_login_only: false,
            ca_cert_path: None,
            client_cert_path: None,
            client_key_path: None,
        }
    }
}

/// Builder for `TlsConfig`.
#[derive(Debug, Clone, Default)]
pub struct TlsConfigBuilder {
    enabled: Option<bool>,
    for_login_only: Option<bool>,
    ca_cert_path: Option<PathBuf>,
    client_cert_path: Option<PathBuf>,
    client_key_path: Option<PathBuf>,
}

impl TlsConfigBuilder {
    /// Creates a new TLS configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables TLS.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    /// Restricts TLS to the login handshake.
    pub fn for_login_only(mut self, login_only: bool) -> Self {
        self.for_login_only = Some(login_only);
        self
    }

    /// Sets the path to the CA certificate file for server verification.
    pub fn ca_cert_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self
    }

    /// Sets client certificate and key paths for mutual TLS.
    pub fn client_auth(mut self, cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        self.client_cert_path = Some(cert_path.into());
        self.client_key_path = Some(key_path.into());
        self
    }

    /// Builds the TLS configuration, returning an error if validation fails.
    pub fn build(self) -> Result<TlsConfig, ConfigError> {
        if self.client_cert_path.is_some() != self.client_key_path.is_some() {
            return Err(ConfigError::new(
                "both client certificate and key must be provided together",
            ));
        }
        Ok(TlsConfig {
            enabled: self.enabled.unwrap_or(false),
            for_login_only: self.for_login_only.unwrap_or(false),
            ca_cert_path: self.ca_cert_path,
            client_cert_path: self.client_cert_path,
            client_key_path: self.client_key_path,
        })
    }
}

/// Credentials for server authentication.
#[derive(Clone)]
pub struct AuthConfig {
    username: String,
    password: String,
}

impl AuthConfig {
    /// Credentials for the given user.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// The user name.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// The clear-text password, consumed by the login handshake.
    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Top-level client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    seeds: Vec<Host>,
    cluster_name: Option<String>,
    auth: Option<AuthConfig>,
    network: NetworkConfig,
    send_bool_as: SendBoolAs,
    rack_ids: Vec<u32>,
}

impl ClientConfig {
    /// Creates a configuration builder.
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Returns the seed addresses used for initial discovery.
    pub fn seeds(&self) -> &[Host] {
        &self.seeds
    }

    /// Returns the expected cluster name, if pinned.
    pub fn cluster_name(&self) -> Option<&str> {
        self.cluster_name.as_deref()
    }

    /// Returns the authentication credentials, if configured.
    pub fn auth(&self) -> Option<&AuthConfig> {
        self.auth.as_ref()
    }

    /// Returns the network configuration.
    pub fn network(&self) -> &NetworkConfig {
        &self.network
    }

    /// Returns how boolean bin values are sent on the wire.
    pub fn send_bool_as(&self) -> SendBoolAs {
        self.send_bool_as
    }

    /// Returns the racks this client prefers for rack-aware reads.
    pub fn rack_ids(&self) -> &[u32] {
        &self.rack_ids
    }
}

/// Builder for `ClientConfig`.
#[derive(Debug, Clone, Default)]
pub struct ClientConfigBuilder {
    seeds: Vec<Host>,
    cluster_name: Option<String>,
    auth: Option<AuthConfig>,
    network: NetworkConfigBuilder,
    send_bool_as: Option<SendBoolAs>,
    rack_ids: Vec<u32>,
}

impl ClientConfigBuilder {
    /// Creates a new client configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a seed address.
    pub fn add_seed(mut self, host: Host) -> Self {
        self.seeds.push(host);
        self
    }

    /// Sets the seed addresses, replacing any previously configured.
    pub fn seeds(mut self, seeds: impl IntoIterator<Item = Host>) -> Self {
        self.seeds = seeds.into_iter().collect();
        self
    }

    /// Pins the expected cluster name; nodes reporting a different name
    /// are refused.
    pub fn cluster_name(mut self, name: impl Into<String>) -> Self {
        self.cluster_name = Some(name.into());
        self
    }

    /// Sets the authentication credentials.
    pub fn auth(mut self, auth: AuthConfig) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Configures network settings using a builder function.
    pub fn network<F>(mut self, f: F) -> Self
    where
        F: FnOnce(NetworkConfigBuilder) -> NetworkConfigBuilder,
    {
        self.network = f(self.network);
        self
    }

    /// Sets how boolean bin values are sent on the wire.
    pub fn send_bool_as(mut self, mode: SendBoolAs) -> Self {
        self.send_bool_as = Some(mode);
        self
    }

    /// Declares the racks this client lives in for rack-aware reads.
    pub fn rack_ids(mut self, racks: impl IntoIterator<Item = u32>) -> Self {
        self.rack_ids = racks.into_iter().collect();
        self
    }

    /// Builds the client configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if no seeds are configured or a nested
    /// section fails validation.
    pub fn build(self) -> Result<ClientConfig, ConfigError> {
        if self.seeds.is_empty() {
            return Err(ConfigError::new("at least one seed host is required"));
        }
        Ok(ClientConfig {
            seeds: self.seeds,
            cluster_name: self.cluster_name,
            auth: self.auth,
            network: self.network.build()?,
            send_bool_as: self.send_bool_as.unwrap_or_default(),
            rack_ids: self.rack_ids,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_parses_with_and_without_port() {
        let h: Host = "10.0.0.1:3100".parse().unwrap();
        assert_eq!(h.name(), "10.0.0.1");
        assert_eq!(h.port(), 3100);

        let h: Host = "db.internal".parse().unwrap();
        assert_eq!(h.port(), DEFAULT_PORT);

        assert!("db.internal:notaport".parse::<Host>().is_err());
    }

    #[test]
    fn build_requires_seeds() {
        assert!(ClientConfig::builder().build().is_err());

        let config = ClientConfig::builder()
            .add_seed(Host::new("127.0.0.1", 3000))
            .build()
            .unwrap();
        assert_eq!(config.seeds().len(), 1);
        assert!(config.cluster_name().is_none());
    }

    #[test]
    fn nested_builders_validate() {
        let err = ClientConfig::builder()
            .add_seed(Host::new("127.0.0.1", 3000))
            .network(|n| n.max_conns_per_node(0))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("max_conns_per_node"));

        let err = ClientConfig::builder()
            .add_seed(Host::new("127.0.0.1", 3000))
            .network(|n| n.tls(|t| t.enabled(true).client_auth("cert.pem", "key.pem")))
            .build();
        assert!(err.is_ok());
    }

    #[test]
    fn auth_debug_redacts_password() {
        let auth = AuthConfig::new("admin", "hunter2");
        let debug = format!("{:?}", auth);
        assert!(!debug.contains("hunter2"));
    }
}
