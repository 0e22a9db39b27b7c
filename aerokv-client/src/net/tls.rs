//! rustls stream setup for TLS-enabled clusters.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use aerokv_core::{AerokvError, Result};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::config::{Host, TlsConfig};

fn open(path: &Path) -> Result<BufReader<File>> {
    let file = File::open(path)
        .map_err(|e| AerokvError::Param(format!("failed to open {}: {}", path.display(), e)))?;
    Ok(BufReader::new(file))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    rustls_pemfile::certs(&mut open(path)?)
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| AerokvError::Param(format!("failed to parse {}: {}", path.display(), e)))
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut open(path)?)
        .map_err(|e| AerokvError::Param(format!("failed to parse {}: {}", path.display(), e)))?
        .ok_or_else(|| AerokvError::Param(format!("no private key in {}", path.display())))
}

/// Performs the client-side TLS handshake over an established TCP stream.
///
/// The peer certificate is validated against the host's configured TLS
/// name, falling back to the host name itself.
pub(crate) async fn connect(
    stream: TcpStream,
    host: &Host,
    tls: &TlsConfig,
) -> Result<TlsStream<TcpStream>> {
    let mut roots = RootCertStore::empty();
    if let Some(ca_path) = tls.ca_cert_path() {
        for cert in load_certs(ca_path)? {
            roots
                .add(cert)
                .map_err(|e| AerokvError::Param(format!("invalid CA certificate: {}", e)))?;
        }
    } else {
        return Err(AerokvError::Param(
            "TLS enabled but no CA certificate configured".into(),
        ));
    }

    let builder = ClientConfig::builder().with_root_certificates(roots);
    let config = match (tls.client_cert_path(), tls.client_key_path()) {
        (Some(cert_path), Some(key_path)) => builder
            .with_client_auth_cert(load_certs(cert_path)?, load_key(key_path)?)
            .map_err(|e| AerokvError::Param(format!("invalid client certificate: {}", e)))?,
        _ => builder.with_no_client_auth(),
    };

    let server_name = host.tls_name().unwrap_or_else(|| host.name()).to_string();
    let server_name = ServerName::try_from(server_name)
        .map_err(|e| AerokvError::Param(format!("invalid TLS server name: {}", e)))?;

    let connector = TlsConnector::from(Arc::new(config));
    connector
        .connect(server_name, stream)
        .await
        .map_err(|e| AerokvError::Connection(format!("TLS handshake with {} failed: {}", host, e)))
}
