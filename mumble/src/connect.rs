//! TLS control-channel setup.

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore, ServerCertVerified, TLSError};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::webpki::DNSNameRef;
use tokio_rustls::TlsConnector;

/// SNI stand-in when the host is a bare address. Verification is disabled,
/// so the name only has to be syntactically valid.
const FALLBACK_SNI: &str = "mumble.invalid";

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid certificate file: {0}")]
    BadCertificate(&'static str),
    #[error("TLS setup failed: {0}")]
    Tls(#[from] TLSError),
    #[error("connection timed out")]
    Timeout,
}

/// Accepts whatever certificate the server presents. Mumble deployments
/// overwhelmingly run self-signed certificates and the reference client
/// pins rather than verifies; this client does not verify at all, which is
/// a known limitation.
struct AcceptAnyCertificate;

impl rustls::ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _roots: &RootCertStore,
        _presented_certs: &[Certificate],
        _dns_name: DNSNameRef<'_>,
        _ocsp_response: &[u8],
    ) -> Result<ServerCertVerified, TLSError> {
        Ok(ServerCertVerified::assertion())
    }
}

pub async fn connect(
    host: &str,
    port: u16,
    certfile: Option<&Path>,
) -> Result<TlsStream<TcpStream>, ConnectError> {
    let mut config = ClientConfig::new();
    config
        .dangerous()
        .set_certificate_verifier(Arc::new(AcceptAnyCertificate));

    if let Some(certfile) = certfile {
        let content = tokio::fs::read(certfile).await?;
        let (certs, key) = load_identity(&content)?;
        config.set_single_client_cert(certs, key)?;
    }

    let stream = TcpStream::connect((host, port)).await?;

    let dns_name = DNSNameRef::try_from_ascii_str(host).unwrap_or_else(|_| {
        DNSNameRef::try_from_ascii_str(FALLBACK_SNI).expect("fallback SNI is a valid name")
    });

    let connector = TlsConnector::from(Arc::new(config));
    Ok(connector.connect(dns_name, stream).await?)
}

/// Pulls the certificate chain and private key out of one PEM file.
fn load_identity(content: &[u8]) -> Result<(Vec<Certificate>, PrivateKey), ConnectError> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut Cursor::new(content))
        .map_err(|_| ConnectError::BadCertificate("unreadable certificate"))?
        .into_iter()
        .map(Certificate)
        .collect();

    if certs.is_empty() {
        return Err(ConnectError::BadCertificate("no certificate in file"));
    }

    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut Cursor::new(content))
        .map_err(|_| ConnectError::BadCertificate("unreadable private key"))?;
    if keys.is_empty() {
        keys = rustls_pemfile::rsa_private_keys(&mut Cursor::new(content))
            .map_err(|_| ConnectError::BadCertificate("unreadable private key"))?;
    }

    let key = keys
        .into_iter()
        .next()
        .map(PrivateKey)
        .ok_or(ConnectError::BadCertificate("no private key in file"))?;

    Ok((certs, key))
}
