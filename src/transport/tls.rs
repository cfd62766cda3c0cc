//! TLS client configuration and the handshake manager.
//!
//! [`TlsHandshaker::handshake`] upgrades a TCP stream and falls back twice
//! on failure: once through a fresh socket-controlled connection, then
//! through a plain `TcpStream::connect`. Each attempt gets its own timeout
//! window.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{info, warn};

use super::tcp::{TcpConnector, with_timeout};
use super::{Network, TlsStream};
use crate::addr;
use crate::error::{Error, Result};

/// Client TLS configuration shared by every dial.
///
/// The server name is fixed on first use, either from the builder or from
/// the host of the first address handshaked with.
#[derive(Debug)]
pub struct TlsConfig {
    client: Arc<ClientConfig>,
    server_name: RwLock<Option<ServerName<'static>>>,
}

impl TlsConfig {
    pub fn new(client: ClientConfig) -> Self {
        Self::from_arc(Arc::new(client))
    }

    pub fn from_arc(client: Arc<ClientConfig>) -> Self {
        Self {
            client,
            server_name: RwLock::new(None),
        }
    }

    pub fn builder() -> TlsConfigBuilder {
        TlsConfigBuilder::default()
    }

    pub fn client_config(&self) -> &Arc<ClientConfig> {
        &self.client
    }

    pub fn alpn_protocols(&self) -> &[Vec<u8>] {
        &self.client.alpn_protocols
    }

    /// The server name, if one has been set.
    pub fn server_name(&self) -> Option<ServerName<'static>> {
        let Ok(name) = self.server_name.read() else {
            return None;
        };
        name.clone()
    }

    /// Server name to verify against, deriving it from `host` when unset.
    pub fn server_name_for(&self, host: &str) -> Result<ServerName<'static>> {
        if let Some(name) = self.server_name() {
            return Ok(name);
        }

        let derived = parse_server_name(host)?;
        let Ok(mut slot) = self.server_name.write() else {
            return Ok(derived);
        };
        // Another dial may have won the race.
        Ok(slot.get_or_insert(derived).clone())
    }

    fn set_server_name(&self, name: ServerName<'static>) {
        if let Ok(mut slot) = self.server_name.write() {
            *slot = Some(name);
        }
    }
}

fn parse_server_name(host: &str) -> Result<ServerName<'static>> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    ServerName::try_from(host)
        .map(|name| name.to_owned())
        .map_err(|e| Error::TlsConfig(format!("invalid server name {host:?}: {e}")))
}

/// Builder for [`TlsConfig`].
///
/// Without a CA file the bundled webpki roots are trusted.
#[derive(Debug, Default)]
pub struct TlsConfigBuilder {
    ca_file: Option<PathBuf>,
    cert_file: Option<PathBuf>,
    key_file: Option<PathBuf>,
    alpn: Vec<Vec<u8>>,
    insecure_skip_verify: bool,
    server_name: Option<String>,
}

impl TlsConfigBuilder {
    /// PEM file of trusted CA certificates.
    pub fn ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_file = Some(path.into());
        self
    }

    /// PEM client certificate chain and private key.
    pub fn client_auth(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.cert_file = Some(cert.into());
        self.key_file = Some(key.into());
        self
    }

    pub fn alpn_protocols(mut self, protocols: Vec<Vec<u8>>) -> Self {
        self.alpn = protocols;
        self
    }

    /// Accept any server certificate.
    pub fn insecure_skip_verify(mut self, skip: bool) -> Self {
        self.insecure_skip_verify = skip;
        self
    }

    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    pub fn build(self) -> Result<TlsConfig> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::TlsConfig(e.to_string()))?;

        let builder = if self.insecure_skip_verify {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(InsecureVerifier(provider)))
        } else {
            builder.with_root_certificates(self.root_store()?)
        };

        let mut client = match (&self.cert_file, &self.key_file) {
            (Some(cert), Some(key)) => {
                let chain = load_certs(cert)?;
                let key = load_key(key)?;
                builder
                    .with_client_auth_cert(chain, key)
                    .map_err(|e| Error::TlsConfig(e.to_string()))?
            }
            _ => builder.with_no_client_auth(),
        };
        client.alpn_protocols = self.alpn;

        let config = TlsConfig::new(client);
        if let Some(name) = &self.server_name {
            config.set_server_name(parse_server_name(name)?);
        }
        Ok(config)
    }

    fn root_store(&self) -> Result<RootCertStore> {
        let mut roots = RootCertStore::empty();
        match &self.ca_file {
            Some(path) => {
                for cert in load_certs(path)? {
                    roots
                        .add(cert)
                        .map_err(|e| Error::TlsConfig(format!("{}: {e}", path.display())))?;
                }
            }
            None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
        }
        Ok(roots)
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<std::io::Result<Vec<_>>>()?;
    if certs.is_empty() {
        return Err(Error::TlsConfig(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| Error::TlsConfig(format!("no private key found in {}", path.display())))
}

/// Verifier that accepts every certificate but still checks handshake
/// signatures.
#[derive(Debug)]
struct InsecureVerifier(Arc<CryptoProvider>);

impl ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Upgrades TCP connections to TLS with two reconnecting fallbacks.
#[derive(Clone)]
pub struct TlsHandshaker {
    config: Arc<TlsConfig>,
    connector: TcpConnector,
    timeout: Duration,
}

impl TlsHandshaker {
    pub fn new(config: Arc<TlsConfig>, connector: TcpConnector, timeout: Duration) -> Self {
        Self {
            config,
            connector,
            timeout,
        }
    }

    pub fn config(&self) -> &Arc<TlsConfig> {
        &self.config
    }

    /// Handshake over `stream`, reconnecting to `addr` on failure.
    pub async fn handshake(
        &self,
        stream: TcpStream,
        network: Network,
        addr: &str,
    ) -> Result<TlsStream> {
        let host = addr::split_host_port(addr)
            .map(|(host, _)| host)
            .unwrap_or(addr);
        let name = self
            .config
            .server_name_for(host)
            .map_err(|e| handshake_error(network, addr, e))?;

        let err = match self.upgrade(stream, name.clone(), addr).await {
            Ok(tls) => return Ok(tls),
            Err(e) => e,
        };
        warn!(network = %network, addr = %addr, error = %err, "tls handshake failed, retrying on a new connection");

        let err = match self.connector.connect(network, addr).await {
            Ok(stream) => match self.upgrade(stream, name.clone(), addr).await {
                Ok(tls) => return Ok(tls),
                Err(e) => e,
            },
            Err(e) => e,
        };
        warn!(network = %network, addr = %addr, error = %err, "tls handshake failed, retrying on a plain connection");

        let err = match with_timeout(self.timeout, "connect", addr, TcpStream::connect(addr)).await
        {
            Ok(stream) => match self.upgrade(stream, name, addr).await {
                Ok(tls) => return Ok(tls),
                Err(e) => e,
            },
            Err(e) => e,
        };
        Err(handshake_error(network, addr, err))
    }

    async fn upgrade(
        &self,
        stream: TcpStream,
        name: ServerName<'static>,
        addr: &str,
    ) -> Result<TlsStream> {
        let connector = TlsConnector::from(self.config.client.clone());
        let tls = with_timeout(
            self.timeout,
            "tls handshake",
            addr,
            connector.connect(name, stream),
        )
        .await?;

        if tls.get_ref().1.is_handshaking() {
            return Err(Error::HandshakeIncomplete);
        }
        info!(
            addr = %addr,
            alpn = ?tls.get_ref().1.alpn_protocol().map(String::from_utf8_lossy),
            "tls handshake complete"
        );
        Ok(tls)
    }
}

fn handshake_error(network: Network, addr: &str, source: Error) -> Error {
    Error::TlsHandshake {
        network: network.to_string(),
        addr: addr.to_string(),
        source: Box::new(source),
    }
}
