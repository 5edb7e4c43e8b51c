//! TLS for the tunnel
//!
//! Uses rustls (pure Rust, easy static linking). The client side offers ALPN
//! `http/1.1` when HTTPS fallback is allowed; a server that selects it gets a
//! plain HTTP CONNECT inside TLS instead of cipher framing.

use crate::config::TlsConfig;
use crate::error::SockstunError;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};
use tracing::{debug, info, warn};

/// ALPN protocol id that selects HTTPS fallback
pub const ALPN_HTTP11: &[u8] = b"http/1.1";

fn config_error(msg: impl Into<String>) -> SockstunError {
    SockstunError::Config(msg.into())
}

fn read_pem_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, SockstunError> {
    let file = File::open(path)
        .map_err(|e| config_error(format!("Failed to open {}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            config_error(format!(
                "Failed to parse certificates from {}: {}",
                path.display(),
                e
            ))
        })
}

fn add_certs(store: &mut RootCertStore, certs: Vec<CertificateDer<'static>>, source: &str) -> usize {
    let (added, ignored) = store.add_parsable_certificates(certs);
    if ignored > 0 {
        warn!("Ignored {} unusable certificates from {}", ignored, source);
    }
    added
}

fn load_ca_dir(store: &mut RootCertStore, dir: &Path) -> Result<usize, SockstunError> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| config_error(format!("Failed to read {}: {}", dir.display(), e)))?;

    let mut added = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let is_cert = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pem") || ext.eq_ignore_ascii_case("crt"));
        if !is_cert {
            continue;
        }
        match read_pem_certs(&path) {
            Ok(certs) => added += add_certs(store, certs, &path.display().to_string()),
            Err(e) => warn!("Skipping {}: {}", path.display(), e),
        }
    }
    Ok(added)
}

/// Fill `store` with trust anchors; returns how many were added
///
/// Sources in order of precedence: `ca_bundle`, `ca_dir`, `fallback_bundle`,
/// then the OS store. Loading stops at the first source that contributes a
/// certificate.
pub fn load_trust_roots(store: &mut RootCertStore, config: &TlsConfig) -> Result<usize, SockstunError> {
    if let Some(bundle) = &config.ca_bundle {
        let added = add_certs(store, read_pem_certs(bundle)?, &bundle.display().to_string());
        debug!("Loaded {} certificates from {}", added, bundle.display());
        if added > 0 {
            return Ok(added);
        }
    }

    if let Some(dir) = &config.ca_dir {
        let added = load_ca_dir(store, dir)?;
        debug!("Loaded {} certificates from {}", added, dir.display());
        if added > 0 {
            return Ok(added);
        }
    }

    if let Some(bundle) = &config.fallback_bundle {
        let added = add_certs(store, read_pem_certs(bundle)?, &bundle.display().to_string());
        debug!("Loaded {} fallback certificates", added);
        if added > 0 {
            return Ok(added);
        }
    }

    let native = rustls_native_certs::load_native_certs();
    for err in &native.errors {
        warn!("Error loading system certificates: {}", err);
    }
    let added = add_certs(store, native.certs, "system store");
    debug!("Loaded {} system certificates", added);
    Ok(added)
}

/// Build the client configuration
pub fn client_config(config: &TlsConfig) -> Result<ClientConfig, SockstunError> {
    let mut tls_config = if config.insecure {
        warn!("TLS certificate verification is disabled");
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth()
    } else {
        let mut root_store = RootCertStore::empty();
        let count = load_trust_roots(&mut root_store, config)?;
        if count == 0 {
            return Err(config_error("No trusted root certificates available"));
        }
        info!("Loaded {} trusted root certificates", count);
        ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth()
    };

    if config.https_fallback {
        tls_config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];
    }
    Ok(tls_config)
}

/// Build the server configuration from the PEM certificate chain and key
pub fn server_config(config: &TlsConfig) -> Result<ServerConfig, SockstunError> {
    let cert_path = config
        .cert
        .as_ref()
        .ok_or_else(|| config_error("tls.cert is required in server mode"))?;
    let key_path = config
        .key
        .as_ref()
        .ok_or_else(|| config_error("tls.key is required in server mode"))?;

    let certs = read_pem_certs(cert_path)?;
    if certs.is_empty() {
        return Err(config_error(format!(
            "No certificates found in {}",
            cert_path.display()
        )));
    }
    let key = read_private_key(key_path)?;

    let mut tls_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| config_error(format!("Invalid certificate or key: {}", e)))?;
    if config.https_fallback {
        tls_config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];
    }
    Ok(tls_config)
}

fn read_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, SockstunError> {
    let file = File::open(path)
        .map_err(|e| config_error(format!("Failed to open {}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| config_error(format!("Failed to parse {}: {}", path.display(), e)))?
        .ok_or_else(|| config_error(format!("No private key found in {}", path.display())))
}

/// TLS state built once at startup and shared read-only by connections
#[derive(Clone)]
pub struct TlsContext {
    connector: Option<TlsConnector>,
    acceptor: Option<TlsAcceptor>,
    server_name: Option<String>,
    insecure: bool,
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext")
            .field("client", &self.connector.is_some())
            .field("server", &self.acceptor.is_some())
            .field("server_name", &self.server_name)
            .field("insecure", &self.insecure)
            .finish()
    }
}

impl TlsContext {
    /// Client side; `default_name` is used when no SNI is configured
    pub fn client(config: &TlsConfig, default_name: &str) -> Result<Self, SockstunError> {
        let client = client_config(config)?;
        Ok(TlsContext {
            connector: Some(TlsConnector::from(Arc::new(client))),
            acceptor: None,
            server_name: Some(
                config
                    .sni
                    .clone()
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| default_name.to_string()),
            ),
            insecure: config.insecure,
        })
    }

    /// Server side
    pub fn server(config: &TlsConfig) -> Result<Self, SockstunError> {
        let server = server_config(config)?;
        Ok(TlsContext {
            connector: None,
            acceptor: Some(TlsAcceptor::from(Arc::new(server))),
            server_name: None,
            insecure: true,
        })
    }

    /// Name presented in SNI and verified against the peer certificate
    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    /// Run the client handshake over a connected socket
    pub async fn connect(&self, tcp: TcpStream) -> io::Result<TlsStream<TcpStream>> {
        let connector = self
            .connector
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Unsupported, "TLS client not configured"))?;
        let name = self.server_name.as_deref().unwrap_or("localhost");
        let server_name = ServerName::try_from(name.to_string())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let stream = connector.connect(server_name, tcp).await?;
        debug!("TLS connection established to {}", name);
        Ok(TlsStream::Client(stream))
    }

    /// Run the server handshake over an accepted socket
    pub async fn accept(&self, tcp: TcpStream) -> io::Result<TlsStream<TcpStream>> {
        let acceptor = self
            .acceptor
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Unsupported, "TLS server not configured"))?;
        Ok(TlsStream::Server(acceptor.accept(tcp).await?))
    }

    /// Check that the handshake really completed before use
    ///
    /// Fails with `ConnectionRefused` while still handshaking, or when the
    /// peer presented no certificate and verification is enabled.
    pub fn confirm_handshake(&self, stream: &TlsStream<TcpStream>) -> io::Result<()> {
        let (_, state) = stream.get_ref();
        if state.is_handshaking() {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "TLS handshake incomplete",
            ));
        }
        let client_side = matches!(stream, TlsStream::Client(_));
        if client_side && !self.insecure && state.peer_certificates().is_none() {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "TLS peer presented no certificate",
            ));
        }
        Ok(())
    }
}

/// Whether the negotiated ALPN selects HTTPS fallback
pub fn negotiated_fallback(stream: &TlsStream<TcpStream>) -> bool {
    stream.get_ref().1.alpn_protocol() == Some(ALPN_HTTP11)
}

/// Certificate verifier that accepts all certificates (dangerous!)
#[derive(Debug)]
struct NoVerifier;

impl tokio_rustls::rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: tokio_rustls::rustls::pki_types::UnixTime,
    ) -> Result<tokio_rustls::rustls::client::danger::ServerCertVerified, tokio_rustls::rustls::Error>
    {
        Ok(tokio_rustls::rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &tokio_rustls::rustls::DigitallySignedStruct,
    ) -> Result<
        tokio_rustls::rustls::client::danger::HandshakeSignatureValid,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &tokio_rustls::rustls::DigitallySignedStruct,
    ) -> Result<
        tokio_rustls::rustls::client::danger::HandshakeSignatureValid,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<tokio_rustls::rustls::SignatureScheme> {
        use tokio_rustls::rustls::SignatureScheme;
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
