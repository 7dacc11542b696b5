//! Raw TLS handshake that captures a server's certificate chain
//!
//! The handshake only cares about which certificates the server presents, not who
//! the server is: the JWKS host rarely matches the names on its certificate,
//! so hostname and chain verification are skipped. Handshake signatures are
//! still verified so the captured chain belongs to the key that completed the
//! handshake.

use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, SignatureScheme};
use tracing::debug;

use crate::{Error, Result};

/// Server certificate verifier that accepts any presented chain.
///
/// # Security Considerations
///
/// Only used to read the chain for fingerprinting. Nothing is sent over a
/// connection established with this verifier.
#[derive(Debug)]
pub struct ChainCaptureVerifier {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ChainCaptureVerifier {
    /// Create a verifier checking handshake signatures with the given algorithms
    pub fn new(algorithms: WebPkiSupportedAlgorithms) -> Self {
        Self { algorithms }
    }
}

impl ServerCertVerifier for ChainCaptureVerifier {
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
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Build a client config that captures chains without verifying them
fn capture_config() -> std::result::Result<ClientConfig, rustls::Error> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let verifier = ChainCaptureVerifier::new(provider.signature_verification_algorithms);

    Ok(ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth())
}

/// Connect to `host:port`, complete a TLS handshake, and return the chain the
/// server presented, leaf first.
///
/// Blocking. Connect, read and write are each bounded by `timeout`. The socket
/// is owned by this function and closed on every return path.
pub fn capture_peer_chain(
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<Vec<CertificateDer<'static>>> {
    let conn_err = |msg: String| Error::connection(format!("{}:{}", host, port), msg);

    let config = capture_config().map_err(|e| conn_err(format!("TLS config: {}", e)))?;
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| conn_err(format!("invalid server name: {}", e)))?;
    let mut conn = ClientConnection::new(Arc::new(config), server_name)
        .map_err(|e| conn_err(format!("TLS session: {}", e)))?;

    let addr = (host, port)
        .to_socket_addrs()
        .map_err(|e| conn_err(format!("resolve failed: {}", e)))?
        .next()
        .ok_or_else(|| conn_err("host resolved to no addresses".to_string()))?;

    let mut sock = TcpStream::connect_timeout(&addr, timeout)
        .map_err(|e| conn_err(format!("connect failed: {}", e)))?;
    sock.set_read_timeout(Some(timeout))
        .and_then(|_| sock.set_write_timeout(Some(timeout)))
        .map_err(|e| conn_err(format!("socket setup failed: {}", e)))?;

    while conn.is_handshaking() {
        conn.complete_io(&mut sock)
            .map_err(|e| conn_err(format!("handshake failed: {}", describe_io(&e))))?;
    }

    let chain: Vec<CertificateDer<'static>> = conn
        .peer_certificates()
        .map(|certs| certs.iter().map(|c| c.clone().into_owned()).collect())
        .unwrap_or_default();

    debug!(host = %host, port = port, certificates = chain.len(), "Captured peer chain");

    // Best effort; the socket is dropped either way.
    conn.send_close_notify();
    let _ = conn.complete_io(&mut sock);

    Ok(chain)
}

fn describe_io(err: &io::Error) -> String {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => "timed out".to_string(),
        _ => err.to_string(),
    }
}
