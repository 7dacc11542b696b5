//! Root certificate thumbprints for OIDC issuers
//!
//! IAM pins an OIDC provider to the SHA-1 fingerprint of the root of the TLS
//! chain serving the issuer's JWKS. Resolving it takes three steps:
//!
//! 1. Fetch `{issuer}/.well-known/openid-configuration` and read `jwks_uri`
//! 2. Complete a TLS handshake with the `jwks_uri` host and capture its chain
//! 3. Walk the chain from the leaf towards its root and fingerprint the last
//!    certificate reached
//!
//! The walk follows issuer → subject links through the presented certificates
//! and then through the trust anchors: an optional configured bundle followed
//! by the platform root store. Servers usually omit their root, which the
//! anchors then supply. The walk stops at a self-issued certificate; if an
//! issuer is found nowhere, the topmost certificate reached is used.

mod tls;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_lc_rs::digest::{digest, SHA1_FOR_LEGACY_USE_ONLY};
use rustls::pki_types::CertificateDer;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use x509_parser::prelude::*;

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result};

pub use tls::{capture_peer_chain, ChainCaptureVerifier};

/// Default port for the TLS handshake when `jwks_uri` names none
pub const DEFAULT_TLS_PORT: u16 = 443;

/// Path of the OIDC discovery document relative to the issuer
pub const DISCOVERY_PATH: &str = "/.well-known/openid-configuration";

/// SHA-1 fingerprint of a certificate: 40 uppercase hex characters, no separators
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Thumbprint(String);

impl Thumbprint {
    /// Length of a thumbprint in hex characters
    pub const LEN: usize = 40;

    /// Fingerprint a DER-encoded certificate
    pub fn of_der(der: &[u8]) -> Self {
        let hash = digest(&SHA1_FOR_LEGACY_USE_ONLY, der);
        Self(hex::encode_upper(hash.as_ref()))
    }

    /// Parse a fingerprint, accepting colon separators and either case
    pub fn parse(s: &str) -> Result<Self> {
        let stripped: String = s.chars().filter(|c| *c != ':').collect();
        if stripped.len() != Self::LEN || !stripped.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::certificate(format!(
                "thumbprint must be {} hex characters: {}",
                Self::LEN,
                s
            )));
        }
        Ok(Self(stripped.to_ascii_uppercase()))
    }

    /// The thumbprint as a hex string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Thumbprint {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<Thumbprint> for String {
    fn from(t: Thumbprint) -> Self {
        t.0
    }
}

impl fmt::Display for Thumbprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One certificate reduced to what the chain walk needs
#[derive(Clone)]
struct ChainLink {
    subject: Vec<u8>,
    issuer: Vec<u8>,
    thumbprint: Thumbprint,
}

impl ChainLink {
    fn parse(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| Error::certificate(format!("failed to parse certificate: {}", e)))?;
        Ok(Self {
            subject: cert.subject().as_raw().to_vec(),
            issuer: cert.issuer().as_raw().to_vec(),
            thumbprint: Thumbprint::of_der(der),
        })
    }

    fn is_self_issued(&self) -> bool {
        self.subject == self.issuer
    }
}

/// Fingerprint of the root of a presented certificate chain.
///
/// `chain` is leaf first, as presented by the server. `anchors` are trusted
/// certificates (roots the server omits) the walk may follow once the
/// presented certificates run out; earlier anchors win when several share a
/// subject. Anchors that fail to parse are skipped, while a malformed
/// presented certificate is an error.
pub fn root_thumbprint(
    chain: &[CertificateDer<'_>],
    anchors: &[CertificateDer<'_>],
) -> Result<Thumbprint> {
    let (leaf, rest) = chain
        .split_first()
        .ok_or_else(|| Error::certificate("peer presented no certificates"))?;

    let mut current = ChainLink::parse(leaf)?;
    let mut pool = rest
        .iter()
        .map(|der| ChainLink::parse(der))
        .collect::<Result<Vec<_>>>()?;
    pool.extend(anchors.iter().filter_map(|der| ChainLink::parse(der).ok()));

    let mut visited = vec![current.thumbprint.clone()];
    while !current.is_self_issued() {
        let next = pool
            .iter()
            .find(|link| link.subject == current.issuer && !visited.contains(&link.thumbprint));
        let Some(next) = next else {
            warn!(
                thumbprint = %current.thumbprint,
                "Issuer not found in presented chain or trust anchors, using topmost certificate"
            );
            break;
        };
        visited.push(next.thumbprint.clone());
        current = next.clone();
    }

    debug!(depth = visited.len(), "Walked certificate chain");
    Ok(current.thumbprint)
}

/// Parse every `CERTIFICATE` block of a PEM bundle
pub fn parse_trust_bundle(pem_text: &str) -> Result<Vec<CertificateDer<'static>>> {
    let blocks = ::pem::parse_many(pem_text.as_bytes())
        .map_err(|e| Error::certificate(format!("failed to parse PEM bundle: {}", e)))?;
    Ok(blocks
        .into_iter()
        .filter(|block| block.tag() == "CERTIFICATE")
        .map(|block| CertificateDer::from(block.into_contents()))
        .collect())
}

/// Load the platform's root certificates
///
/// Individual certificates that cannot be read are logged and skipped; an
/// unavailable store yields an empty list.
pub fn system_roots() -> Vec<CertificateDer<'static>> {
    let loaded = rustls_native_certs::load_native_certs();
    for e in &loaded.errors {
        warn!(error = %e, "Failed to load part of the system root store");
    }
    debug!(certificates = loaded.certs.len(), "Loaded system root store");
    loaded.certs
}

/// Host and port of the TLS handshake for a `jwks_uri`
///
/// The handshake is always TLS, so a missing port means 443 whatever the
/// URI's scheme.
pub fn tls_endpoint(jwks_uri: &reqwest::Url) -> Option<(String, u16)> {
    let host = jwks_uri
        .host_str()?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    Some((host, jwks_uri.port().unwrap_or(DEFAULT_TLS_PORT)))
}

/// Discovery document fields used here
#[derive(Debug, Deserialize)]
struct OidcDiscovery {
    jwks_uri: String,
}

/// URL of the discovery document for an issuer
pub fn discovery_url(issuer: &str) -> String {
    format!("{}{}", issuer.trim_end_matches('/'), DISCOVERY_PATH)
}

/// Trait for resolving an issuer's root certificate thumbprint
///
/// Allows the workflow to be tested without network access.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ThumbprintResolver: Send + Sync {
    /// Resolve the root certificate thumbprint for the given issuer URL
    async fn resolve_root_thumbprint(&self, issuer: &str) -> Result<Thumbprint>;
}

/// Resolver using OIDC discovery over HTTPS and a raw TLS handshake
///
/// Chain walks are completed from the configured trust bundle and then from
/// the system root store, which is loaded once at construction.
#[derive(Clone, Debug)]
pub struct TlsThumbprintResolver {
    http: reqwest::Client,
    tls_timeout: Duration,
    trust_bundle: Arc<Vec<CertificateDer<'static>>>,
    system_roots: Arc<Vec<CertificateDer<'static>>>,
}

impl TlsThumbprintResolver {
    /// Create a resolver with the given HTTP and TLS handshake timeouts
    pub fn new(http_timeout: Duration, tls_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(http_timeout)
            .build()
            .map_err(|e| Error::config(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self::with_client(http, tls_timeout))
    }

    /// Create a resolver with a custom HTTP client
    pub fn with_client(http: reqwest::Client, tls_timeout: Duration) -> Self {
        Self {
            http,
            tls_timeout,
            trust_bundle: Arc::new(Vec::new()),
            system_roots: Arc::new(system_roots()),
        }
    }

    /// Consult extra roots before the system root store
    pub fn with_trust_bundle(mut self, certs: Vec<CertificateDer<'static>>) -> Self {
        self.trust_bundle = Arc::new(certs);
        self
    }

    /// Complete chain walks from the trust bundle only
    pub fn without_system_roots(mut self) -> Self {
        self.system_roots = Arc::new(Vec::new());
        self
    }

    /// Trust anchors in lookup order: the trust bundle, then system roots
    pub fn anchors(&self) -> Vec<CertificateDer<'static>> {
        self.trust_bundle
            .iter()
            .chain(self.system_roots.iter())
            .cloned()
            .collect()
    }

    /// Fetch the issuer's discovery document and return its `jwks_uri`
    pub async fn jwks_uri(&self, issuer: &str) -> Result<reqwest::Url> {
        let url = discovery_url(issuer);
        debug!(url = %url, "Fetching OIDC discovery document");

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::discovery(issuer, format!("request failed: {}", e)))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(Error::discovery(
                issuer,
                format!("request returned {}", status.as_u16()),
            ));
        }

        let body = response
            .text()
            .await
            .map_err(|e| Error::discovery(issuer, format!("failed to read body: {}", e)))?;
        let discovery: OidcDiscovery = serde_json::from_str(&body)
            .map_err(|e| Error::discovery(issuer, format!("invalid discovery document: {}", e)))?;

        reqwest::Url::parse(&discovery.jwks_uri).map_err(|e| {
            Error::discovery(
                issuer,
                format!("invalid jwks_uri {}: {}", discovery.jwks_uri, e),
            )
        })
    }

    /// Capture the TLS chain served at the given host and port
    pub async fn peer_chain(&self, host: &str, port: u16) -> Result<Vec<CertificateDer<'static>>> {
        let target = host.to_string();
        let timeout = self.tls_timeout;
        tokio::task::spawn_blocking(move || capture_peer_chain(&target, port, timeout))
            .await
            .map_err(|e| Error::connection(host, format!("TLS handshake task failed: {}", e)))?
    }
}

#[async_trait]
impl ThumbprintResolver for TlsThumbprintResolver {
    async fn resolve_root_thumbprint(&self, issuer: &str) -> Result<Thumbprint> {
        let jwks_uri = self.jwks_uri(issuer).await?;
        let (host, port) = tls_endpoint(&jwks_uri)
            .ok_or_else(|| Error::discovery(issuer, format!("jwks_uri {} has no host", jwks_uri)))?;

        let chain = self.peer_chain(&host, port).await?;
        let thumbprint = root_thumbprint(&chain, &self.anchors())?;

        info!(
            issuer = %issuer,
            jwks_host = %host,
            thumbprint = %thumbprint,
            "Resolved root CA thumbprint"
        );
        Ok(thumbprint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{
        BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, DnValue,
        IsCa, Issuer, KeyPair,
    };
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn params(common_name: &str, ca: bool) -> CertificateParams {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String(common_name.to_string()));
        params.distinguished_name = dn;
        if ca {
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        }
        params
    }

    fn self_signed(common_name: &str) -> (Certificate, KeyPair) {
        let key = KeyPair::generate().unwrap();
        let cert = params(common_name, true).self_signed(&key).unwrap();
        (cert, key)
    }

    fn signed_by(
        common_name: &str,
        ca: bool,
        parent: &Certificate,
        parent_key: &KeyPair,
    ) -> (Certificate, KeyPair) {
        let key = KeyPair::generate().unwrap();
        let issuer = Issuer::from_ca_cert_pem(&parent.pem(), parent_key).unwrap();
        let cert = params(common_name, ca).signed_by(&key, &issuer).unwrap();
        (cert, key)
    }

    /// Build a chain of `len` certificates, leaf first, ending in a self-signed root
    fn chain_of(len: usize) -> Vec<CertificateDer<'static>> {
        let (root, root_key) = self_signed("Test Root CA");
        let mut chain = vec![root.der().clone()];
        let (mut parent, mut parent_key) = (root, root_key);
        for depth in 1..len {
            let is_leaf = depth == len - 1;
            let (cert, key) = signed_by(&format!("link-{}", depth), !is_leaf, &parent, &parent_key);
            chain.push(cert.der().clone());
            parent = cert;
            parent_key = key;
        }
        chain.reverse();
        chain
    }

    // ==========================================================================
    // Story: Thumbprint format
    // ==========================================================================

    #[test]
    fn thumbprint_is_40_uppercase_hex() {
        let t = Thumbprint::of_der(b"not really a certificate");
        assert_eq!(t.as_str().len(), Thumbprint::LEN);
        assert!(t
            .as_str()
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
    }

    #[test]
    fn colon_separated_fingerprints_are_normalized() {
        let colon = "9e:99:a4:8a:99:60:b1:49:26:bb:7f:3b:02:e2:2d:a2:b0:ab:72:80";
        let t = Thumbprint::parse(colon).unwrap();
        assert_eq!(t.as_str(), "9E99A48A9960B14926BB7F3B02E22DA2B0AB7280");
    }

    #[test]
    fn wrong_length_thumbprints_are_rejected() {
        assert!(Thumbprint::parse("ABCD").is_err());
        assert!(Thumbprint::parse(&"Z".repeat(40)).is_err());
    }

    // ==========================================================================
    // Story: Chain walk
    //
    // Whatever the chain length, the resolver returns the fingerprint of the
    // final self-issued certificate.
    // ==========================================================================

    #[test]
    fn chain_walk_returns_root_for_every_length() {
        for len in 1..=4 {
            let chain = chain_of(len);
            let root = chain.last().unwrap();
            let thumbprint = root_thumbprint(&chain, &[]).unwrap();
            assert_eq!(thumbprint, Thumbprint::of_der(root), "chain length {len}");
        }
    }

    #[test]
    fn self_signed_leaf_returns_its_own_fingerprint() {
        let (cert, _) = self_signed("lonely.example.com");
        let chain = vec![cert.der().clone()];
        assert_eq!(
            root_thumbprint(&chain, &[]).unwrap(),
            Thumbprint::of_der(cert.der())
        );
    }

    #[test]
    fn chain_walk_is_deterministic() {
        let chain = chain_of(3);
        let first = root_thumbprint(&chain, &[]).unwrap();
        let second = root_thumbprint(&chain, &[]).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn omitted_root_is_completed_from_anchors() {
        let mut chain = chain_of(3);
        let root = chain.pop().unwrap();
        let (unrelated, _) = self_signed("Unrelated Root CA");

        let anchors = vec![unrelated.der().clone(), root.clone()];
        assert_eq!(
            root_thumbprint(&chain, &anchors).unwrap(),
            Thumbprint::of_der(&root)
        );
    }

    #[test]
    fn omitted_root_is_completed_from_the_default_resolver_anchors() {
        let mut chain = chain_of(3);
        let root = chain.pop().unwrap();

        let anchors = resolver().with_trust_bundle(vec![root.clone()]).anchors();
        assert_eq!(
            root_thumbprint(&chain, &anchors).unwrap(),
            Thumbprint::of_der(&root)
        );
    }

    #[test]
    fn unparseable_anchors_are_skipped() {
        let mut chain = chain_of(2);
        let root = chain.pop().unwrap();

        let anchors = vec![CertificateDer::from(vec![0u8, 1, 2, 3]), root.clone()];
        assert_eq!(
            root_thumbprint(&chain, &anchors).unwrap(),
            Thumbprint::of_der(&root)
        );
    }

    #[test]
    fn issuer_found_nowhere_falls_back_to_topmost_certificate() {
        let mut chain = chain_of(3);
        chain.pop();
        let intermediate = chain.last().unwrap().clone();

        assert_eq!(
            root_thumbprint(&chain, &[]).unwrap(),
            Thumbprint::of_der(&intermediate)
        );
    }

    #[test]
    fn out_of_order_intermediates_are_followed() {
        let chain = chain_of(4);
        let root = chain[3].clone();
        let shuffled = vec![chain[0].clone(), chain[3].clone(), chain[2].clone(), chain[1].clone()];
        assert_eq!(
            root_thumbprint(&shuffled, &[]).unwrap(),
            Thumbprint::of_der(&root)
        );
    }

    #[test]
    fn empty_chain_is_a_certificate_error() {
        assert!(matches!(
            root_thumbprint(&[], &[]),
            Err(Error::Certificate(_))
        ));
    }

    #[test]
    fn garbage_der_is_a_certificate_error() {
        let chain = vec![CertificateDer::from(vec![0u8, 1, 2, 3])];
        assert!(matches!(
            root_thumbprint(&chain, &[]),
            Err(Error::Certificate(_))
        ));
    }

    // ==========================================================================
    // Story: Trust anchors of the resolver
    //
    // The system root store is consulted by default; a configured bundle is
    // an addition that is searched first.
    // ==========================================================================

    #[test]
    fn resolver_seeds_anchors_with_system_roots() {
        let roots = system_roots();
        assert_eq!(resolver().anchors(), roots);

        let (extra, _) = self_signed("Bundle Root");
        let anchors = resolver()
            .with_trust_bundle(vec![extra.der().clone()])
            .anchors();
        assert_eq!(anchors.len(), roots.len() + 1);
        assert_eq!(anchors[0].as_ref(), extra.der().as_ref());
        assert_eq!(&anchors[1..], &roots[..]);
    }

    #[test]
    fn system_roots_can_be_left_out() {
        let (extra, _) = self_signed("Bundle Root");
        let anchors = resolver()
            .without_system_roots()
            .with_trust_bundle(vec![extra.der().clone()])
            .anchors();
        assert_eq!(anchors, vec![extra.der().clone()]);
    }

    #[test]
    fn trust_bundle_keeps_only_certificates() {
        let (cert, key) = self_signed("Bundle Root");
        let bundle = format!("{}{}", cert.pem(), key.serialize_pem());
        let parsed = parse_trust_bundle(&bundle).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].as_ref(), cert.der().as_ref());
    }

    // ==========================================================================
    // Story: OIDC discovery
    // ==========================================================================

    fn resolver() -> TlsThumbprintResolver {
        TlsThumbprintResolver::new(Duration::from_secs(5), Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn discovery_url_trims_trailing_slash() {
        assert_eq!(
            discovery_url("https://oidc.example.com/id/1/"),
            "https://oidc.example.com/id/1/.well-known/openid-configuration"
        );
        assert_eq!(
            discovery_url("https://oidc.example.com/id/1"),
            "https://oidc.example.com/id/1/.well-known/openid-configuration"
        );
    }

    #[tokio::test]
    async fn jwks_uri_is_read_from_discovery() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/id/1/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "issuer": format!("{}/id/1", server.uri()),
                "jwks_uri": "https://keys.example.com:8443/id/1/keys",
            })))
            .mount(&server)
            .await;

        let uri = resolver()
            .jwks_uri(&format!("{}/id/1", server.uri()))
            .await
            .unwrap();
        assert_eq!(uri.host_str(), Some("keys.example.com"));
        assert_eq!(uri.port_or_known_default(), Some(8443));
    }

    #[test]
    fn tls_port_defaults_to_443_for_any_scheme() {
        let http = reqwest::Url::parse("http://127.0.0.1/keys").unwrap();
        assert_eq!(tls_endpoint(&http), Some(("127.0.0.1".to_string(), 443)));

        let https = reqwest::Url::parse("https://oidc.example.com/keys").unwrap();
        assert_eq!(tls_endpoint(&https), Some(("oidc.example.com".to_string(), 443)));

        let explicit = reqwest::Url::parse("http://[::1]:8443/keys").unwrap();
        assert_eq!(tls_endpoint(&explicit), Some(("::1".to_string(), 8443)));
    }

    #[tokio::test]
    async fn http_jwks_uri_without_port_connects_on_443() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jwks_uri": "http://127.0.0.1/keys",
            })))
            .mount(&server)
            .await;

        let result = TlsThumbprintResolver::new(Duration::from_secs(5), Duration::from_millis(500))
            .unwrap()
            .resolve_root_thumbprint(&server.uri())
            .await;
        match result {
            Err(Error::Connection { host, .. }) => assert_eq!(host, "127.0.0.1:443"),
            other => panic!("expected a connection to 127.0.0.1:443, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_200_discovery_is_a_discovery_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = resolver().jwks_uri(&server.uri()).await.unwrap_err();
        match err {
            Error::Discovery { message, .. } => assert!(message.contains("404")),
            other => panic!("expected Discovery error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_discovery_is_a_discovery_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;

        let err = resolver().jwks_uri(&server.uri()).await.unwrap_err();
        assert!(matches!(err, Error::Discovery { .. }));
    }

    #[tokio::test]
    async fn discovery_without_jwks_uri_is_a_discovery_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "issuer": "https://oidc.example.com" })),
            )
            .mount(&server)
            .await;

        let err = resolver().jwks_uri(&server.uri()).await.unwrap_err();
        match err {
            Error::Discovery { message, .. } => assert!(message.contains("jwks_uri")),
            other => panic!("expected Discovery error, got {other:?}"),
        }
    }
}
