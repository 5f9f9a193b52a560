//! Upstream forwarding
//! Opens one HTTP/1.1 connection per forwarded request, optionally over TLS,
//! and splices the two sides together for protocol upgrades

use crate::config::{ConnectOptions, Protocol};
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Body;
use hyper::header::{HeaderName, HeaderValue, CONNECTION, HOST, UPGRADE, VIA};
use hyper::{HeaderMap, Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::TokioIo;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, error};

/// Response body type shared by the router and the server
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const FORWARDED: HeaderName = HeaderName::from_static("forwarded");

const HOP_BY_HOP: [&str; 7] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
];

/// Errors while reaching or talking to an upstream
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("failed to connect to upstream {authority}: {source}")]
    Connect {
        authority: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS handshake with upstream {authority} failed: {source}")]
    Tls {
        authority: String,
        #[source]
        source: std::io::Error,
    },

    #[error("upstream {authority} timed out after {after:?}")]
    Timeout { authority: String, after: Duration },

    #[error("upstream {authority} HTTP error: {source}")]
    Http {
        authority: String,
        #[source]
        source: hyper::Error,
    },

    #[error("invalid upstream path `{0}`")]
    InvalidPath(String),
}

impl ForwardError {
    /// Status the host should answer with
    pub fn status(&self) -> StatusCode {
        match self {
            ForwardError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

/// Errors building an upstream's TLS client at load time
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("invalid TLS server name `{0}`")]
    ServerName(String),

    #[error("no PEM certificates found in the `{0}` option")]
    EmptyPem(&'static str),

    #[error("no private key found in the `key` option")]
    MissingKey,

    #[error("`cert` and `key` must be given together")]
    PartialClientAuth,

    #[error("failed to read PEM data: {0}")]
    Pem(#[from] std::io::Error),

    #[error(transparent)]
    Rustls(#[from] rustls::Error),
}

/// The client side of a proxied connection
#[derive(Debug, Clone, Copy)]
pub struct Peer {
    pub remote_addr: SocketAddr,
    /// Whether the client reached us over TLS
    pub secure: bool,
}

impl Peer {
    pub fn proto(&self) -> &'static str {
        if self.secure {
            "https"
        } else {
            "http"
        }
    }
}

trait UpstreamIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> UpstreamIo for T {}

struct UpstreamTls {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

/// A resolved forwarding target. TLS configuration is built once here, not
/// per request.
pub struct Upstream {
    options: ConnectOptions,
    tls: Option<UpstreamTls>,
}

impl std::fmt::Debug for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upstream")
            .field("options", &self.options)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

impl Upstream {
    pub fn new(options: ConnectOptions) -> Result<Self, UpstreamError> {
        let tls = match options.protocol {
            Protocol::Http => None,
            Protocol::Https => Some(Self::tls_client(&options)?),
        };
        Ok(Self { options, tls })
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }

    pub fn authority(&self) -> String {
        self.options.authority()
    }

    fn tls_client(options: &ConnectOptions) -> Result<UpstreamTls, UpstreamError> {
        let tls = &options.tls;
        let name = tls.servername.as_deref().unwrap_or(&options.hostname);
        let server_name = ServerName::try_from(name)
            .map_err(|_| UpstreamError::ServerName(name.to_string()))?
            .to_owned();

        let builder = if tls.reject_unauthorized {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            if let Some(ca) = &tls.ca {
                for cert in parse_certs(ca, "ca")? {
                    roots.add(cert)?;
                }
            }
            ClientConfig::builder().with_root_certificates(roots)
        } else {
            let algorithms = rustls::crypto::ring::default_provider().signature_verification_algorithms;
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { algorithms }))
        };

        let mut config = match (&tls.cert, &tls.key) {
            (Some(cert), Some(key)) => {
                let chain = parse_certs(cert, "cert")?;
                let key = rustls_pemfile::private_key(&mut key.as_bytes())?
                    .ok_or(UpstreamError::MissingKey)?;
                builder.with_client_auth_cert(chain, key)?
            }
            (None, None) => builder.with_no_client_auth(),
            _ => return Err(UpstreamError::PartialClientAuth),
        };
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(UpstreamTls {
            connector: TlsConnector::from(Arc::new(config)),
            server_name,
        })
    }

    async fn connect(&self) -> Result<Box<dyn UpstreamIo>, ForwardError> {
        let authority = self.authority();
        let connect = async {
            let tcp = TcpStream::connect((self.options.hostname.as_str(), self.options.port()))
                .await
                .map_err(|source| ForwardError::Connect {
                    authority: authority.clone(),
                    source,
                })?;
            let _ = tcp.set_nodelay(true);

            match &self.tls {
                None => Ok(Box::new(tcp) as Box<dyn UpstreamIo>),
                Some(tls) => {
                    let stream = tls
                        .connector
                        .connect(tls.server_name.clone(), tcp)
                        .await
                        .map_err(|source| ForwardError::Tls {
                            authority: authority.clone(),
                            source,
                        })?;
                    Ok(Box::new(stream) as Box<dyn UpstreamIo>)
                }
            }
        };
        within(self.options.timeout, &authority, connect).await
    }

    /// Path and query sent upstream: the configured `path`, or the request's
    /// own path and query.
    fn upstream_uri(&self, original: &Uri) -> Result<Uri, ForwardError> {
        let path = match &self.options.path {
            Some(path) => path.as_str(),
            None => original.path_and_query().map(|pq| pq.as_str()).unwrap_or("/"),
        };
        path.parse()
            .map_err(|_| ForwardError::InvalidPath(path.to_string()))
    }

    /// Forward a plain request and return the upstream's response. Upgrade
    /// headers are never passed on.
    pub async fn forward<B>(&self, req: Request<B>, peer: &Peer) -> Result<Response<ProxyBody>, ForwardError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let authority = self.authority();
        let (mut parts, body) = req.into_parts();
        let version = parts.version;

        strip_hop_by_hop(&mut parts.headers);
        self.shape_request(&mut parts.headers, &parts.uri, version, peer);
        parts.uri = self.upstream_uri(&parts.uri)?;
        parts.version = Version::HTTP_11;

        debug!("Proxying {} {} to {}", parts.method, parts.uri, authority);

        let stream = self.connect().await?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|source| ForwardError::Http {
                authority: authority.clone(),
                source,
            })?;

        let conn_authority = authority.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Upstream connection {} closed: {}", conn_authority, e);
            }
        });

        let send = async {
            sender
                .send_request(Request::from_parts(parts, body))
                .await
                .map_err(|source| ForwardError::Http {
                    authority: authority.clone(),
                    source,
                })
        };
        let response = within(self.options.proxy_timeout, &authority, send).await?;

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        self.add_via(&mut parts.headers, version);
        Ok(Response::from_parts(parts, body.boxed()))
    }

    /// Forward an upgrade request. On `101 Switching Protocols` the client
    /// and upstream connections are spliced in a background task; any other
    /// upstream answer is relayed to the client unchanged.
    pub async fn forward_upgrade<B>(
        &self,
        mut req: Request<B>,
        peer: &Peer,
    ) -> Result<Response<ProxyBody>, ForwardError>
    where
        B: Send + 'static,
    {
        let authority = self.authority();
        let client_upgrade = hyper::upgrade::on(&mut req);
        let (mut parts, _body) = req.into_parts();
        let version = parts.version;
        let protocol = parts.headers.get(UPGRADE).cloned();

        strip_hop_by_hop(&mut parts.headers);
        self.shape_request(&mut parts.headers, &parts.uri, version, peer);
        parts.uri = self.upstream_uri(&parts.uri)?;
        parts.headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
        if let Some(protocol) = protocol {
            parts.headers.insert(UPGRADE, protocol);
        }
        parts.version = Version::HTTP_11;

        debug!("Proxying upgrade {} to {}", parts.uri, authority);

        let stream = self.connect().await?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|source| ForwardError::Http {
                authority: authority.clone(),
                source,
            })?;

        let conn_authority = authority.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!("Upstream connection {} closed: {}", conn_authority, e);
            }
        });

        let upstream_req = Request::from_parts(parts, Empty::<Bytes>::new());
        let send = async {
            sender
                .send_request(upstream_req)
                .await
                .map_err(|source| ForwardError::Http {
                    authority: authority.clone(),
                    source,
                })
        };
        let mut response = within(self.options.proxy_timeout, &authority, send).await?;

        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            debug!("Upstream {} declined upgrade with {}", authority, response.status());
            let (mut parts, body) = response.into_parts();
            strip_hop_by_hop(&mut parts.headers);
            self.add_via(&mut parts.headers, version);
            return Ok(Response::from_parts(parts, body.boxed()));
        }

        let upstream_upgrade = hyper::upgrade::on(&mut response);
        let tunnel_authority = authority.clone();
        tokio::spawn(async move {
            match tokio::try_join!(client_upgrade, upstream_upgrade) {
                Ok((client, upstream)) => {
                    let mut client = TokioIo::new(client);
                    let mut upstream = TokioIo::new(upstream);
                    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
                        Ok((sent, received)) => debug!(
                            "Tunnel to {} closed ({} bytes up, {} bytes down)",
                            tunnel_authority, sent, received
                        ),
                        Err(e) => debug!("Tunnel to {} closed: {}", tunnel_authority, e),
                    }
                }
                Err(e) => error!("Upgrade to {} failed: {}", tunnel_authority, e),
            }
        });

        let mut switching = Response::new(empty_body());
        *switching.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        *switching.headers_mut() = response.headers().clone();
        self.add_via(switching.headers_mut(), version);
        Ok(switching)
    }

    fn shape_request(&self, headers: &mut HeaderMap, uri: &Uri, version: Version, peer: &Peer) {
        let host = headers
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string)
            .or_else(|| uri.authority().map(|a| a.to_string()));

        // HTTP/2 clients send :authority instead of Host
        if !headers.contains_key(HOST) {
            let value = host.clone().unwrap_or_else(|| self.authority());
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.insert(HOST, value);
            }
        }

        set_forwarded(headers, peer, host.as_deref());
        self.add_via(headers, version);
    }

    fn add_via(&self, headers: &mut HeaderMap, version: Version) {
        let Some(name) = &self.options.proxy_name else {
            return;
        };
        let entry = format!("{} {}", version_label(version), name);
        let value = match headers.get(VIA).and_then(|v| v.to_str().ok()) {
            Some(prior) => format!("{}, {}", prior, entry),
            None => entry,
        };
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(VIA, value);
        }
    }
}

async fn within<T, F>(limit: Option<Duration>, authority: &str, fut: F) -> Result<T, ForwardError>
where
    F: Future<Output = Result<T, ForwardError>>,
{
    match limit {
        Some(after) => tokio::time::timeout(after, fut)
            .await
            .map_err(|_| ForwardError::Timeout {
                authority: authority.to_string(),
                after,
            })?,
        None => fut.await,
    }
}

fn parse_certs(pem: &str, option: &'static str) -> Result<Vec<CertificateDer<'static>>, UpstreamError> {
    let certs = rustls_pemfile::certs(&mut pem.as_bytes()).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(UpstreamError::EmptyPem(option));
    }
    Ok(certs)
}

fn version_label(version: Version) -> &'static str {
    match version {
        Version::HTTP_10 => "1.0",
        Version::HTTP_2 => "2.0",
        Version::HTTP_3 => "3.0",
        _ => "1.1",
    }
}

/// Remove hop-by-hop headers, including any named in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    for name in &listed {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

fn set_forwarded(headers: &mut HeaderMap, peer: &Peer, host: Option<&str>) {
    let ip = peer.remote_addr.ip();
    let ip_text = ip.to_string();

    let xff = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) => format!("{}, {}", prior, ip_text),
        None => ip_text.clone(),
    };
    if let Ok(value) = HeaderValue::from_str(&xff) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(peer.proto()));

    let node = if ip.is_ipv6() {
        format!("\"[{}]\"", ip_text)
    } else {
        ip_text
    };
    let mut forwarded = format!("for={};proto={}", node, peer.proto());

    if let Some(host) = host {
        if let Ok(value) = HeaderValue::from_str(host) {
            headers.insert(X_FORWARDED_HOST, value);
        }
        forwarded.push_str(&format!(";host={}", host));
    }
    if let Ok(value) = HeaderValue::from_str(&forwarded) {
        headers.insert(FORWARDED, value);
    }
}

/// Plain-text response body
pub fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

/// Certificate verifier for `rejectUnauthorized: false`: any server
/// certificate is accepted, handshake signatures are still checked.
#[derive(Debug)]
struct AcceptAnyServerCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
