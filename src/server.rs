//! Development server hosting the plugin
//! Serves HTTP/1.1 and, with TLS material, HTTPS with HTTP/2

use crate::certificate::CertificateMaterial;
use crate::forward::{empty_body, full_body, ForwardError, Peer, ProxyBody};
use crate::router::{is_upgrade_request, Dispatch, ProxyRouter};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

/// Dev server configuration
#[derive(Debug, Clone)]
pub struct DevServerConfig {
    pub host: IpAddr,
    pub port: u16,
}

impl Default for DevServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 5173,
        }
    }
}

impl DevServerConfig {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

/// Next handler for requests the router passes through
#[async_trait]
pub trait Fallback: Send + Sync {
    async fn handle(&self, req: Request<Incoming>) -> Response<ProxyBody>;
}

/// Answers every request with 404
pub struct NotFound;

#[async_trait]
impl Fallback for NotFound {
    async fn handle(&self, _req: Request<Incoming>) -> Response<ProxyBody> {
        text_response(StatusCode::NOT_FOUND, "Not Found")
    }
}

/// Serves files below a root directory
pub struct StaticFiles {
    root: PathBuf,
}

impl StaticFiles {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Map a URL path onto the root, refusing anything that climbs out of it
    fn resolve(&self, url_path: &str) -> Option<PathBuf> {
        let relative = Path::new(url_path.trim_start_matches('/'));
        let mut path = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::CurDir => {}
                _ => return None,
            }
        }
        if url_path.ends_with('/') {
            path.push("index.html");
        }
        Some(path)
    }

    fn content_type(path: &Path) -> &'static str {
        match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
            "html" | "htm" => "text/html; charset=utf-8",
            "js" | "mjs" => "text/javascript; charset=utf-8",
            "css" => "text/css; charset=utf-8",
            "json" | "map" => "application/json",
            "svg" => "image/svg+xml",
            "png" => "image/png",
            "jpg" | "jpeg" => "image/jpeg",
            "gif" => "image/gif",
            "ico" => "image/x-icon",
            "wasm" => "application/wasm",
            "woff2" => "font/woff2",
            "txt" => "text/plain; charset=utf-8",
            _ => "application/octet-stream",
        }
    }
}

#[async_trait]
impl Fallback for StaticFiles {
    async fn handle(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let head = req.method() == Method::HEAD;
        if req.method() != Method::GET && !head {
            return text_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed");
        }

        let Some(mut path) = self.resolve(req.uri().path()) else {
            return text_response(StatusCode::NOT_FOUND, "Not Found");
        };
        if tokio::fs::metadata(&path).await.map(|m| m.is_dir()).unwrap_or(false) {
            path.push("index.html");
        }

        match tokio::fs::read(&path).await {
            Ok(contents) => {
                let body = if head { empty_body() } else { full_body(contents) };
                let mut response = Response::new(body);
                response.headers_mut().insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static(Self::content_type(&path)),
                );
                response
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                text_response(StatusCode::NOT_FOUND, "Not Found")
            }
            Err(e) => {
                error!("Failed to read {}: {}", path.display(), e);
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            }
        }
    }
}

/// Development server
pub struct DevServer {
    config: DevServerConfig,
    tls: Option<TlsAcceptor>,
    router: Option<Arc<ProxyRouter>>,
    fallback: Arc<dyn Fallback>,
}

impl DevServer {
    /// Create a new dev server. With `https` material the listener speaks TLS
    /// and offers `h2` and `http/1.1`.
    pub fn new(
        config: DevServerConfig,
        https: Option<&CertificateMaterial>,
        router: Option<Arc<ProxyRouter>>,
        fallback: Arc<dyn Fallback>,
    ) -> Result<Self> {
        let tls = https.map(tls_acceptor).transpose()?;
        Ok(Self {
            config,
            tls,
            router,
            fallback,
        })
    }

    pub fn is_https(&self) -> bool {
        self.tls.is_some()
    }

    /// Bind the configured address and serve until the listener fails
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let addr = self.config.addr();
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {}", addr))?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        let scheme = if self.is_https() { "https" } else { "http" };
        info!("Dev server listening on {}://{}", scheme, addr);

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let server = self.clone();

            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, remote_addr).await {
                    debug!("Connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, remote_addr: SocketAddr) -> Result<()> {
        let _ = stream.set_nodelay(true);
        match self.tls.clone() {
            Some(acceptor) => {
                let stream = acceptor
                    .accept(stream)
                    .await
                    .context("TLS handshake failed")?;
                let peer = Peer {
                    remote_addr,
                    secure: true,
                };
                self.serve_io(stream, peer).await
            }
            None => {
                let peer = Peer {
                    remote_addr,
                    secure: false,
                };
                self.serve_io(stream, peer).await
            }
        }
    }

    async fn serve_io<I>(self: Arc<Self>, io: I, peer: Peer) -> Result<()>
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let server = self;
        let service = service_fn(move |req| {
            let server = server.clone();
            async move { server.dispatch(req, peer).await }
        });

        auto::Builder::new(TokioExecutor::new())
            .serve_connection_with_upgrades(TokioIo::new(io), service)
            .await
            .map_err(|e| anyhow!("HTTP service error: {}", e))
    }

    /// Route one request: upgrades to the router's upgrade path, everything
    /// else through the proxy middleware, then the fallback.
    ///
    /// A failed upgrade is returned as an error, which makes hyper drop the
    /// client connection.
    async fn dispatch(self: Arc<Self>, req: Request<Incoming>, peer: Peer) -> Result<Response<ProxyBody>, ForwardError> {
        let req = match &self.router {
            Some(router) if is_upgrade_request(&req) => match router.handle_upgrade(req, &peer).await {
                Ok(Dispatch::Forwarded(response)) => return Ok(response),
                Ok(Dispatch::Next(req)) => req,
                Err(e) => {
                    error!("Upgrade proxy error for {}: {}", peer.remote_addr, e);
                    return Err(e);
                }
            },
            Some(router) => match router.handle(req, &peer).await {
                Ok(Dispatch::Forwarded(response)) => return Ok(response),
                Ok(Dispatch::Next(req)) => req,
                Err(e) => return Ok(Self::error_response(&e)),
            },
            None => req,
        };

        Ok(self.fallback.handle(req).await)
    }

    /// Render a forwarding failure for the client
    fn error_response(err: &ForwardError) -> Response<ProxyBody> {
        error!("Proxy error: {}", err);
        let status = err.status();
        let reason = status.canonical_reason().unwrap_or("Proxy Error");
        text_response(status, &format!("{}: {}", reason, err))
    }
}

/// Build the listener's TLS acceptor from PEM material
pub fn tls_acceptor(material: &CertificateMaterial) -> Result<TlsAcceptor> {
    let certs = rustls_pemfile::certs(&mut material.cert())
        .collect::<Result<Vec<_>, _>>()
        .context("invalid certificate PEM")?;
    if certs.is_empty() {
        return Err(anyhow!("no certificates found in TLS material"));
    }
    let key = rustls_pemfile::private_key(&mut material.key())
        .context("invalid private key PEM")?
        .ok_or_else(|| anyhow!("no private key found in TLS material"))?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("TLS material rejected")?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Create text response
fn text_response(status: StatusCode, body: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(body.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}
