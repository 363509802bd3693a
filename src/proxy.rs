//! Proxy server implementation
//! Routes requests by Host header and forwards mapped domains to their local backend

use crate::certificate::CertificateAuthority;
use crate::error::ProxyError;
use crate::mappings::{Mapping, MappingStore};
use anyhow::{anyhow, Context as _, Result};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_TYPE, HOST, LOCATION, UPGRADE,
};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use pin_project_lite::pin_project;
use serde::Serialize;
use std::convert::Infallible;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Response body type shared by every handler
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Idle window for connecting to a backend and for its response head
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Headers that describe a single hop and are never forwarded
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
];

/// Proxy server configuration
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub bind_addr: IpAddr,
    pub http_port: u16,
    pub https_port: u16,
    pub enable_https: bool,
    pub enable_websocket_proxy: bool,
    pub upstream_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            http_port: 80,
            https_port: 443,
            enable_https: false,
            enable_websocket_proxy: true,
            upstream_timeout: UPSTREAM_TIMEOUT,
        }
    }
}

/// Handler for requests the proxy does not forward (unmapped and dashboard hosts)
#[async_trait]
pub trait Fallback: Send + Sync {
    async fn handle(&self, req: Request<Incoming>) -> Response<ProxyBody>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Scheme {
    Http,
    Https,
}

impl Scheme {
    fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// Proxy server
pub struct ProxyServer {
    pub(crate) config: ProxyConfig,
    pub(crate) store: Arc<MappingStore>,
    pub(crate) ca: Arc<CertificateAuthority>,
    pub(crate) fallback: Arc<dyn Fallback>,
}

impl ProxyServer {
    /// Create a new proxy server
    pub fn new(
        config: ProxyConfig,
        store: Arc<MappingStore>,
        ca: Arc<CertificateAuthority>,
        fallback: Arc<dyn Fallback>,
    ) -> Self {
        Self {
            config,
            store,
            ca,
            fallback,
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Bind the configured listeners and serve until an unrecoverable error
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let http_addr = SocketAddr::new(self.config.bind_addr, self.config.http_port);
        let http = TcpListener::bind(http_addr)
            .await
            .with_context(|| format!("Failed to bind HTTP listener on {}", http_addr))?;

        if self.config.enable_https {
            let https_addr = SocketAddr::new(self.config.bind_addr, self.config.https_port);
            let https = TcpListener::bind(https_addr)
                .await
                .with_context(|| format!("Failed to bind HTTPS listener on {}", https_addr))?;

            tokio::try_join!(self.clone().serve_http(http), self.serve_https(https))?;
            Ok(())
        } else {
            self.serve_http(http).await
        }
    }

    /// Accept plaintext connections from `listener`
    pub async fn serve_http(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!("HTTP server listening on {}", listener.local_addr()?);

        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("HTTP accept error: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.serve_connection(stream, remote_addr, Scheme::Http).await {
                    debug!("HTTP connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    /// Serve HTTP/1.1 on an accepted (and possibly TLS-wrapped) stream
    pub(crate) async fn serve_connection<S>(
        self: Arc<Self>,
        stream: S,
        remote_addr: SocketAddr,
        scheme: Scheme,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);

        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(false)
            .serve_connection(
                io,
                service_fn(move |req| {
                    let server = self.clone();
                    async move { server.handle_request(req, remote_addr, scheme).await }
                }),
            )
            .with_upgrades()
            .await
            .map_err(|e| anyhow!("HTTP service error: {}", e))
    }

    /// Handle incoming request
    async fn handle_request(
        self: Arc<Self>,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
        scheme: Scheme,
    ) -> Result<Response<ProxyBody>, Infallible> {
        let host = req
            .headers()
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string);

        debug!(
            "{} {} {} from {} (host: {})",
            scheme.as_str(),
            req.method(),
            req.uri().path(),
            remote_addr,
            host.as_deref().unwrap_or("-")
        );

        let response = match scheme {
            Scheme::Http => self.route_http(req, host, remote_addr).await,
            Scheme::Https => self.route_https(req, host, remote_addr).await,
        };
        Ok(response)
    }

    /// Plaintext routing: mapped hosts are proxied or redirected, everything else
    /// goes to the fallback handler
    async fn route_http(
        &self,
        req: Request<Incoming>,
        host: Option<String>,
        remote_addr: SocketAddr,
    ) -> Response<ProxyBody> {
        let Some(host) = host else {
            return self.fallback.handle(req).await;
        };
        let Some(mapping) = self.store.find(&host) else {
            return self.fallback.handle(req).await;
        };

        let path_and_query = path_and_query(req.uri());

        if !mapping.proxy {
            let location = format!("http://{}:{}{}", host, mapping.port, path_and_query);
            debug!("Redirecting {} to {}", host, location);
            return redirect_response(StatusCode::FOUND, &location);
        }

        self.forward(req, &mapping, &host, remote_addr, Scheme::Http).await
    }

    /// TLS routing: mapped hosts are always proxied; dashboard hosts fall through
    pub(crate) async fn route_https(
        &self,
        req: Request<Incoming>,
        host: Option<String>,
        remote_addr: SocketAddr,
    ) -> Response<ProxyBody> {
        if let Some(host) = host {
            if let Some(mapping) = self.store.find(&host) {
                return self.forward(req, &mapping, &host, remote_addr, Scheme::Https).await;
            }
            if is_dashboard_host(&host) {
                return self.fallback.handle(req).await;
            }
        }

        text_response(
            StatusCode::NOT_FOUND,
            "LAM: no mapping for this host. Use http://localhost or https://localhost",
        )
    }

    /// Forward to the mapped backend, turning failures into error pages
    async fn forward(
        &self,
        req: Request<Incoming>,
        mapping: &Mapping,
        host: &str,
        remote_addr: SocketAddr,
        scheme: Scheme,
    ) -> Response<ProxyBody> {
        match self.proxy_request(req, mapping, host, remote_addr, scheme).await {
            Ok(response) => response,
            Err(e) if e.is_unreachable() => {
                warn!("Backend for {} not reachable: {}", host, e);
                unreachable_response(host, mapping.port)
            }
            Err(e) => {
                error!("Proxy error for {}: {}", host, e);
                proxy_error_response(host)
            }
        }
    }

    /// Proxy the request to backend
    ///
    /// The upstream connection task is owned by a [`ConnectionGuard`]: first by this
    /// future, then by the streamed response body (or the upgrade tunnel). Whichever
    /// holder is dropped when the client goes away aborts the upstream connection.
    ///
    /// `upstream_timeout` bounds the connect and every idle period before the
    /// response head. Request body frames reaching the backend count as activity.
    async fn proxy_request(
        &self,
        mut req: Request<Incoming>,
        mapping: &Mapping,
        host: &str,
        remote_addr: SocketAddr,
        scheme: Scheme,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let port = mapping.port;
        let timeout = self.config.upstream_timeout;

        let upgrade = self.config.enable_websocket_proxy && is_upgrade_request(&req);
        let client_upgrade = if upgrade {
            Some(hyper::upgrade::on(&mut req))
        } else {
            None
        };

        let activity = Arc::new(BodyActivity::new());
        let req = req.map(|body| TrackedBody::new(body, activity.clone()));
        let upstream_req =
            build_upstream_request(req, mapping, host, remote_addr.ip(), scheme, upgrade)?;

        debug!("Proxying {} to 127.0.0.1:{}", host, port);

        let stream = match tokio::time::timeout(
            timeout,
            TcpStream::connect((Ipv4Addr::LOCALHOST, port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(classify_io(port, e)),
            Err(_) => {
                return Err(ProxyError::Unreachable {
                    port,
                    reason: format!("connect timed out after {:?}", timeout),
                })
            }
        };
        let _ = stream.set_nodelay(true);

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| classify_hyper(port, e))?;

        let guard = ConnectionGuard::new(tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!("Backend connection error: {}", e);
            }
        }));

        activity.touch();
        let send = sender.send_request(upstream_req);
        tokio::pin!(send);
        let mut response = loop {
            match tokio::time::timeout_at(activity.last() + timeout, &mut send).await {
                Ok(Ok(response)) => break response,
                Ok(Err(e)) => return Err(classify_hyper(port, e)),
                Err(_) if activity.last() + timeout > Instant::now() => continue,
                Err(_) => {
                    return Err(ProxyError::Unreachable {
                        port,
                        reason: format!("no response within {:?}", timeout),
                    })
                }
            }
        };

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            if let Some(client_upgrade) = client_upgrade {
                let upstream_upgrade = hyper::upgrade::on(&mut response);
                tokio::spawn(tunnel(
                    client_upgrade,
                    upstream_upgrade,
                    guard,
                    host.to_string(),
                ));
                let (parts, _) = response.into_parts();
                return Ok(Response::from_parts(parts, empty_body()));
            }
        }

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers, false);

        Ok(Response::from_parts(
            parts,
            UpstreamBody::new(body, guard).boxed(),
        ))
    }
}

/// Hosts served by the dashboard / control API on the TLS listener
pub fn is_dashboard_host(host: &str) -> bool {
    let name = match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    };
    matches!(name, "localhost" | "127.0.0.1" | "[::1]")
}

fn path_and_query(uri: &Uri) -> &str {
    uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
}

/// Check if request asks for a protocol upgrade (WebSocket)
fn is_upgrade_request<T>(req: &Request<T>) -> bool {
    let connection_upgrade = req
        .headers()
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    connection_upgrade && req.headers().contains_key(UPGRADE)
}

/// Remove hop-by-hop headers, including any listed in `Connection`
fn strip_hop_by_hop(headers: &mut HeaderMap, keep_upgrade: bool) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        if !(keep_upgrade && name == UPGRADE) {
            headers.remove(&name);
        }
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    if !keep_upgrade {
        headers.remove(UPGRADE);
    }
}

/// Rewrite a client request for the backend
///
/// The backend sees its own origin in `Host` (`domain:port`); the client-facing host
/// travels in `X-Forwarded-Host`.
fn build_upstream_request<B>(
    req: Request<B>,
    mapping: &Mapping,
    host: &str,
    client_ip: IpAddr,
    scheme: Scheme,
    upgrade: bool,
) -> Result<Request<B>, ProxyError> {
    let (mut parts, body) = req.into_parts();

    let uri: Uri = path_and_query(&parts.uri)
        .parse()
        .context("Invalid request URI")?;
    parts.uri = uri;
    parts.version = Version::HTTP_11;

    let headers = &mut parts.headers;
    strip_hop_by_hop(headers, upgrade);
    if upgrade {
        headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
    }

    let origin = format!("{}:{}", mapping.domain, mapping.port);
    headers.insert(
        HOST,
        HeaderValue::from_str(&origin).context("Invalid upstream host")?,
    );

    let forwarded_for = match headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        Some(existing) => format!("{}, {}", existing, client_ip),
        None => client_ip.to_string(),
    };
    headers.insert(
        "x-forwarded-for",
        HeaderValue::from_str(&forwarded_for).context("Invalid X-Forwarded-For")?,
    );
    headers.insert(
        "x-forwarded-host",
        HeaderValue::from_str(host).context("Invalid X-Forwarded-Host")?,
    );
    headers.insert(
        "x-forwarded-proto",
        HeaderValue::from_static(scheme.as_str()),
    );

    Ok(Request::from_parts(parts, body))
}

/// Errors that mean "nothing usable is listening on the backend port"
fn is_unreachable_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::NotFound
            | io::ErrorKind::AddrNotAvailable
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

fn classify_io(port: u16, e: io::Error) -> ProxyError {
    if is_unreachable_kind(e.kind()) {
        ProxyError::Unreachable {
            port,
            reason: e.to_string(),
        }
    } else {
        ProxyError::Other(anyhow!(e).context(format!("connecting to 127.0.0.1:{}", port)))
    }
}

fn classify_hyper(port: u16, e: hyper::Error) -> ProxyError {
    let mut unreachable = e.is_incomplete_message() || e.is_canceled() || e.is_closed();

    let mut source = std::error::Error::source(&e);
    while let Some(err) = source {
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            unreachable |= is_unreachable_kind(io_err.kind());
        }
        source = err.source();
    }

    if unreachable {
        ProxyError::Unreachable {
            port,
            reason: e.to_string(),
        }
    } else {
        ProxyError::Other(anyhow!(e))
    }
}

/// Splice an upgraded client connection to the upgraded backend connection
async fn tunnel(client: OnUpgrade, upstream: OnUpgrade, guard: ConnectionGuard, host: String) {
    let (client, upstream) = match tokio::try_join!(client, upstream) {
        Ok(pair) => pair,
        Err(e) => {
            warn!("WebSocket upgrade failed for {}: {}", host, e);
            return;
        }
    };

    let mut client = TokioIo::new(client);
    let mut upstream = TokioIo::new(upstream);
    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((sent, received)) => debug!(
            "WebSocket tunnel for {} closed ({} bytes up, {} bytes down)",
            host, sent, received
        ),
        Err(e) => debug!("WebSocket tunnel for {} ended: {}", host, e),
    }
    drop(guard);
}

/// Aborts the upstream connection task when dropped
pub(crate) struct ConnectionGuard {
    task: JoinHandle<()>,
}

impl ConnectionGuard {
    pub(crate) fn new(task: JoinHandle<()>) -> Self {
        Self { task }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pin_project! {
    /// Streams the backend response while keeping its connection alive
    struct UpstreamBody {
        #[pin]
        inner: Incoming,
        _guard: ConnectionGuard,
    }
}

impl UpstreamBody {
    fn new(inner: Incoming, guard: ConnectionGuard) -> Self {
        Self {
            inner,
            _guard: guard,
        }
    }
}

impl Body for UpstreamBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        self.project().inner.poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Time of the last request body frame handed to the backend
#[derive(Debug)]
struct BodyActivity(Mutex<Instant>);

impl BodyActivity {
    fn new() -> Self {
        Self(Mutex::new(Instant::now()))
    }

    fn touch(&self) {
        *self.0.lock() = Instant::now();
    }

    fn last(&self) -> Instant {
        *self.0.lock()
    }
}

pin_project! {
    /// Client request body that records progress of the upload
    struct TrackedBody<B> {
        #[pin]
        inner: B,
        activity: Arc<BodyActivity>,
    }
}

impl<B> TrackedBody<B> {
    fn new(inner: B, activity: Arc<BodyActivity>) -> Self {
        Self { inner, activity }
    }
}

impl<B: Body> Body for TrackedBody<B> {
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let poll = this.inner.poll_frame(cx);
        if let Poll::Ready(Some(Ok(_))) = &poll {
            this.activity.touch();
        }
        poll
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Create full body
pub fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Create empty body
pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

fn with_content_type(
    status: StatusCode,
    content_type: &'static str,
    body: ProxyBody,
) -> Response<ProxyBody> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

/// Create text response
pub fn text_response(status: StatusCode, body: impl Into<String>) -> Response<ProxyBody> {
    with_content_type(status, "text/plain; charset=utf-8", full_body(body.into()))
}

/// Create JSON response
pub fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<ProxyBody> {
    match serde_json::to_vec(value) {
        Ok(json) => with_content_type(status, "application/json", full_body(json)),
        Err(e) => {
            error!("Failed to serialize response: {}", e);
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        }
    }
}

/// Create redirect response
pub fn redirect_response(status: StatusCode, location: &str) -> Response<ProxyBody> {
    match HeaderValue::from_str(location) {
        Ok(value) => {
            let mut response = Response::new(empty_body());
            *response.status_mut() = status;
            response.headers_mut().insert(LOCATION, value);
            response
        }
        Err(_) => text_response(StatusCode::BAD_REQUEST, "Invalid redirect target"),
    }
}

/// 502 page for a mapped domain whose backend is down
pub fn unreachable_response(host: &str, port: u16) -> Response<ProxyBody> {
    let content = format!(
        "The domain <strong>{}</strong> is configured in LAM but the target server is not running.\
         <br><br><strong>Target: localhost:{}</strong>\
         <br><br>Please start your development server and try again.",
        escape_html(host),
        port
    );
    with_content_type(
        StatusCode::BAD_GATEWAY,
        "text/html; charset=utf-8",
        full_body(error_page("Server Not Reachable", &content)),
    )
}

/// 500 page for any other forwarding failure
pub fn proxy_error_response(host: &str) -> Response<ProxyBody> {
    let content = format!(
        "An error occurred while connecting to <strong>{}</strong>.\
         <br><br>Please check your LAM configuration and try again.",
        escape_html(host)
    );
    with_content_type(
        StatusCode::INTERNAL_SERVER_ERROR,
        "text/html; charset=utf-8",
        full_body(error_page("Proxy Error", &content)),
    )
}

fn error_page(title: &str, content: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head><meta charset=\"UTF-8\"><title>LAM - {title}</title></head>\n\
         <body><h1>{title}</h1><p>{content}</p><a href=\"/\">Go to LAM Dashboard</a></body>\n</html>\n"
    )
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
