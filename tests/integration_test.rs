//! Integration tests for lamproxy
//!
//! Tests the full proxy server functionality including:
//! - HTTP proxying by Host header
//! - Fallback to the control API
//! - Redirect mode
//! - Error pages for unreachable and hung backends
//! - Upstream cancellation when the client goes away
//! - TLS termination with issued and custom certificates
//! - WebSocket proxying

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use lamproxy::{CertificateAuthority, ControlApi, MappingStore, ProxyConfig, ProxyServer, Registry};
use rustls::pki_types::{CertificateDer, ServerName};
use std::convert::Infallible;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::Message;

/// Echoes what the backend received, so tests can assert on the forwarded request
async fn echo(
    name: &'static str,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let header = |key: &str| {
        req.headers()
            .get(key)
            .and_then(|h| h.to_str().ok())
            .unwrap_or("none")
            .to_string()
    };
    let summary = format!(
        "{}|{}|{}|host={}|xff={}|xfh={}|proto={}",
        name,
        req.method(),
        req.uri(),
        header("host"),
        header("x-forwarded-for"),
        header("x-forwarded-host"),
        header("x-forwarded-proto"),
    );

    let payload = req
        .into_body()
        .collect()
        .await
        .map(|b| b.to_bytes())
        .unwrap_or_default();

    Ok(Response::new(Full::new(Bytes::from(format!(
        "{}|body={}",
        summary,
        String::from_utf8_lossy(&payload)
    )))))
}

/// Simple backend server for testing
async fn run_backend_server(name: &'static str) -> (u16, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let handle = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let service = service_fn(move |req| echo(name, req));
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    (port, handle)
}

/// WebSocket backend that echoes every data frame
async fn run_websocket_backend() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(msg)) = ws.next().await {
                    if (msg.is_text() || msg.is_binary()) && ws.send(msg).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    port
}

/// Backend that reads a request head and never answers
///
/// `received` fires once the head has arrived, `closed` once the proxy hangs up.
async fn run_silent_backend() -> (u16, oneshot::Receiver<()>, oneshot::Receiver<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (received_tx, received_rx) = oneshot::channel();
    let (closed_tx, closed_rx) = oneshot::channel();

    tokio::spawn(async move {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        let mut head = Vec::new();
        let mut buf = [0u8; 1024];
        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => head.extend_from_slice(&buf[..n]),
            }
        }
        let _ = received_tx.send(());

        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
        let _ = closed_tx.send(());
    });

    (port, received_rx, closed_rx)
}

/// A port nothing listens on
async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

struct TestProxy {
    _dir: TempDir,
    ca: Arc<CertificateAuthority>,
    registry: Arc<Registry>,
    http_addr: SocketAddr,
    https_addr: Option<SocketAddr>,
}

impl TestProxy {
    fn http_url(&self, path: &str) -> String {
        format!("http://{}{}", self.http_addr, path)
    }
}

/// Create and start a test proxy server on ephemeral ports
async fn setup_proxy(enable_https: bool) -> TestProxy {
    setup_proxy_with(enable_https, lamproxy::proxy::UPSTREAM_TIMEOUT).await
}

async fn setup_proxy_with(enable_https: bool, upstream_timeout: Duration) -> TestProxy {
    let dir = tempdir().unwrap();
    let store = Arc::new(MappingStore::open(
        dir.path().join("mappings.json"),
        enable_https,
    ));
    let ca = Arc::new(CertificateAuthority::new(dir.path().join("certs"), store.clone()).unwrap());
    let registry = Arc::new(Registry::new(store.clone(), ca.clone(), None));

    let http_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let http_addr = http_listener.local_addr().unwrap();
    let https_listener = if enable_https {
        Some(TcpListener::bind("127.0.0.1:0").await.unwrap())
    } else {
        None
    };
    let https_addr = https_listener.as_ref().map(|l| l.local_addr().unwrap());

    let config = ProxyConfig {
        bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        http_port: http_addr.port(),
        https_port: https_addr.map_or(443, |a| a.port()),
        enable_https,
        upstream_timeout,
        ..ProxyConfig::default()
    };

    let server = Arc::new(ProxyServer::new(
        config,
        store,
        ca.clone(),
        Arc::new(ControlApi::new(registry.clone())),
    ));

    tokio::spawn(server.clone().serve_http(http_listener));
    if let Some(listener) = https_listener {
        tokio::spawn(server.clone().serve_https(listener));
    }

    TestProxy {
        _dir: dir,
        ca,
        registry,
        http_addr,
        https_addr,
    }
}

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

fn tls_connector(ca: &CertificateAuthority) -> TlsConnector {
    let mut roots = rustls::RootCertStore::empty();
    roots
        .add(CertificateDer::from(ca.root_certificate_der().to_vec()))
        .unwrap();
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

/// TLS handshake with the proxy trusting only the local root
async fn tls_connect(proxy: &TestProxy, server_name: &str) -> io::Result<TlsStream<TcpStream>> {
    let stream = TcpStream::connect(proxy.https_addr.unwrap()).await?;
    let server_name = ServerName::try_from(server_name).unwrap().to_owned();
    tls_connector(&proxy.ca).connect(server_name, stream).await
}

/// GET over TLS trusting only the local root
async fn https_get(
    proxy: &TestProxy,
    server_name: &str,
    host: &str,
    path: &str,
) -> (StatusCode, String) {
    let tls = tls_connect(proxy, server_name)
        .await
        .expect("TLS handshake with the issued certificate");

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls))
        .await
        .unwrap();
    tokio::spawn(conn);

    let req = Request::builder()
        .uri(path)
        .header("host", host)
        .body(Empty::<Bytes>::new())
        .unwrap();
    let response = sender.send_request(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&body).to_string())
}

#[tokio::test]
async fn test_health_endpoint() {
    let proxy = setup_proxy(false).await;

    let response = client()
        .get(proxy.http_url("/health"))
        .send()
        .await
        .unwrap();

    assert!(response.status().is_success());
    assert_eq!(response.text().await.unwrap(), "OK");
}

#[tokio::test]
async fn test_proxy_simple_request() {
    let proxy = setup_proxy(false).await;
    let (backend_port, _backend) = run_backend_server("hello").await;
    proxy
        .registry
        .register("foo", backend_port, false, "local")
        .await
        .unwrap();

    let response = client()
        .get(proxy.http_url("/api/items?page=2"))
        .header("Host", "foo.local")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body = response.text().await.unwrap();
    assert!(body.starts_with("hello|GET|/api/items?page=2|"), "{}", body);
    assert!(body.contains(&format!("host=foo.local:{}", backend_port)));
    assert!(body.contains("xff=127.0.0.1"));
    assert!(body.contains("xfh=foo.local"));
    assert!(body.contains("proto=http"));
}

#[tokio::test]
async fn test_proxy_post_body() {
    let proxy = setup_proxy(false).await;
    let (backend_port, _backend) = run_backend_server("post").await;
    proxy
        .registry
        .register("forms", backend_port, false, "local")
        .await
        .unwrap();

    let response = client()
        .post(proxy.http_url("/submit"))
        .header("Host", "forms.local")
        .body("name=lam&value=42")
        .send()
        .await
        .unwrap();

    let body = response.text().await.unwrap();
    assert!(body.starts_with("post|POST|/submit|"));
    assert!(body.ends_with("|body=name=lam&value=42"));
}

#[tokio::test]
async fn test_unmapped_host_falls_through() {
    let proxy = setup_proxy(false).await;

    let response = client()
        .get(proxy.http_url("/api/mappings"))
        .header("Host", "unknown.local")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let json: serde_json::Value = response.json().await.unwrap();
    assert_eq!(json["mappings"], serde_json::json!([]));
}

#[tokio::test]
async fn test_unreachable_backend_returns_502() {
    let proxy = setup_proxy(false).await;
    let dead_port = closed_port().await;
    proxy
        .registry
        .register("down", dead_port, false, "local")
        .await
        .unwrap();

    let response = client()
        .get(proxy.http_url("/"))
        .header("Host", "down.local")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::BAD_GATEWAY);
    let body = response.text().await.unwrap();
    assert!(body.contains("Server Not Reachable"));
    assert!(body.contains("down.local"));
    assert!(body.contains(&format!("localhost:{}", dead_port)));

    // The listener keeps serving once the backend comes up
    let (backend_port, _backend) = run_backend_server("back").await;
    proxy
        .registry
        .register("down", backend_port, false, "local")
        .await
        .unwrap();

    let response = client()
        .get(proxy.http_url("/"))
        .header("Host", "down.local")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert!(response.text().await.unwrap().starts_with("back|"));
}

#[tokio::test]
async fn test_redirect_mode() {
    let proxy = setup_proxy(false).await;
    let (backend_port, _backend) = run_backend_server("unused").await;
    proxy
        .registry
        .register("legacy", backend_port, false, "local")
        .await
        .unwrap();
    proxy.registry.toggle_proxy("legacy.local").unwrap();

    let response = client()
        .get(proxy.http_url("/path?q=1"))
        .header("Host", "legacy.local")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::FOUND);
    assert_eq!(
        response.headers()["location"],
        format!("http://legacy.local:{}/path?q=1", backend_port).as_str()
    );
}

#[tokio::test]
async fn test_https_mapping_is_still_served_over_http() {
    let proxy = setup_proxy(true).await;
    let (backend_port, _backend) = run_backend_server("secure").await;
    let registration = proxy
        .registry
        .register("secure", backend_port, false, "local")
        .await
        .unwrap();
    assert!(registration.https);

    let response = client()
        .get(proxy.http_url("/login"))
        .header("Host", "secure.local")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body = response.text().await.unwrap();
    assert!(body.starts_with("secure|GET|/login|"), "{}", body);
    assert!(body.contains("proto=http|"));
}

#[tokio::test]
async fn test_hung_backend_times_out_with_502() {
    let proxy = setup_proxy_with(false, Duration::from_millis(300)).await;
    let (backend_port, _received, _closed) = run_silent_backend().await;
    proxy
        .registry
        .register("hang", backend_port, false, "local")
        .await
        .unwrap();

    let response = tokio::time::timeout(
        Duration::from_secs(5),
        client()
            .get(proxy.http_url("/"))
            .header("Host", "hang.local")
            .send(),
    )
    .await
    .expect("proxy answers once the upstream timeout expires")
    .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::BAD_GATEWAY);
    assert!(response.text().await.unwrap().contains("hang.local"));
}

#[tokio::test]
async fn test_slow_upload_is_not_cut_off() {
    let proxy = setup_proxy_with(false, Duration::from_millis(300)).await;
    let (backend_port, _backend) = run_backend_server("upload").await;
    proxy
        .registry
        .register("upload", backend_port, false, "local")
        .await
        .unwrap();

    // Four chunks 150ms apart: the upload outlasts the timeout but never idles that long
    let chunks = futures_util::stream::unfold(0u8, |i| async move {
        if i == 4 {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
        let frame = Frame::data(Bytes::from(format!("part{};", i)));
        Some((Ok::<_, Infallible>(frame), i + 1))
    });

    let stream = TcpStream::connect(proxy.http_addr).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(conn);

    let req = Request::builder()
        .method("POST")
        .uri("/upload")
        .header("host", "upload.local")
        .body(StreamBody::new(chunks))
        .unwrap();
    let response = sender.send_request(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let body = String::from_utf8_lossy(&body);
    assert!(body.ends_with("|body=part0;part1;part2;part3;"), "{}", body);
}

#[tokio::test]
async fn test_client_disconnect_closes_upstream() {
    let proxy = setup_proxy(false).await;
    let (backend_port, received, closed) = run_silent_backend().await;
    proxy
        .registry
        .register("hang", backend_port, false, "local")
        .await
        .unwrap();

    let mut client = TcpStream::connect(proxy.http_addr).await.unwrap();
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: hang.local\r\n\r\n")
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), received)
        .await
        .expect("backend receives the request")
        .unwrap();

    drop(client);

    // Well inside the 30s upstream timeout, so only cancellation can close it
    tokio::time::timeout(Duration::from_secs(5), closed)
        .await
        .expect("backend connection closed after the client went away")
        .unwrap();
}

#[tokio::test]
async fn test_https_end_to_end() {
    let proxy = setup_proxy(true).await;
    let (backend_port, _backend) = run_backend_server("tls").await;
    proxy
        .registry
        .register("secure", backend_port, true, "local")
        .await
        .unwrap();

    let (status, body) = https_get(&proxy, "secure.local", "secure.local", "/dashboard").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.starts_with("tls|GET|/dashboard|"), "{}", body);
    assert!(body.contains("proto=https"));
}

#[tokio::test]
async fn test_https_unmapped_and_dashboard_hosts() {
    let proxy = setup_proxy(true).await;

    // Certificates are issued on demand for any SNI name
    let (status, body) = https_get(&proxy, "other.local", "other.local", "/").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body.contains("no mapping"));
    assert!(proxy.ca.certificate_status("other.local").await.exists);

    // No SNI for an IP address: the localhost certificate carries 127.0.0.1
    let (status, body) = https_get(&proxy, "127.0.0.1", "127.0.0.1", "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "OK");
}

#[tokio::test]
async fn test_broken_custom_certificate_fails_only_its_handshake() {
    let proxy = setup_proxy(true).await;
    let (backend_port, _backend) = run_backend_server("tls").await;
    for project in ["broken", "fine"] {
        proxy
            .registry
            .register(project, backend_port, true, "local")
            .await
            .unwrap();
    }

    let certs = tempdir().unwrap();
    let key = certs.path().join("broken.key");
    let cert = certs.path().join("broken.crt");
    std::fs::write(&key, "not a key").unwrap();
    std::fs::write(&cert, "not a certificate").unwrap();
    proxy
        .registry
        .set_certificate("broken.local", Some((key, cert)))
        .unwrap();

    assert!(tls_connect(&proxy, "broken.local").await.is_err());

    // Same listener, next handshake
    let (status, body) = https_get(&proxy, "fine.local", "fine.local", "/").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.starts_with("tls|GET|/|"), "{}", body);
}

#[tokio::test]
async fn test_websocket_proxy() {
    let proxy = setup_proxy(false).await;
    let ws_port = run_websocket_backend().await;
    proxy
        .registry
        .register("ws", ws_port, false, "local")
        .await
        .unwrap();

    let stream = TcpStream::connect(proxy.http_addr).await.unwrap();
    let (mut ws, response) = tokio_tungstenite::client_async("ws://ws.local/socket", stream)
        .await
        .expect("WebSocket upgrade through the proxy");
    assert_eq!(response.status().as_u16(), 101);

    ws.send(Message::Text("ping".to_string())).await.unwrap();
    let reply = ws.next().await.unwrap().unwrap();
    assert_eq!(reply, Message::Text("ping".to_string()));

    ws.close(None).await.unwrap();
}

#[tokio::test]
async fn test_control_api_register_and_remove() {
    let proxy = setup_proxy(false).await;
    let (backend_port, _backend) = run_backend_server("api").await;
    let client = client();

    let response = client
        .post(proxy.http_url("/api/register"))
        .json(&serde_json::json!({ "project": "viaapi", "port": backend_port }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let json: serde_json::Value = response.json().await.unwrap();
    assert_eq!(json["domain"], "viaapi.local");

    let response = client
        .get(proxy.http_url("/"))
        .header("Host", "viaapi.local")
        .send()
        .await
        .unwrap();
    assert!(response.text().await.unwrap().starts_with("api|"));

    let response = client
        .delete(proxy.http_url("/api/mappings/viaapi.local"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    // Unmapped again: the control API answers instead of the backend
    let response = client
        .get(proxy.http_url("/"))
        .header("Host", "viaapi.local")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
}
