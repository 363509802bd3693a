//! Registry and control API
//! Everything the proxies do not forward lands here: mapping and certificate management
//! as JSON over HTTP

use crate::certificate::{CertificateAuthority, CertificateStatus, LeafPaths};
use crate::error::{CertificateError, StoreError};
use crate::hosts::HostsFile;
use crate::mappings::{Mapping, MappingStore, Mappings, Registration};
use crate::proxy::{full_body, json_response, text_response, Fallback, ProxyBody};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Limited};
use hyper::body::{Body, Incoming};
use hyper::header::{HeaderValue, CONTENT_DISPOSITION, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const MAX_BODY_SIZE: usize = 64 * 1024;
const DEFAULT_TLD: &str = "local";

/// Encoding of the exported root certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaFormat {
    Pem,
    Der,
}

/// Mapping and certificate management shared by the control API and `main`
pub struct Registry {
    store: Arc<MappingStore>,
    ca: Arc<CertificateAuthority>,
    hosts: Option<HostsFile>,
}

impl Registry {
    /// `hosts` is only set when hosts-file maintenance is enabled
    pub fn new(
        store: Arc<MappingStore>,
        ca: Arc<CertificateAuthority>,
        hosts: Option<HostsFile>,
    ) -> Self {
        Self { store, ca, hosts }
    }

    pub fn store(&self) -> &Arc<MappingStore> {
        &self.store
    }

    pub fn list(&self) -> Mappings {
        self.store.get()
    }

    /// Register `project.tld` and prepare everything it needs to be served
    ///
    /// The leaf is issued up front unless a custom certificate is on file, whether
    /// or not the mapping asks for HTTPS. Issuance failures are logged only; the TLS listener retries on the
    /// first handshake.
    pub async fn register(
        &self,
        project: &str,
        port: u16,
        https: bool,
        tld: &str,
    ) -> Result<Registration, StoreError> {
        let registration = self.store.upsert(project, port, https, tld)?;
        info!(
            "Registered {} -> localhost:{}",
            registration.domain, registration.port
        );

        let has_custom = self
            .store
            .find(&registration.domain)
            .map_or(false, |m| m.custom_certificate().is_some());

        if !has_custom {
            if let Err(e) = self.ca.issue_leaf(&registration.domain).await {
                error!(
                    "Failed to issue certificate for {}: {}",
                    registration.domain, e
                );
            }
        }

        if let Some(hosts) = &self.hosts {
            hosts.try_add(&registration.domain);
        }

        Ok(registration)
    }

    pub fn remove(&self, domain: &str) -> Result<Mapping, StoreError> {
        let removed = self.store.remove(domain)?;
        info!("Removed mapping {}", domain);

        if let Some(hosts) = &self.hosts {
            hosts.try_remove(domain);
        }
        Ok(removed)
    }

    pub fn toggle_proxy(&self, domain: &str) -> Result<Mapping, StoreError> {
        let mapping = self.store.toggle_proxy(domain)?;
        info!(
            "Switched {} to {} mode",
            domain,
            if mapping.proxy { "proxy" } else { "redirect" }
        );
        Ok(mapping)
    }

    /// Point `domain` at user-supplied key and certificate files, or clear the override
    pub fn set_certificate(
        &self,
        domain: &str,
        paths: Option<(PathBuf, PathBuf)>,
    ) -> Result<Mapping, StoreError> {
        self.store.set_certificate(domain, paths)
    }

    pub fn root_certificate(&self, format: CaFormat) -> Bytes {
        match format {
            CaFormat::Pem => Bytes::copy_from_slice(self.ca.root_certificate_pem().as_bytes()),
            CaFormat::Der => Bytes::copy_from_slice(self.ca.root_certificate_der()),
        }
    }

    pub async fn certificate_status(&self, domain: &str) -> CertificateStatus {
        self.ca.certificate_status(domain).await
    }

    pub async fn issue(&self, domain: &str) -> Result<LeafPaths, CertificateError> {
        self.ca.issue_leaf(domain).await
    }

    pub async fn delete_certificate(&self, domain: &str) -> Result<bool, CertificateError> {
        self.ca.delete_leaf(domain).await
    }
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    project: Option<String>,
    /// Accepts a number or a numeric string
    port: Option<Value>,
    #[serde(default)]
    https: bool,
    tld: Option<String>,
}

impl RegisterRequest {
    fn port(&self) -> Option<u16> {
        match self.port.as_ref()? {
            Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CustomCertificateRequest {
    key_path: Option<PathBuf>,
    cert_path: Option<PathBuf>,
}

/// JSON management API served for unmapped and dashboard hosts
pub struct ControlApi {
    registry: Arc<Registry>,
}

#[async_trait]
impl Fallback for ControlApi {
    async fn handle(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        self.route(req).await
    }
}

impl ControlApi {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub(crate) async fn route<B>(&self, req: Request<B>) -> Response<ProxyBody>
    where
        B: Body + Send,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        debug!("Control API {} {}", method, path);

        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

        match (&method, segments.as_slice()) {
            (&Method::GET, ["health"]) => text_response(StatusCode::OK, "OK"),
            (&Method::GET, ["api", "version"]) => json_response(
                StatusCode::OK,
                &json!({ "name": env!("CARGO_PKG_NAME"), "version": env!("CARGO_PKG_VERSION") }),
            ),
            (&Method::GET, ["api", "mappings"]) => {
                json_response(StatusCode::OK, &self.registry.list())
            }
            (&Method::POST, ["api", "register"]) => self.register(req).await,
            (&Method::DELETE, ["api", "mappings", domain]) => self.remove(domain),
            (&Method::POST, ["api", "mappings", domain, "proxy"]) => self.toggle_proxy(domain),
            (&Method::PUT, ["api", "mappings", domain, "certificate"]) => {
                self.set_certificate(domain, req).await
            }
            (&Method::GET, ["api", "ca"]) => self.root_certificate(req.uri().query()),
            (&Method::GET, ["api", "certificates", domain]) => json_response(
                StatusCode::OK,
                &self.registry.certificate_status(domain).await,
            ),
            (&Method::POST, ["api", "certificates", domain]) => self.issue(domain).await,
            (&Method::DELETE, ["api", "certificates", domain]) => {
                self.delete_certificate(domain).await
            }
            _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
        }
    }

    async fn register<B>(&self, req: Request<B>) -> Response<ProxyBody>
    where
        B: Body + Send,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let request: RegisterRequest = match read_json(req).await {
            Ok(request) => request,
            Err(response) => return response,
        };

        let (Some(project), Some(port)) = (request.project.as_deref(), request.port()) else {
            return error_response(StatusCode::BAD_REQUEST, "Project name and port are required");
        };
        let tld = request.tld.as_deref().unwrap_or(DEFAULT_TLD);

        match self
            .registry
            .register(project, port, request.https, tld)
            .await
        {
            Ok(registration) => json_response(
                StatusCode::OK,
                &json!({
                    "success": true,
                    "domain": registration.domain,
                    "url": registration.url,
                    "port": registration.port,
                    "https": registration.https,
                }),
            ),
            Err(e) => store_error_response(e),
        }
    }

    fn remove(&self, domain: &str) -> Response<ProxyBody> {
        match self.registry.remove(domain) {
            Ok(_) => json_response(StatusCode::OK, &json!({ "success": true })),
            Err(e) => store_error_response(e),
        }
    }

    fn toggle_proxy(&self, domain: &str) -> Response<ProxyBody> {
        match self.registry.toggle_proxy(domain) {
            Ok(mapping) => json_response(
                StatusCode::OK,
                &json!({ "success": true, "mapping": mapping }),
            ),
            Err(e) => store_error_response(e),
        }
    }

    async fn set_certificate<B>(&self, domain: &str, req: Request<B>) -> Response<ProxyBody>
    where
        B: Body + Send,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let request: CustomCertificateRequest = match read_json(req).await {
            Ok(request) => request,
            Err(response) => return response,
        };

        let paths = match (request.key_path, request.cert_path) {
            (Some(key), Some(cert)) => Some((key, cert)),
            (None, None) => None,
            _ => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "keyPath and certPath must be given together",
                )
            }
        };

        match self.registry.set_certificate(domain, paths) {
            Ok(mapping) => json_response(
                StatusCode::OK,
                &json!({ "success": true, "mapping": mapping }),
            ),
            Err(e) => store_error_response(e),
        }
    }

    fn root_certificate(&self, query: Option<&str>) -> Response<ProxyBody> {
        let der = query
            .unwrap_or("")
            .split('&')
            .any(|pair| pair.eq_ignore_ascii_case("format=der"));

        let (format, content_type, filename) = if der {
            (CaFormat::Der, "application/x-x509-ca-cert", "lam-root-ca.crt")
        } else {
            (CaFormat::Pem, "application/x-pem-file", "lam-root-ca.pem")
        };

        let mut response = Response::new(full_body(self.registry.root_certificate(format)));
        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", filename))
        {
            headers.insert(CONTENT_DISPOSITION, value);
        }
        response
    }

    async fn issue(&self, domain: &str) -> Response<ProxyBody> {
        match self.registry.issue(domain).await {
            Ok(paths) => json_response(
                StatusCode::OK,
                &json!({
                    "success": true,
                    "domain": domain,
                    "keyPath": paths.key_path,
                    "certPath": paths.cert_path,
                }),
            ),
            Err(e) => certificate_error_response(domain, e),
        }
    }

    async fn delete_certificate(&self, domain: &str) -> Response<ProxyBody> {
        match self.registry.delete_certificate(domain).await {
            Ok(true) => json_response(StatusCode::OK, &json!({ "success": true })),
            Ok(false) => error_response(StatusCode::NOT_FOUND, "Certificate not found"),
            Err(e) => certificate_error_response(domain, e),
        }
    }
}

/// Read a size-limited JSON body, or the error response to send instead
async fn read_json<B, T>(req: Request<B>) -> Result<T, Response<ProxyBody>>
where
    B: Body + Send,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    T: for<'de> Deserialize<'de>,
{
    let body = Limited::new(req.into_body(), MAX_BODY_SIZE)
        .collect()
        .await
        .map_err(|e| {
            warn!("Failed to read request body: {}", e);
            error_response(StatusCode::BAD_REQUEST, "Unreadable request body")
        })?
        .to_bytes();

    serde_json::from_slice(&body)
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, &format!("Invalid JSON: {}", e)))
}

fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    json_response(status, &json!({ "error": message }))
}

fn store_error_response(e: StoreError) -> Response<ProxyBody> {
    match e {
        StoreError::NotFound(_) => error_response(StatusCode::NOT_FOUND, "Mapping not found"),
        StoreError::Invalid(message) => error_response(StatusCode::BAD_REQUEST, &message),
    }
}

fn certificate_error_response(domain: &str, e: CertificateError) -> Response<ProxyBody> {
    match e {
        CertificateError::InvalidMaterial { reason, .. } => {
            error_response(StatusCode::BAD_REQUEST, &reason)
        }
        e => {
            error!("Certificate operation failed for {}: {}", domain, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
    }
}
