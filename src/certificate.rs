//! Local certificate authority
//! Creates a root once, then issues and caches one leaf certificate per domain

use crate::error::CertificateError;
use crate::mappings::MappingStore;
use dashmap::DashMap;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, RsaKeySize, SanType, SerialNumber,
    PKCS_RSA_SHA256,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use serde::Serialize;
use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, error, info};

const ROOT_KEY_FILE: &str = "root-ca-key.pem";
const ROOT_CERT_FILE: &str = "root-ca-cert.pem";
const LEAF_KEY_FILE: &str = "key.pem";
const LEAF_CERT_FILE: &str = "cert.pem";

const ROOT_COMMON_NAME: &str = "LAM Development CA";
const ORGANIZATION: &str = "LAM Development";
const ROOT_VALIDITY_DAYS: i64 = 3650;
const LEAF_VALIDITY_DAYS: i64 = 365;

/// Root key material, held for the lifetime of the authority
struct RootAuthority {
    key: KeyPair,
    /// Issuer handle rebuilt from the persisted certificate
    issuer: Certificate,
    /// The certificate exactly as persisted (what users trust)
    cert_pem: String,
    cert_der: CertificateDer<'static>,
}

/// Where a leaf certificate lives on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeafPaths {
    pub key_path: PathBuf,
    pub cert_path: PathBuf,
}

/// Cache state of a domain's certificate, as reported to the dashboard
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateStatus {
    pub domain: String,
    pub exists: bool,
    pub key_path: PathBuf,
    pub cert_path: PathBuf,
}

/// Certificate authority for locally issued development certificates
pub struct CertificateAuthority {
    certs_dir: PathBuf,
    store: Arc<MappingStore>,
    root: Arc<RootAuthority>,
    issuing: DashMap<String, Arc<TokioMutex<()>>>,
    issued: AtomicU64,
}

impl CertificateAuthority {
    /// Open the authority rooted at `certs_dir`, creating the root on first use
    pub fn new<P: AsRef<Path>>(
        certs_dir: P,
        store: Arc<MappingStore>,
    ) -> Result<Self, CertificateError> {
        let certs_dir = certs_dir.as_ref().to_path_buf();
        fs::create_dir_all(&certs_dir).map_err(|e| CertificateError::io(&certs_dir, e))?;

        let root = Self::get_or_create_root(&certs_dir)?;

        Ok(Self {
            certs_dir,
            store,
            root: Arc::new(root),
            issuing: DashMap::new(),
            issued: AtomicU64::new(0),
        })
    }

    /// Load the persisted root, or generate and persist a new one
    fn get_or_create_root(certs_dir: &Path) -> Result<RootAuthority, CertificateError> {
        let key_path = certs_dir.join(ROOT_KEY_FILE);
        let cert_path = certs_dir.join(ROOT_CERT_FILE);

        if key_path.is_file() && cert_path.is_file() {
            let key_pem =
                fs::read_to_string(&key_path).map_err(|e| CertificateError::io(&key_path, e))?;
            let cert_pem =
                fs::read_to_string(&cert_path).map_err(|e| CertificateError::io(&cert_path, e))?;

            let key = KeyPair::from_pem(&key_pem)
                .map_err(|e| CertificateError::invalid(&key_path, e.to_string()))?;
            let params = CertificateParams::from_ca_cert_pem(&cert_pem)
                .map_err(|e| CertificateError::invalid(&cert_path, e.to_string()))?;
            let issuer = params.self_signed(&key)?;
            let cert_der = first_certificate(&cert_path, cert_pem.as_bytes())?;

            info!("Loaded certificate authority from {}", certs_dir.display());
            return Ok(RootAuthority {
                key,
                issuer,
                cert_pem,
                cert_der,
            });
        }

        info!("Generating certificate authority in {}", certs_dir.display());

        let key = generate_key()?;
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, ROOT_COMMON_NAME);
        dn.push(DnType::OrganizationName, ORGANIZATION);
        params.distinguished_name = dn;

        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + Duration::days(ROOT_VALIDITY_DAYS);
        params.serial_number = Some(time_serial(now));

        let issuer = params.self_signed(&key)?;
        let cert_pem = issuer.pem();

        fs::write(&key_path, key.serialize_pem()).map_err(|e| CertificateError::io(&key_path, e))?;
        fs::write(&cert_path, &cert_pem).map_err(|e| CertificateError::io(&cert_path, e))?;

        Ok(RootAuthority {
            key,
            cert_der: issuer.der().clone(),
            issuer,
            cert_pem,
        })
    }

    pub fn certs_dir(&self) -> &Path {
        &self.certs_dir
    }

    pub fn root_key_path(&self) -> PathBuf {
        self.certs_dir.join(ROOT_KEY_FILE)
    }

    pub fn root_cert_path(&self) -> PathBuf {
        self.certs_dir.join(ROOT_CERT_FILE)
    }

    /// Root certificate in PEM form, for installing into trust stores
    pub fn root_certificate_pem(&self) -> &str {
        &self.root.cert_pem
    }

    /// Root certificate in DER form
    pub fn root_certificate_der(&self) -> &[u8] {
        self.root.cert_der.as_ref()
    }

    /// Number of leaf certificates generated by this process
    pub fn issued_count(&self) -> u64 {
        self.issued.load(Ordering::SeqCst)
    }

    /// Sanitize domain name for filesystem
    pub fn sanitize_domain(domain: &str) -> String {
        domain.replace('*', "wildcard")
    }

    fn leaf_paths(&self, domain: &str) -> LeafPaths {
        let dir = self.certs_dir.join(Self::sanitize_domain(domain));
        LeafPaths {
            key_path: dir.join(LEAF_KEY_FILE),
            cert_path: dir.join(LEAF_CERT_FILE),
        }
    }

    /// Cached leaf for `domain`: the exact entry, else the wildcard of its parent
    async fn cached_leaf(&self, domain: &str) -> Option<LeafPaths> {
        let exact = self.leaf_paths(domain);
        if is_complete(&exact).await {
            return Some(exact);
        }

        let wildcard = wildcard_parent(domain)?;
        let paths = self.leaf_paths(&wildcard);
        if is_complete(&paths).await {
            debug!("Using wildcard certificate {} for {}", wildcard, domain);
            return Some(paths);
        }
        None
    }

    /// Return the cached leaf for `domain`, issuing one if needed
    ///
    /// Issuance is single-flight per domain: concurrent callers wait for the first
    /// and then find its files in the cache.
    pub async fn issue_leaf(&self, domain: &str) -> Result<LeafPaths, CertificateError> {
        validate_domain(domain)?;

        if let Some(paths) = self.cached_leaf(domain).await {
            return Ok(paths);
        }

        let lock = self
            .issuing
            .entry(domain.to_string())
            .or_insert_with(|| Arc::new(TokioMutex::new(())))
            .value()
            .clone();

        let result = {
            let _guard = lock.lock().await;
            self.issue_locked(domain).await
        };

        // Drop the lock entry unless another caller still holds it
        let lock_ptr = Arc::as_ptr(&lock);
        drop(lock);
        self.issuing.remove_if(domain, |_, entry| {
            Arc::as_ptr(entry) == lock_ptr && Arc::strong_count(entry) == 1
        });

        result
    }

    async fn issue_locked(&self, domain: &str) -> Result<LeafPaths, CertificateError> {
        if let Some(paths) = self.cached_leaf(domain).await {
            return Ok(paths);
        }

        let root = self.root.clone();
        let paths = self.leaf_paths(domain);
        let owned_domain = domain.to_string();
        let result = tokio::task::spawn_blocking(move || {
            Self::generate_leaf(&root, &owned_domain, &paths).map(|()| paths)
        })
        .await
        .map_err(|e| CertificateError::Task(e.to_string()))??;

        self.issued.fetch_add(1, Ordering::SeqCst);
        info!("Certificate generated for {}", domain);
        Ok(result)
    }

    fn generate_leaf(
        root: &RootAuthority,
        domain: &str,
        paths: &LeafPaths,
    ) -> Result<(), CertificateError> {
        debug!("Generating certificate for {}", domain);

        let key = generate_key()?;
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, domain);
        dn.push(DnType::OrganizationName, ORGANIZATION);
        params.distinguished_name = dn;

        params.subject_alt_names = vec![
            SanType::DnsName(domain.to_string().try_into()?),
            SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            SanType::IpAddress(IpAddr::V6(Ipv6Addr::LOCALHOST)),
        ];
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);
        params.serial_number = Some(time_serial(now));

        let cert = params.signed_by(&key, &root.issuer, &root.key)?;

        if let Some(dir) = paths.cert_path.parent() {
            fs::create_dir_all(dir).map_err(|e| CertificateError::io(dir, e))?;
        }
        fs::write(&paths.key_path, key.serialize_pem())
            .map_err(|e| CertificateError::io(&paths.key_path, e))?;
        fs::write(&paths.cert_path, cert.pem())
            .map_err(|e| CertificateError::io(&paths.cert_path, e))?;

        Ok(())
    }

    /// Report whether a certificate for `domain` is cached, without issuing one
    pub async fn certificate_status(&self, domain: &str) -> CertificateStatus {
        let (exists, paths) = match self.cached_leaf(domain).await {
            Some(paths) => (true, paths),
            None => (false, self.leaf_paths(domain)),
        };
        CertificateStatus {
            domain: domain.to_string(),
            exists,
            key_path: paths.key_path,
            cert_path: paths.cert_path,
        }
    }

    /// Remove the cached leaf for exactly `domain`; `false` if there was none
    pub async fn delete_leaf(&self, domain: &str) -> Result<bool, CertificateError> {
        validate_domain(domain)?;
        let dir = self.certs_dir.join(Self::sanitize_domain(domain));

        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!("Deleted certificate for {}", domain);
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CertificateError::io(dir, e)),
        }
    }

    /// Build the TLS server configuration presented for `domain`
    ///
    /// Returns `None` (after logging) when no usable certificate can be produced; the
    /// handshake for that connection is then aborted.
    pub async fn build_tls_config(&self, domain: &str) -> Option<Arc<ServerConfig>> {
        match self.try_build_tls_config(domain).await {
            Ok(config) => Some(config),
            Err(e) => {
                error!("Failed to load certificate for {}: {}", domain, e);
                None
            }
        }
    }

    async fn try_build_tls_config(
        &self,
        domain: &str,
    ) -> Result<Arc<ServerConfig>, CertificateError> {
        let custom = self.store.find(domain).and_then(|m| {
            m.custom_certificate()
                .map(|(key, cert)| (key.to_path_buf(), cert.to_path_buf()))
        });

        let (key_path, cert_path, append_root) = match custom {
            Some((key, cert)) => {
                debug!("Using custom certificate for {}: {}", domain, cert.display());
                (key, cert, false)
            }
            None => {
                let leaf = self.issue_leaf(domain).await?;
                (leaf.key_path, leaf.cert_path, true)
            }
        };

        let key_pem = tokio::fs::read(&key_path)
            .await
            .map_err(|e| CertificateError::io(&key_path, e))?;
        let cert_pem = tokio::fs::read(&cert_path)
            .await
            .map_err(|e| CertificateError::io(&cert_path, e))?;

        let mut chain = certificates(&cert_path, &cert_pem)?;
        if append_root {
            chain.push(self.root.cert_der.clone());
        }
        let key = private_key(&key_path, &key_pem)?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key)?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Arc::new(config))
    }
}

/// RSA-2048 keys for the root and every leaf, signed with SHA-256
fn generate_key() -> Result<KeyPair, rcgen::Error> {
    KeyPair::generate_rsa_for(&PKCS_RSA_SHA256, RsaKeySize::_2048)
}

/// `*.b.example.local` for `a.b.example.local`; names of two labels have no parent
fn wildcard_parent(domain: &str) -> Option<String> {
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() > 2 && labels[0] != "*" {
        Some(format!("*.{}", labels[1..].join(".")))
    } else {
        None
    }
}

/// Domain names double as directory names, so keep them to hostname characters
fn validate_domain(domain: &str) -> Result<(), CertificateError> {
    let valid = !domain.is_empty()
        && domain.len() <= 253
        && !domain.starts_with('.')
        && !domain.contains("..")
        && domain
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '*'));

    if valid {
        Ok(())
    } else {
        Err(CertificateError::invalid(
            domain,
            "not a valid host name for a certificate",
        ))
    }
}

async fn is_complete(paths: &LeafPaths) -> bool {
    let key = tokio::fs::metadata(&paths.key_path).await;
    let cert = tokio::fs::metadata(&paths.cert_path).await;
    matches!((key, cert), (Ok(k), Ok(c)) if k.len() > 0 && c.len() > 0)
}

/// Serial derived from the issue time, so re-issues are distinguishable
fn time_serial(now: OffsetDateTime) -> SerialNumber {
    SerialNumber::from(now.unix_timestamp_nanos() as u64)
}

fn certificates(path: &Path, pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, CertificateError> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CertificateError::io(path, e))?;
    if certs.is_empty() {
        return Err(CertificateError::invalid(path, "no certificate found"));
    }
    Ok(certs)
}

fn first_certificate(path: &Path, pem: &[u8]) -> Result<CertificateDer<'static>, CertificateError> {
    certificates(path, pem).map(|mut certs| certs.swap_remove(0))
}

fn private_key(path: &Path, pem: &[u8]) -> Result<PrivateKeyDer<'static>, CertificateError> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| CertificateError::io(path, e))?
        .ok_or_else(|| CertificateError::invalid(path, "no private key found"))
}
