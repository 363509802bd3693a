//! Mapping store: the domain -> backend table every listener routes from
//! Kept in memory and persisted as a JSON document after each mutation

use crate::error::StoreError;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};

/// Represents a domain mapping configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mapping {
    pub domain: String,
    pub port: u16,
    #[serde(default)]
    pub https: bool,
    #[serde(default = "default_proxy")]
    pub proxy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_key_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_cert_path: Option<PathBuf>,
}

fn default_proxy() -> bool {
    true
}

impl Mapping {
    pub fn new(domain: impl Into<String>, port: u16) -> Self {
        Self {
            domain: domain.into(),
            port,
            https: false,
            proxy: true,
            cert_key_path: None,
            cert_cert_path: None,
        }
    }

    /// Both halves of a user-supplied certificate, if configured
    pub fn custom_certificate(&self) -> Option<(&Path, &Path)> {
        match (&self.cert_key_path, &self.cert_cert_path) {
            (Some(key), Some(cert)) => Some((key.as_path(), cert.as_path())),
            _ => None,
        }
    }
}

/// The persisted document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mappings {
    pub mappings: Vec<Mapping>,
}

impl Mappings {
    pub fn find(&self, domain: &str) -> Option<&Mapping> {
        self.mappings.iter().find(|m| m.domain == domain)
    }

    fn position(&self, domain: &str) -> Option<usize> {
        self.mappings.iter().position(|m| m.domain == domain)
    }
}

/// Result of a registration, as handed back to API callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Registration {
    pub domain: String,
    pub url: String,
    pub port: u16,
    pub https: bool,
}

/// Thread-safe mapping store
///
/// Lookups take a read lock on the in-memory table. Mutations are serialized by
/// `write_lock`, which is held across the disk write so documents land in order.
pub struct MappingStore {
    path: PathBuf,
    force_https: bool,
    table: RwLock<Mappings>,
    write_lock: Mutex<()>,
    dirty: AtomicBool,
}

impl MappingStore {
    /// Load the store from `path`
    ///
    /// A missing file yields an empty table. An unparsable file is moved aside to
    /// `<file>.corrupt` so the next write cannot destroy it. With `force_https` every
    /// loaded mapping is upgraded to `https = true` and the file is rewritten once.
    pub fn open<P: AsRef<Path>>(path: P, force_https: bool) -> Self {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                warn!("Cannot create mappings directory {}: {}", parent.display(), e);
            }
        }

        let mut table = match Self::load(&path) {
            Ok(table) => table,
            Err(e) => {
                error!("Error loading mappings from {}: {}", path.display(), e);
                if e.kind() == io::ErrorKind::InvalidData {
                    Self::set_aside(&path);
                }
                Mappings::default()
            }
        };

        let mut migrated = false;
        if force_https {
            for mapping in table.mappings.iter_mut().filter(|m| !m.https) {
                mapping.https = true;
                migrated = true;
            }
        }

        info!("Loaded {} mapping(s) from {}", table.mappings.len(), path.display());

        let store = Self {
            path,
            force_https,
            table: RwLock::new(table),
            write_lock: Mutex::new(()),
            dirty: AtomicBool::new(false),
        };

        if migrated {
            info!("Upgraded existing mappings to HTTPS");
            let _guard = store.write_lock.lock();
            store.persist();
        }

        store
    }

    fn load(path: &Path) -> io::Result<Mappings> {
        match fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Mappings::default()),
            Err(e) => Err(e),
        }
    }

    /// Rename an unreadable mappings file to `<file>.corrupt`
    fn set_aside(path: &Path) {
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(".corrupt");
        let target = path.with_file_name(name);

        match fs::rename(path, &target) {
            Ok(()) => warn!("Moved unreadable mappings file to {}", target.display()),
            Err(e) => error!("Cannot move {} aside: {}", path.display(), e),
        }
    }

    /// Get the storage path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether CA-wide HTTPS is enabled
    pub fn force_https(&self) -> bool {
        self.force_https
    }

    /// Snapshot of the whole table
    pub fn get(&self) -> Mappings {
        self.table.read().clone()
    }

    /// Exact lookup by domain
    pub fn find(&self, domain: &str) -> Option<Mapping> {
        self.table.read().find(domain).cloned()
    }

    /// Case-insensitive existence check, as name lookups need
    pub fn resolves(&self, name: &str) -> bool {
        self.table
            .read()
            .mappings
            .iter()
            .any(|m| m.domain.eq_ignore_ascii_case(name))
    }

    pub fn len(&self) -> usize {
        self.table.read().mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register `project.tld` -> `port`, replacing any existing entry for the domain
    ///
    /// Custom certificate paths of a replaced entry survive. The returned URL uses
    /// `https` only when the mapping asks for it and HTTPS is enabled globally.
    pub fn upsert(
        &self,
        project: &str,
        port: u16,
        https: bool,
        tld: &str,
    ) -> Result<Registration, StoreError> {
        let project = project.trim().trim_end_matches('.');
        let tld = tld.trim().trim_start_matches('.');
        if project.is_empty() || tld.is_empty() {
            return Err(StoreError::Invalid(
                "project and tld must not be empty".to_string(),
            ));
        }
        if port == 0 {
            return Err(StoreError::Invalid("port must be non-zero".to_string()));
        }

        let domain = format!("{}.{}", project, tld);
        let https = https || self.force_https;

        let _guard = self.write_lock.lock();
        {
            let mut table = self.table.write();
            match table.position(&domain) {
                Some(index) => {
                    let existing = &mut table.mappings[index];
                    existing.port = port;
                    existing.https = https;
                    existing.proxy = true;
                    debug!("Replaced mapping {} -> {}", domain, port);
                }
                None => {
                    let mut mapping = Mapping::new(domain.clone(), port);
                    mapping.https = https;
                    table.mappings.push(mapping);
                    debug!("Added mapping {} -> {}", domain, port);
                }
            }
        }
        self.persist();

        let scheme = if https && self.force_https { "https" } else { "http" };
        Ok(Registration {
            url: format!("{}://{}", scheme, domain),
            domain,
            port,
            https,
        })
    }

    /// Delete the mapping for `domain`
    pub fn remove(&self, domain: &str) -> Result<Mapping, StoreError> {
        let _guard = self.write_lock.lock();
        let removed = {
            let mut table = self.table.write();
            let index = table
                .position(domain)
                .ok_or_else(|| StoreError::NotFound(domain.to_string()))?;
            table.mappings.remove(index)
        };
        self.persist();
        Ok(removed)
    }

    /// Flip between proxy and redirect mode
    pub fn toggle_proxy(&self, domain: &str) -> Result<Mapping, StoreError> {
        self.modify(domain, |m| m.proxy = !m.proxy)
    }

    /// Set (or clear, with `None`) the user-supplied certificate for `domain`
    pub fn set_certificate(
        &self,
        domain: &str,
        paths: Option<(PathBuf, PathBuf)>,
    ) -> Result<Mapping, StoreError> {
        self.modify(domain, |m| match paths {
            Some((key, cert)) => {
                m.cert_key_path = Some(key);
                m.cert_cert_path = Some(cert);
            }
            None => {
                m.cert_key_path = None;
                m.cert_cert_path = None;
            }
        })
    }

    fn modify<F>(&self, domain: &str, f: F) -> Result<Mapping, StoreError>
    where
        F: FnOnce(&mut Mapping),
    {
        let _guard = self.write_lock.lock();
        let updated = {
            let mut table = self.table.write();
            let index = table
                .position(domain)
                .ok_or_else(|| StoreError::NotFound(domain.to_string()))?;
            f(&mut table.mappings[index]);
            table.mappings[index].clone()
        };
        self.persist();
        Ok(updated)
    }

    /// True when the last write did not reach the disk
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Retry persisting the current table
    pub fn flush(&self) -> bool {
        let _guard = self.write_lock.lock();
        self.persist()
    }

    /// Write the whole document; callers hold `write_lock`
    fn persist(&self) -> bool {
        let snapshot = self.table.read().clone();
        match self.write_document(&snapshot) {
            Ok(()) => {
                if self.dirty.swap(false, Ordering::SeqCst) {
                    info!("Mappings persisted again to {}", self.path.display());
                }
                true
            }
            Err(e) => {
                warn!(
                    "Error saving mappings to {} (keeping them in memory): {}",
                    self.path.display(),
                    e
                );
                self.dirty.store(true, Ordering::SeqCst);
                false
            }
        }
    }

    fn write_document(&self, mappings: &Mappings) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(mappings)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)
    }
}
