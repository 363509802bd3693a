//! Hosts file editing for the legacy `autoUpdateHosts` mode
//! Only lines of the exact form `127.0.0.1 <domain>` are ever added or removed

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub struct HostsFile {
    path: PathBuf,
}

impl HostsFile {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn entry(domain: &str) -> String {
        format!("127.0.0.1 {}", domain)
    }

    fn read_lines(&self) -> io::Result<Vec<String>> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(content.lines().map(str::to_string).collect()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    fn write_lines(&self, lines: &[String]) -> io::Result<()> {
        let mut content = lines.join("\n");
        content.push('\n');
        fs::write(&self.path, content)
    }

    /// Add the loopback entry for `domain`; `Ok(false)` if it was already present
    pub fn add(&self, domain: &str) -> io::Result<bool> {
        let entry = Self::entry(domain);
        let mut lines = self.read_lines()?;
        if lines.iter().any(|line| line.trim() == entry) {
            debug!("Entry {} already exists in hosts file", entry);
            return Ok(false);
        }
        lines.push(entry);
        self.write_lines(&lines)?;
        info!("Added {} to {}", domain, self.path.display());
        Ok(true)
    }

    /// Remove the loopback entry for `domain`; `Ok(false)` if there was none
    pub fn remove(&self, domain: &str) -> io::Result<bool> {
        let entry = Self::entry(domain);
        let lines = self.read_lines()?;
        let kept: Vec<String> = lines
            .iter()
            .filter(|line| line.trim() != entry)
            .cloned()
            .collect();
        if kept.len() == lines.len() {
            return Ok(false);
        }
        self.write_lines(&kept)?;
        info!("Removed {} from {}", domain, self.path.display());
        Ok(true)
    }

    /// Best-effort variants used by the registry: failures are logged only
    pub fn try_add(&self, domain: &str) {
        if let Err(e) = self.add(domain) {
            warn!("Could not update {}: {}", self.path.display(), e);
        }
    }

    pub fn try_remove(&self, domain: &str) {
        if let Err(e) = self.remove(domain) {
            warn!("Could not update {}: {}", self.path.display(), e);
        }
    }
}
