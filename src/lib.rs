//! lamproxy - local domains for development servers
//!
//! Maps `project.local` style names to ports on this machine:
//! - JSON mapping store shared by every component
//! - mDNS responder answering registered names with the loopback address
//! - HTTP and HTTPS reverse proxy routing by Host header (WebSocket aware)
//! - Local certificate authority issuing per-domain certificates on demand
//! - JSON control API for mapping and certificate management

pub mod certificate;
pub mod config;
pub mod control;
pub mod dns;
pub mod error;
pub mod hosts;
pub mod https;
pub mod mappings;
pub mod proxy;

pub use certificate::{CertificateAuthority, CertificateStatus, LeafPaths};
pub use config::Config;
pub use control::{CaFormat, ControlApi, Registry};
pub use dns::{NameResponder, ResponderConfig};
pub use error::{CertificateError, ProxyError, StoreError};
pub use hosts::HostsFile;
pub use mappings::{Mapping, MappingStore, Mappings, Registration};
pub use proxy::{Fallback, ProxyBody, ProxyConfig, ProxyServer};
