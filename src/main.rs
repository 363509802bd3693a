//! lamproxy - Main entry point
//!
//! Local domain proxy: mDNS names, HTTP/HTTPS reverse proxy and a local CA

use anyhow::{Context, Result};
use clap::Parser;
use lamproxy::{
    CertificateAuthority, Config, ControlApi, HostsFile, MappingStore, NameResponder,
    ProxyConfig, ProxyServer, Registry, ResponderConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// lamproxy - local domains for development servers
#[derive(Parser, Debug)]
#[command(name = "lamproxy")]
#[command(author = "LAM Contributors")]
#[command(version)]
#[command(about = "Serve project.local domains for local development servers")]
struct Args {
    /// Configuration file (created with defaults when missing)
    #[arg(long, env = "LAM_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP port to listen on
    #[arg(long, env = "HTTP_PORT")]
    http_port: Option<u16>,

    /// HTTPS port to listen on
    #[arg(long, env = "HTTPS_PORT")]
    https_port: Option<u16>,

    /// Mappings file
    #[arg(long, env = "LAM_STORAGE_PATH")]
    storage_path: Option<PathBuf>,

    /// Certificates directory
    #[arg(long, env = "LAM_CERTS_PATH")]
    certs_path: Option<PathBuf>,

    /// Enable the HTTPS listener
    #[arg(long, env = "ENABLE_HTTPS")]
    enable_https: bool,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Do not start the mDNS responder
    #[arg(long)]
    no_dns: bool,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(port) = self.http_port {
            config.http_port = port;
        }
        if let Some(port) = self.https_port {
            config.https_port = port;
        }
        if let Some(path) = &self.storage_path {
            config.storage_path = path.clone();
        }
        if let Some(path) = &self.certs_path {
            config.certs_path = path.clone();
        }
        if self.enable_https {
            config.enable_https = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting lamproxy v{}", env!("CARGO_PKG_VERSION"));

    let config_path = match args.config.clone() {
        Some(path) => path,
        None => Config::default_path().context("Cannot locate the default configuration")?,
    };
    let mut config = Config::load_or_create(&config_path)
        .with_context(|| format!("Failed to load configuration {}", config_path.display()))?;
    args.apply(&mut config);
    info!("Configuration loaded from {}", config_path.display());

    let store = Arc::new(MappingStore::open(&config.storage_path, config.enable_https));

    let ca = Arc::new(
        CertificateAuthority::new(&config.certs_path, store.clone())
            .context("Failed to initialize certificate authority")?,
    );
    info!(
        "Certificate authority ready; trust {} to avoid browser warnings",
        ca.root_cert_path().display()
    );

    let hosts = config
        .auto_update_hosts
        .then(|| HostsFile::new(&config.hosts_file));
    let registry = Arc::new(Registry::new(store.clone(), ca.clone(), hosts));

    if !args.no_dns {
        match NameResponder::bind(ResponderConfig::default(), store.clone()) {
            Ok(responder) => {
                tokio::spawn(async move {
                    if let Err(e) = responder.run().await {
                        error!("DNS responder stopped: {:#}", e);
                    }
                });
            }
            Err(e) => warn!("DNS responder disabled: {:#}", e),
        }
    }

    let proxy_config = ProxyConfig {
        http_port: config.http_port,
        https_port: config.https_port,
        enable_https: config.enable_https,
        enable_websocket_proxy: config.enable_web_socket_proxy,
        ..ProxyConfig::default()
    };

    info!("HTTP port: {}", proxy_config.http_port);
    if proxy_config.enable_https {
        info!("HTTPS port: {}", proxy_config.https_port);
    }

    let server = Arc::new(ProxyServer::new(
        proxy_config,
        store.clone(),
        ca,
        Arc::new(ControlApi::new(registry)),
    ));

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            if store.is_dirty() && !store.flush() {
                warn!("Unsaved mapping changes could not be written to {}", store.path().display());
            }
        }
    }

    Ok(())
}
