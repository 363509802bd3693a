//! CLI tool for managing domain mappings on a running lamproxy
//!
//! Usage:
//!   lamproxy-mapping add <project> <port> [--https] [--tld <tld>]
//!   lamproxy-mapping remove <domain>
//!   lamproxy-mapping toggle <domain>
//!   lamproxy-mapping list [--json]
//!   lamproxy-mapping ca [--der] [--output <file>]
//!   lamproxy-mapping cert status|issue|delete <domain>

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use lamproxy::Mappings;
use reqwest::{Client, Method, Response};
use serde_json::{json, Value};
use std::path::PathBuf;

/// CLI tool for managing lamproxy domain mappings
#[derive(Parser, Debug)]
#[command(name = "lamproxy-mapping")]
#[command(author = "LAM Contributors")]
#[command(version)]
#[command(about = "Manage domain mappings of a running lamproxy")]
struct Args {
    /// Base URL of the lamproxy control API
    #[arg(long, env = "LAM_URL", default_value = "http://localhost")]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register <project>.<tld> for a local port
    Add {
        /// Project name (e.g., myapp)
        project: String,

        /// Backend port
        port: u16,

        /// Serve the domain over HTTPS
        #[arg(long)]
        https: bool,

        /// Top level domain
        #[arg(long, default_value = "local")]
        tld: String,
    },

    /// Remove a domain mapping
    Remove {
        /// Domain name (e.g., myapp.local)
        domain: String,
    },

    /// Switch a domain between proxy and redirect mode
    Toggle {
        /// Domain name
        domain: String,
    },

    /// List all mappings
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Download the root CA certificate
    Ca {
        /// DER encoding instead of PEM
        #[arg(long)]
        der: bool,

        /// Write to a file instead of stdout
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,
    },

    /// Manage a domain's certificate
    Cert {
        #[command(subcommand)]
        action: CertAction,
    },
}

#[derive(Subcommand, Debug)]
enum CertAction {
    /// Show whether a certificate is cached
    Status { domain: String },
    /// Issue (or return the cached) certificate
    Issue { domain: String },
    /// Delete the cached certificate
    Delete { domain: String },
}

struct ControlClient {
    client: Client,
    base_url: String,
}

impl ControlClient {
    fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn send(&self, method: Method, path: &str, body: Option<Value>) -> Result<Response> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.request(method, &url);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to reach lamproxy at {}", self.base_url))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|v| v["error"].as_str().map(str::to_string))
                .unwrap_or(text);
            bail!("{} ({})", message, status);
        }
        Ok(response)
    }

    async fn json(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        Ok(self.send(method, path, body).await?.json().await?)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let client = ControlClient::new(&args.url);

    match args.command {
        Commands::Add {
            project,
            port,
            https,
            tld,
        } => {
            let body = json!({ "project": project, "port": port, "https": https, "tld": tld });
            let result = client
                .json(Method::POST, "/api/register", Some(body))
                .await?;

            println!("Added mapping:");
            println!("  Domain: {}", result["domain"].as_str().unwrap_or("-"));
            println!("  URL:    {}", result["url"].as_str().unwrap_or("-"));
            println!("  Port:   {}", port);
        }

        Commands::Remove { domain } => {
            client
                .json(Method::DELETE, &format!("/api/mappings/{}", domain), None)
                .await?;
            println!("Removed mapping for {}", domain);
        }

        Commands::Toggle { domain } => {
            let result = client
                .json(Method::POST, &format!("/api/mappings/{}/proxy", domain), None)
                .await?;
            let proxy = result["mapping"]["proxy"].as_bool().unwrap_or(true);
            println!(
                "{} is now in {} mode",
                domain,
                if proxy { "proxy" } else { "redirect" }
            );
        }

        Commands::List { json } => {
            let mappings: Mappings = client
                .send(Method::GET, "/api/mappings", None)
                .await?
                .json()
                .await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&mappings)?);
            } else if mappings.mappings.is_empty() {
                println!("No mappings found.");
            } else {
                println!("Found {} mapping(s):\n", mappings.mappings.len());
                for mapping in &mappings.mappings {
                    println!(
                        "  {} -> localhost:{}{}{}",
                        mapping.domain,
                        mapping.port,
                        if mapping.https { " [https]" } else { "" },
                        if mapping.proxy { "" } else { " [redirect]" }
                    );
                }
            }
        }

        Commands::Ca { der, output } => {
            let path = if der { "/api/ca?format=der" } else { "/api/ca" };
            let bytes = client.send(Method::GET, path, None).await?.bytes().await?;

            match output {
                Some(file) => {
                    std::fs::write(&file, &bytes)
                        .with_context(|| format!("Failed to write {}", file.display()))?;
                    println!("Root certificate written to {}", file.display());
                }
                None if der => bail!("Refusing to print DER to the terminal; use --output"),
                None => print!("{}", String::from_utf8_lossy(&bytes)),
            }
        }

        Commands::Cert { action } => {
            let (method, domain) = match &action {
                CertAction::Status { domain } => (Method::GET, domain),
                CertAction::Issue { domain } => (Method::POST, domain),
                CertAction::Delete { domain } => (Method::DELETE, domain),
            };
            let result = client
                .json(method, &format!("/api/certificates/{}", domain), None)
                .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }

    Ok(())
}
