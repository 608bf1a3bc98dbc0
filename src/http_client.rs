//! Shared HTTP client for every job.
//!
//! One client is built per process and handed to the fetcher as an
//! `Arc<Client>`, so all workers reuse the same connection pool, TLS sessions
//! and DNS cache.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::{Certificate, Client};

const USER_AGENT: &str = concat!("vulnharvest/", env!("CARGO_PKG_VERSION"));

/// The FSTEC file server rejects unknown agents, so downloads present a browser one.
pub const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows; U; Windows NT 6.1; WOW64) Gecko/20130401 Firefox/63.8";

const SCRAPE_TIMEOUT: Duration = Duration::from_secs(30);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Settings that differ between the scraping and download jobs
#[derive(Debug, Clone)]
pub struct HttpClientOptions {
    pub user_agent: String,
    pub timeout: Duration,
    /// Extra trusted root certificate (PEM)
    pub ca_cert: Option<PathBuf>,
}

impl HttpClientOptions {
    /// Options for HTML page scraping
    pub fn scraping() -> Self {
        Self {
            user_agent: USER_AGENT.to_string(),
            timeout: SCRAPE_TIMEOUT,
            ca_cert: None,
        }
    }

    /// Options for bulk file downloads from a server signed by a private CA
    pub fn download(ca_cert: PathBuf) -> Self {
        Self {
            user_agent: BROWSER_USER_AGENT.to_string(),
            timeout: DOWNLOAD_TIMEOUT,
            ca_cert: Some(ca_cert),
        }
    }
}

pub fn create_shared_client(options: &HttpClientOptions) -> anyhow::Result<Arc<Client>> {
    let mut builder = Client::builder()
        .user_agent(options.user_agent.as_str())
        .timeout(options.timeout)
        .connect_timeout(CONNECT_TIMEOUT)
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(10)
        .tcp_keepalive(Duration::from_secs(60));

    if let Some(path) = &options.ca_cert {
        let pem = std::fs::read(path)
            .with_context(|| format!("failed to read CA certificate {}", path.display()))?;
        let certs = Certificate::from_pem_bundle(&pem)
            .with_context(|| format!("invalid CA certificate {}", path.display()))?;
        // Bytes without any PEM block parse as an empty bundle
        anyhow::ensure!(
            !certs.is_empty(),
            "invalid CA certificate {}: no PEM certificate found",
            path.display()
        );
        tracing::info!(
            path = %path.display(),
            certificates = certs.len(),
            "trusting additional CA certificate"
        );
        for cert in certs {
            builder = builder.add_root_certificate(cert);
        }
    }

    let client = builder.build().context("failed to build HTTP client")?;
    Ok(Arc::new(client))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_scraping_client() {
        let client = create_shared_client(&HttpClientOptions::scraping()).unwrap();
        assert_eq!(Arc::strong_count(&client), 1);
    }

    #[test]
    fn test_client_can_be_shared() {
        let client = create_shared_client(&HttpClientOptions::scraping()).unwrap();
        let worker = Arc::clone(&client);
        assert_eq!(Arc::strong_count(&client), 2);
        drop(worker);
        assert_eq!(Arc::strong_count(&client), 1);
    }

    #[test]
    fn test_download_options() {
        let options = HttpClientOptions::download(PathBuf::from("fstek.pem"));
        assert_eq!(options.user_agent, BROWSER_USER_AGENT);
        assert_eq!(options.timeout, DOWNLOAD_TIMEOUT);
        assert_eq!(options.ca_cert, Some(PathBuf::from("fstek.pem")));
    }

    #[test]
    fn test_missing_certificate_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let options = HttpClientOptions::download(dir.path().join("absent.pem"));
        let err = create_shared_client(&options).unwrap_err();
        assert!(format!("{err:#}").contains("failed to read CA certificate"));
    }

    #[test]
    fn test_garbage_certificate_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.pem");
        std::fs::write(&path, b"not a certificate at all").unwrap();

        let err = create_shared_client(&HttpClientOptions::download(path)).unwrap_err();
        assert!(format!("{err:#}").contains("invalid CA certificate"));
    }
}
