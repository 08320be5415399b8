//! Reachability checks run by validate actions.

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;
use tradestore_core::{Error, Result};
use url::Url;

/// Build the URL to probe from a stack output and a path.
///
/// Load balancer outputs are bare DNS names, so `http://` is assumed when the
/// address has no scheme.
pub fn probe_url(address: &str, path: &str) -> Result<Url> {
    let address = address.trim();
    let base = if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    };
    let base = Url::parse(&base)
        .map_err(|e| Error::InvalidInput(format!("invalid address '{}': {}", address, e)))?;
    base.join(path)
        .map_err(|e| Error::InvalidInput(format!("invalid path '{}': {}", path, e)))
}

#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    /// Request `url` and return the response status code.
    async fn probe(&self, url: &Url) -> Result<u16>;
}

/// Probes over HTTP with `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build http client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ReachabilityProbe for HttpProbe {
    async fn probe(&self, url: &Url) -> Result<u16> {
        debug!(url = %url, "Probing");
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| Error::ExecutionFailed(format!("{} is unreachable: {}", url, e)))?;
        Ok(response.status().as_u16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_probe_url() {
        let url = probe_url("web-123.us-west-2.elb.amazonaws.com", "/health").unwrap();
        assert_eq!(url.as_str(), "http://web-123.us-west-2.elb.amazonaws.com/health");

        let url = probe_url("https://example.com/", "/health").unwrap();
        assert_eq!(url.as_str(), "https://example.com/health");

        assert!(probe_url("", "/health").is_err());
    }

    #[tokio::test]
    async fn test_http_probe_reports_status() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok")
                .await
                .unwrap();
        });

        let probe = HttpProbe::new(Duration::from_secs(5)).unwrap();
        let url = probe_url(&addr.to_string(), "/health").unwrap();
        assert_eq!(probe.probe(&url).await.unwrap(), 200);
    }

    #[tokio::test]
    async fn test_http_probe_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let probe = HttpProbe::new(Duration::from_secs(2)).unwrap();
        let url = probe_url(&addr.to_string(), "/health").unwrap();
        assert!(probe.probe(&url).await.is_err());
    }
}
