use crate::ingest::AnalyzerSource;
use anyhow::{Context, Result};
use bytes::Bytes;
use futures::future::BoxFuture;
use reqwest::Client;
use std::time::Duration;

/// REST analyzer reachable at `http://<ip><path>`.
pub struct HttpAnalyzer {
    ip: String,
    url: String,
    client: Client,
}

impl HttpAnalyzer {
    pub fn new(client: Client, ip: &str, path: &str) -> Self {
        let ip = ip.trim().to_string();
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        let url = format!("http://{ip}{path}");
        Self { ip, url, client }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn fetch(&self) -> Result<Bytes> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .with_context(|| format!("request {}", self.url))?
            .error_for_status()
            .with_context(|| format!("analyzer {} returned error status", self.ip))?;
        let body = response.bytes().await.context("read analyzer body")?;
        Ok(body)
    }
}

impl AnalyzerSource for HttpAnalyzer {
    fn id(&self) -> &str {
        &self.ip
    }

    fn poll(&self) -> BoxFuture<'_, Result<Bytes>> {
        Box::pin(self.fetch())
    }
}

pub fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .context("build analyzer HTTP client")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_joins_ip_and_path() {
        let client = build_client(Duration::from_secs(1)).unwrap();
        let analyzer = HttpAnalyzer::new(client.clone(), " 192.168.1.130 ", "api/measurement");
        assert_eq!(analyzer.id(), "192.168.1.130");
        assert_eq!(analyzer.url(), "http://192.168.1.130/api/measurement");

        let analyzer = HttpAnalyzer::new(client, "192.168.1.131", "/status");
        assert_eq!(analyzer.url(), "http://192.168.1.131/status");
    }
}
