// src/fetch/mod.rs

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::instrument;

pub mod archive;
pub mod urls;
pub mod zips;

/// Where report listings and report bodies come from.
#[async_trait]
pub trait ReportSource: Send + Sync {
    /// Report URLs under a listing, newest first.
    async fn list_reports(&self, listing_url: &str) -> Result<Vec<String>>;

    /// Decompressed text of the single CSV inside the report at `url`.
    async fn fetch_report(&self, url: &str) -> Result<String>;
}

/// Byte caps applied before and after decompression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchLimits {
    pub max_archive_bytes: u64,
    pub max_member_bytes: u64,
}

impl Default for FetchLimits {
    fn default() -> Self {
        // DispatchIS zips are ~20 KiB and inflate to well under 1 MiB
        Self {
            max_archive_bytes: 16 * 1024 * 1024,
            max_member_bytes: 64 * 1024 * 1024,
        }
    }
}

/// NEMweb over HTTPS.
#[derive(Clone)]
pub struct HttpReportSource {
    client: Client,
    limits: FetchLimits,
}

impl HttpReportSource {
    pub fn new(client: Client, limits: FetchLimits) -> Self {
        Self { client, limits }
    }

    pub fn build_client(user_agent: &str, timeout: Duration) -> Result<Client> {
        Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
            .context("building HTTP client")
    }
}

#[async_trait]
impl ReportSource for HttpReportSource {
    async fn list_reports(&self, listing_url: &str) -> Result<Vec<String>> {
        urls::list_report_urls(&self.client, listing_url)
            .await
            .with_context(|| format!("listing {}", listing_url))
    }

    #[instrument(level = "info", skip(self))]
    async fn fetch_report(&self, url: &str) -> Result<String> {
        let bytes = zips::download_zip(&self.client, url, self.limits.max_archive_bytes).await?;

        // offload the inflate to the blocking pool
        let max_member = self.limits.max_member_bytes;
        let text =
            tokio::task::spawn_blocking(move || archive::read_single_csv(&bytes, max_member))
                .await
                .context("decompression task panicked")?
                .with_context(|| format!("unpacking {}", url))?;
        Ok(text)
    }
}
