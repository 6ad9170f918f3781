use anyhow::{bail, Context, Result};
use futures_util::StreamExt;
use reqwest::Client;
use tracing::{debug, instrument};

/// Download the ZIP at `url` into memory, refusing bodies larger than
/// `max_bytes`.
#[instrument(level = "debug", skip(client))]
pub async fn download_zip(client: &Client, url: &str, max_bytes: u64) -> Result<Vec<u8>> {
    let resp = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("GET {}", url))?
        .error_for_status()
        .with_context(|| format!("non-success status from {}", url))?;

    if let Some(len) = resp.content_length() {
        if len > max_bytes {
            bail!("{} is {} bytes, over the {} byte limit", url, len, max_bytes);
        }
    }

    let mut zip_data = Vec::new();
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.with_context(|| format!("reading body from {}", url))?;
        if zip_data.len() as u64 + chunk.len() as u64 > max_bytes {
            bail!("{} exceeded the {} byte limit", url, max_bytes);
        }
        zip_data.extend_from_slice(&chunk);
    }

    debug!(bytes = zip_data.len(), "download complete");
    Ok(zip_data)
}
