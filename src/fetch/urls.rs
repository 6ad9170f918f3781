// src/fetch/urls.rs
use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use scraper::{Html, Selector};
use std::cmp::Ordering;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, instrument, warn};
use url::Url;

pub const DISPATCH_IS_URL: &str = "https://nemweb.com.au/Reports/Current/DispatchIS_Reports/";
pub const TRADING_IS_URL: &str = "https://nemweb.com.au/Reports/Current/TradingIS_Reports/";

const MAX_RETRIES: usize = 3;
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// `PUBLIC_DISPATCHIS_202509111655_0000000480215212.zip` → `202509111655`
static REPORT_STAMP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)_(\d{12})(?:_\d+)?\.zip$").expect("report stamp regex"));

/// The `YYYYMMDDHHMM` stamp AEMO puts in report file names.
pub fn report_stamp(url: &str) -> Option<&str> {
    REPORT_STAMP
        .captures(url)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Newest first by file-name stamp; unstamped names go last, in listing order.
pub fn sort_newest_first(urls: &mut [String]) {
    urls.sort_by(|a, b| match (report_stamp(a), report_stamp(b)) {
        (Some(x), Some(y)) => y.cmp(x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
}

/// All `.zip` links in a directory listing, resolved against `base`.
pub fn parse_zip_links(html: &str, base: &Url) -> Vec<String> {
    let selector = Selector::parse(r#"a[href$=".zip"], a[href$=".ZIP"]"#)
        .expect("CSS selector for ZIP links should be valid");
    let mut links = Html::parse_document(html)
        .select(&selector)
        .filter_map(|e| e.value().attr("href"))
        .filter_map(|href| base.join(href).ok())
        .map(|u| u.to_string())
        .collect::<Vec<_>>();
    links.dedup();
    links
}

/// Fetch a NEMweb directory listing and return its report URLs, newest first.
#[instrument(level = "debug", skip(client))]
pub async fn list_report_urls(client: &Client, listing_url: &str) -> Result<Vec<String>> {
    let base = Url::parse(listing_url)?;
    let mut attempt = 0;

    // retry loop
    let html = loop {
        attempt += 1;

        match client.get(base.clone()).send().await {
            Ok(resp) if resp.status().is_success() => match resp.text().await {
                Ok(html) => break html,
                Err(e) if attempt < MAX_RETRIES => {
                    warn!(%listing_url, attempt, error = %e, "reading listing failed, retrying");
                    sleep(RETRY_DELAY).await;
                }
                Err(e) => return Err(e.into()),
            },
            Err(e) if attempt < MAX_RETRIES => {
                warn!(%listing_url, attempt, error = %e, "listing request failed, retrying");
                sleep(RETRY_DELAY).await;
            }
            Ok(resp) => return Err(anyhow::anyhow!("HTTP error: {}", resp.status())),
            Err(e) => return Err(e.into()),
        }
    };

    let mut urls = parse_zip_links(&html, &base);
    sort_newest_first(&mut urls);
    debug!(count = urls.len(), "listed reports");
    Ok(urls)
}
