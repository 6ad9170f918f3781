// src/collect/mod.rs
use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::{fmt, sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use crate::feed::{FeedKind, PriceFeed};
use crate::fetch::ReportSource;
use crate::history::{PriceHistory, PriceRow};
use crate::process::{extract_table_prices, DataQuality, PriceMap};

pub mod supervisor;

pub use supervisor::{JobState, Supervisor};

/// Outcome of collecting one feed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Collection {
    pub feed: FeedKind,
    pub source_name: String,
    /// Report the prices came from; `None` when no file yielded data.
    pub source_url: Option<String>,
    /// Report files fetched before stopping.
    pub attempts: usize,
    /// New rows written to the history, if one was given.
    pub stored: usize,
    /// Set when some observations could not be written to the history.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_error: Option<String>,
    pub prices: PriceMap,
}

impl Collection {
    pub fn quality(&self) -> DataQuality {
        self.prices.quality
    }
}

/// Walks a feed's reports newest-first until one carries a price table.
pub struct Collector {
    source: Arc<dyn ReportSource>,
    max_attempts: usize,
    attempt_delay: Duration,
}

impl Collector {
    pub fn new(
        source: Arc<dyn ReportSource>,
        max_attempts: usize,
        attempt_delay: Duration,
    ) -> Self {
        Self {
            source,
            max_attempts: max_attempts.max(1),
            attempt_delay,
        }
    }

    /// Listing failures are errors; failures on individual report files
    /// only move on to the next file.
    #[instrument(level = "info", skip(self, feed), fields(feed = %feed.kind))]
    pub async fn collect(&self, feed: &PriceFeed) -> Result<Collection> {
        let urls = self
            .source
            .list_reports(&feed.listing_url)
            .await
            .with_context(|| format!("listing reports for {}", feed.name))?;
        if urls.is_empty() {
            warn!(listing = %feed.listing_url, "listing has no reports");
        }

        let mut attempts = 0;
        let mut found: Option<(String, PriceMap)> = None;
        for url in urls.iter().take(self.max_attempts) {
            if attempts > 0 && !self.attempt_delay.is_zero() {
                sleep(self.attempt_delay).await;
            }
            attempts += 1;

            let text = match self.source.fetch_report(url).await {
                Ok(t) => t,
                Err(e) => {
                    warn!(%url, error = %format!("{:#}", e), "report fetch failed");
                    continue;
                }
            };
            let map = extract_table_prices(&text, &feed.table, Utc::now());
            if map.is_real() {
                info!(%url, regions = map.prices.len(), "extracted prices");
                found = Some((url.clone(), map));
                break;
            }
            warn!(%url, "no price rows in report");
        }

        let (source_url, mut prices) = match found {
            Some((url, map)) => (Some(url), map),
            None => {
                warn!(attempts, "no price data found in any report");
                (None, PriceMap::unavailable(Utc::now(), None))
            }
        };
        feed.fallback.apply(&mut prices);

        Ok(Collection {
            feed: feed.kind,
            source_name: feed.name.clone(),
            source_url,
            attempts,
            stored: 0,
            store_error: None,
            prices,
        })
    }

    /// [`Collector::collect`], then persist every REAL observation. A failed
    /// write is recorded on the returned collection rather than discarding it.
    pub async fn collect_and_store(
        &self,
        feed: &PriceFeed,
        history: &Arc<PriceHistory>,
    ) -> Result<Collection> {
        let mut collection = self.collect(feed).await?;

        let snapshot = collection.clone();
        let history = Arc::clone(history);
        let written = tokio::task::spawn_blocking(move || store(&snapshot, &history))
            .await
            .context("history write task failed")?;
        match written {
            Ok(n) => collection.stored = n,
            Err(e) => {
                let e = e.downcast::<PartialStore>().map_err(|e| e.context("storing prices"))?;
                warn!(stored = e.stored, failed = e.failed, "some prices were not stored");
                collection.stored = e.stored;
                collection.store_error = Some(e.to_string());
            }
        }
        Ok(collection)
    }
}

/// Some observations were written and some were not.
#[derive(Debug)]
pub struct PartialStore {
    pub stored: usize,
    pub failed: usize,
    pub first_error: String,
}

impl fmt::Display for PartialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} observation(s) not stored ({} stored): {}",
            self.failed, self.stored, self.first_error
        )
    }
}

impl std::error::Error for PartialStore {}

/// Write the REAL observations of `collection`; returns how many were new.
/// Every observation is attempted; failures come back as [`PartialStore`].
pub fn store(collection: &Collection, history: &PriceHistory) -> Result<usize> {
    let Some(source) = collection.source_url.as_deref() else {
        return Ok(0);
    };
    let mut stored = 0;
    let mut failed = 0;
    let mut first_error = None;
    for obs in collection
        .prices
        .prices
        .values()
        .filter(|o| o.data_quality == DataQuality::Real)
    {
        let row = PriceRow::from_observation(
            obs,
            collection.feed.as_str(),
            source,
            collection.prices.captured_at,
        );
        match history.add(&row) {
            Ok(true) => stored += 1,
            Ok(false) => {}
            Err(e) => {
                warn!(region = %obs.region, error = %format!("{:#}", e), "price not stored");
                failed += 1;
                first_error.get_or_insert_with(|| format!("{:#}", e));
            }
        }
    }
    debug!(stored, failed, "stored observations");
    match first_error {
        None => Ok(stored),
        Some(first_error) => Err(PartialStore {
            stored,
            failed,
            first_error,
        }
        .into()),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory stand-in for NEMweb.
    #[derive(Default)]
    pub struct FakeSource {
        pub listing: Vec<String>,
        pub reports: HashMap<String, Option<String>>,
        pub fetched: Mutex<Vec<String>>,
        pub fail_listing: bool,
    }

    impl FakeSource {
        pub fn with(mut self, url: &str, body: Option<&str>) -> Self {
            self.listing.push(url.to_string());
            self.reports.insert(url.to_string(), body.map(str::to_string));
            self
        }

        pub fn fetched(&self) -> Vec<String> {
            self.fetched.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ReportSource for FakeSource {
        async fn list_reports(&self, _listing_url: &str) -> Result<Vec<String>> {
            if self.fail_listing {
                return Err(anyhow!("listing unreachable"));
            }
            Ok(self.listing.clone())
        }

        async fn fetch_report(&self, url: &str) -> Result<String> {
            self.fetched.lock().unwrap().push(url.to_string());
            match self.reports.get(url) {
                Some(Some(body)) => Ok(body.clone()),
                _ => Err(anyhow!("404 for {}", url)),
            }
        }
    }

    pub fn dispatch_report(rows: &[(&str, &str)]) -> String {
        let mut out = String::from(
            "C,NEMP.WORLD,DISPATCHIS,AEMO,PUBLIC,2025/09/11,16:55:05,1,DISPATCHIS,1\n\
             I,DISPATCH,PRICE,5,SETTLEMENTDATE,RUNNO,REGIONID,DISPATCHINTERVAL,INTERVENTION,RRP\n",
        );
        for (region, rrp) in rows {
            out.push_str(&format!(
                "D,DISPATCH,PRICE,5,\"2025/09/11 16:55:00\",1,{},20250911200,0,{}\n",
                region, rrp
            ));
        }
        out.push_str("C,\"END OF REPORT\",4\n");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{dispatch_report, FakeSource};
    use super::*;
    use crate::feed::FallbackPolicy;
    use crate::process::Region;
    use tempfile::tempdir;

    fn collector(source: Arc<FakeSource>, attempts: usize) -> Collector {
        Collector::new(source, attempts, Duration::ZERO)
    }

    #[tokio::test]
    async fn stops_at_first_report_with_prices() {
        let source = Arc::new(
            FakeSource::default()
                .with("https://x/newest.zip", None)
                .with("https://x/no_table.zip", Some("C,NEMP.WORLD\nI,DISPATCH,CASESOLUTION,2\n"))
                .with(
                    "https://x/good.zip",
                    Some(dispatch_report(&[("NSW1", "95.43"), ("VIC1", "80")]).as_str()),
                )
                .with("https://x/older.zip", Some(dispatch_report(&[("NSW1", "1")]).as_str())),
        );
        let feed = FeedKind::DispatchIs.feed(FallbackPolicy::Leave);

        let c = collector(source.clone(), 5).collect(&feed).await.unwrap();
        assert_eq!(c.quality(), DataQuality::Real);
        assert_eq!(c.source_url.as_deref(), Some("https://x/good.zip"));
        assert_eq!(c.attempts, 3);
        assert_eq!(c.prices.price(Region::Nsw1), Some(95.43));
        assert_eq!(c.prices.prices.len(), 2);
        assert_eq!(source.fetched().len(), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts_with_zero_fill() {
        let source = Arc::new(
            FakeSource::default()
                .with("https://x/a.zip", None)
                .with("https://x/b.zip", None)
                .with("https://x/c.zip", Some(dispatch_report(&[("NSW1", "95.43")]).as_str())),
        );
        let feed = FeedKind::DispatchIs.feed(FallbackPolicy::ZeroFill);

        let c = collector(source.clone(), 2).collect(&feed).await.unwrap();
        assert_eq!(c.quality(), DataQuality::Unavailable);
        assert_eq!(c.source_url, None);
        assert_eq!(c.attempts, 2);
        assert_eq!(c.prices.prices.len(), 5);
        assert!(c
            .prices
            .prices
            .values()
            .all(|o| o.price == 0.0 && o.data_quality == DataQuality::Unavailable));
        assert_eq!(source.fetched(), vec!["https://x/a.zip", "https://x/b.zip"]);
    }

    #[tokio::test]
    async fn listing_failure_is_an_error() {
        let source = Arc::new(FakeSource {
            fail_listing: true,
            ..FakeSource::default()
        });
        let feed = FeedKind::DispatchIs.feed(FallbackPolicy::Leave);
        assert!(collector(source, 3).collect(&feed).await.is_err());
    }

    #[tokio::test]
    async fn stores_only_real_and_dedupes() {
        let tmp = tempdir().unwrap();
        let history = PriceHistory::new_prices(tmp.path()).unwrap();
        let source = Arc::new(FakeSource::default().with(
            "https://x/good.zip",
            Some(dispatch_report(&[("NSW1", "95.43"), ("SA1", "-3")]).as_str()),
        ));
        let feed = FeedKind::DispatchIs.feed(FallbackPolicy::ZeroFill);
        let col = collector(source, 3);

        let first = col.collect_and_store(&feed, &history).await.unwrap();
        assert_eq!(first.stored, 2);
        assert_eq!(first.prices.prices.len(), 5);

        let again = col.collect_and_store(&feed, &history).await.unwrap();
        assert_eq!(again.stored, 0);

        let rows = history.load_all().unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.source == "https://x/good.zip"));
    }

    #[tokio::test]
    async fn failed_write_keeps_the_collection() {
        let tmp = tempdir().unwrap();
        let history = PriceHistory::new_prices(tmp.path()).unwrap();
        let source = Arc::new(FakeSource::default().with(
            "https://x/good.zip",
            Some(dispatch_report(&[("NSW1", "95.43"), ("QLD1", "88.1")]).as_str()),
        ));
        let feed = FeedKind::DispatchIs.feed(FallbackPolicy::Leave);
        let col = collector(source, 3);

        let blocker = tmp.path().join("prices").join("date=20250911");
        std::fs::write(&blocker, b"in the way").unwrap();

        let c = col.collect_and_store(&feed, &history).await.unwrap();
        assert_eq!(c.quality(), DataQuality::Real);
        assert_eq!(c.prices.prices.len(), 2);
        assert_eq!(c.stored, 0);
        let err = c.store_error.unwrap();
        assert!(err.starts_with("2 observation(s) not stored"), "{}", err);

        std::fs::remove_file(&blocker).unwrap();
        let retry = col.collect_and_store(&feed, &history).await.unwrap();
        assert_eq!(retry.stored, 2);
        assert_eq!(retry.store_error, None);
        assert_eq!(history.load_all().unwrap().len(), 2);
    }
}
