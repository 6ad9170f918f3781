//! Spot prices for the Australian NEM, read from AEMO's NEMweb reports.
//!
//! `process` holds the MMS report table extractor; `fetch`, `collect` and
//! `history` are the plumbing around it.

pub mod collect;
pub mod config;
pub mod feed;
pub mod fetch;
pub mod history;
pub mod process;

pub use collect::{Collection, Collector, JobState, Supervisor};
pub use config::Config;
pub use feed::{FallbackPolicy, FeedKind, PriceFeed};
pub use process::{
    extract_prices, extract_prices_at, extract_table_prices, DataQuality, PriceMap,
    PriceObservation, Region, TableSpec,
};
