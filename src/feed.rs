use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use crate::fetch::urls::{DISPATCH_IS_URL, TRADING_IS_URL};
use crate::process::{DataQuality, PriceMap, PriceObservation, TableSpec};

/// What to do about tracked regions a report did not price.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Missing regions stay missing.
    #[default]
    Leave,
    /// Missing regions get a zero price tagged `UNAVAILABLE`.
    ZeroFill,
}

impl FallbackPolicy {
    pub fn apply(&self, map: &mut PriceMap) {
        match self {
            FallbackPolicy::Leave => {}
            FallbackPolicy::ZeroFill => {
                let at = map.report_time.unwrap_or(map.captured_at);
                for region in map.missing_regions() {
                    map.prices.insert(
                        region,
                        PriceObservation {
                            region,
                            price: 0.0,
                            settlement_time: at,
                            data_quality: DataQuality::Unavailable,
                        },
                    );
                }
            }
        }
    }
}

impl FromStr for FallbackPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "leave" => Ok(FallbackPolicy::Leave),
            "zero_fill" | "zerofill" | "zero" => Ok(FallbackPolicy::ZeroFill),
            other => Err(anyhow::anyhow!("unknown fallback policy `{}`", other)),
        }
    }
}

/// The NEMweb report families we know how to read prices from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedKind {
    /// 5-minute dispatch reports, `DISPATCH,PRICE`.
    DispatchIs,
    /// Trading interval reports, `TRADING,PRICE`.
    TradingIs,
}

impl FeedKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedKind::DispatchIs => "dispatch_is",
            FeedKind::TradingIs => "trading_is",
        }
    }

    pub fn feed(&self, fallback: FallbackPolicy) -> PriceFeed {
        match self {
            FeedKind::DispatchIs => PriceFeed {
                name: "AEMO NEMWeb DispatchIS".into(),
                kind: *self,
                listing_url: DISPATCH_IS_URL.into(),
                table: TableSpec::dispatch_price(),
                fallback,
            },
            FeedKind::TradingIs => PriceFeed {
                name: "AEMO NEMWeb TradingIS".into(),
                kind: *self,
                listing_url: TRADING_IS_URL.into(),
                table: TableSpec::trading_price(),
                fallback,
            },
        }
    }
}

impl fmt::Display for FeedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeedKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "dispatch_is" | "dispatchis" | "dispatch" => Ok(FeedKind::DispatchIs),
            "trading_is" | "tradingis" | "trading" => Ok(FeedKind::TradingIs),
            other => Err(anyhow::anyhow!("unknown feed `{}`", other)),
        }
    }
}

/// One price source: where to list reports, which table to read, and what
/// to do with the gaps.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PriceFeed {
    pub name: String,
    pub kind: FeedKind,
    pub listing_url: String,
    pub table: TableSpec,
    pub fallback: FallbackPolicy,
}
