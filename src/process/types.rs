use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};

/// NEM regions we track prices for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Region {
    #[serde(rename = "NSW1")]
    Nsw1,
    #[serde(rename = "VIC1")]
    Vic1,
    #[serde(rename = "QLD1")]
    Qld1,
    #[serde(rename = "SA1")]
    Sa1,
    #[serde(rename = "TAS1")]
    Tas1,
}

impl Region {
    pub const ALL: [Region; 5] = [
        Region::Nsw1,
        Region::Vic1,
        Region::Qld1,
        Region::Sa1,
        Region::Tas1,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Region::Nsw1 => "NSW1",
            Region::Vic1 => "VIC1",
            Region::Qld1 => "QLD1",
            Region::Sa1 => "SA1",
            Region::Tas1 => "TAS1",
        }
    }

    /// Returns `None` for codes outside the tracked set (e.g. `SNOWY1`).
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim() {
            "NSW1" => Some(Region::Nsw1),
            "VIC1" => Some(Region::Vic1),
            "QLD1" => Some(Region::Qld1),
            "SA1" => Some(Region::Sa1),
            "TAS1" => Some(Region::Tas1),
            _ => None,
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Region {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Region::from_code(s).ok_or_else(|| anyhow::anyhow!("untracked region code `{}`", s))
    }
}

/// Distinguishes a value parsed from a report from an absence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataQuality {
    Real,
    Unavailable,
}

impl DataQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataQuality::Real => "REAL",
            DataQuality::Unavailable => "UNAVAILABLE",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PriceObservation {
    pub region: Region,
    /// AUD/MWh
    pub price: f64,
    pub settlement_time: DateTime<Utc>,
    pub data_quality: DataQuality,
}

/// Result of one extraction call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PriceMap {
    pub quality: DataQuality,
    pub captured_at: DateTime<Utc>,
    /// Report timestamp from the leading `C` row, if it parsed.
    pub report_time: Option<DateTime<Utc>>,
    pub prices: BTreeMap<Region, PriceObservation>,
}

impl PriceMap {
    pub fn unavailable(captured_at: DateTime<Utc>, report_time: Option<DateTime<Utc>>) -> Self {
        Self {
            quality: DataQuality::Unavailable,
            captured_at,
            report_time,
            prices: BTreeMap::new(),
        }
    }

    pub fn is_real(&self) -> bool {
        self.quality == DataQuality::Real
    }

    pub fn price(&self, region: Region) -> Option<f64> {
        self.prices.get(&region).map(|o| o.price)
    }

    /// Tracked regions with no observation.
    pub fn missing_regions(&self) -> Vec<Region> {
        Region::ALL
            .iter()
            .copied()
            .filter(|r| !self.prices.contains_key(r))
            .collect()
    }
}

/// Which `I`-declared table to pull prices from, and where its columns sit
/// when the header does not name them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    pub category: String,
    pub table: String,
    pub region_offset: usize,
    pub price_offset: usize,
    pub settlement_offset: usize,
}

impl TableSpec {
    /// `I,DISPATCH,PRICE,<ver>,SETTLEMENTDATE,RUNNO,REGIONID,DISPATCHINTERVAL,INTERVENTION,RRP,...`
    pub fn dispatch_price() -> Self {
        Self {
            category: "DISPATCH".into(),
            table: "PRICE".into(),
            region_offset: 6,
            price_offset: 9,
            settlement_offset: 4,
        }
    }

    /// `I,TRADING,PRICE,<ver>,SETTLEMENTDATE,RUNNO,REGIONID,PERIODID,RRP,...`
    pub fn trading_price() -> Self {
        Self {
            category: "TRADING".into(),
            table: "PRICE".into(),
            region_offset: 6,
            price_offset: 8,
            settlement_offset: 4,
        }
    }

    pub fn matches(&self, category: &str, table: &str) -> bool {
        self.category == category && self.table == table
    }
}
