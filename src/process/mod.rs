// src/process/mod.rs
use chrono::{DateTime, Utc};
use csv::{ReaderBuilder, StringRecord, Trim};
use std::collections::BTreeMap;
use tracing::{debug, trace, warn};

pub mod date_parser;
pub mod types;

pub use types::{DataQuality, PriceMap, PriceObservation, Region, TableSpec};

/// Column names as published in the MMS data model.
const REGION_COLUMN: &str = "REGIONID";
const PRICE_COLUMN: &str = "RRP";
const SETTLEMENT_COLUMN: &str = "SETTLEMENTDATE";

/// `I` and `D` rows carry tag, category, table and version before the data.
const LEADING_FIELDS: usize = 4;

/// Resolved positions (within the whole record) of the columns we read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Columns {
    region: usize,
    price: usize,
    settlement: usize,
}

impl Columns {
    fn fixed(spec: &TableSpec) -> Self {
        Self {
            region: spec.region_offset,
            price: spec.price_offset,
            settlement: spec.settlement_offset,
        }
    }

    /// Look the columns up by name in an `I` row; anything the header does
    /// not name keeps its fixed offset.
    fn from_header(header: &StringRecord, spec: &TableSpec) -> Self {
        let find = |name: &str| {
            header
                .iter()
                .skip(LEADING_FIELDS)
                .position(|h| h.eq_ignore_ascii_case(name))
                .map(|i| i + LEADING_FIELDS)
        };
        let fixed = Self::fixed(spec);
        Self {
            region: find(REGION_COLUMN).unwrap_or(fixed.region),
            price: find(PRICE_COLUMN).unwrap_or(fixed.price),
            settlement: find(SETTLEMENT_COLUMN).unwrap_or(fixed.settlement),
        }
    }

    fn min_fields(&self) -> usize {
        self.region.max(self.price) + 1
    }
}

/// Pull per-region RRPs out of the `DISPATCH,PRICE` table of a DispatchIS
/// report, stamping the result with the current time.
pub fn extract_prices(content: &str) -> PriceMap {
    extract_prices_at(content, Utc::now())
}

/// Pure form of [`extract_prices`].
pub fn extract_prices_at(content: &str, captured_at: DateTime<Utc>) -> PriceMap {
    extract_table_prices(content, &TableSpec::dispatch_price(), captured_at)
}

/// Scan the rows of one decompressed MMS report and collect the latest
/// price per tracked region from the table named by `spec`.
///
/// Never fails: unreadable rows and unparseable prices are skipped, and a
/// report without usable rows comes back as [`DataQuality::Unavailable`].
///
/// A region seen more than once keeps the row with the latest settlement
/// time; rows with equal settlement times resolve last-seen-wins.
#[tracing::instrument(
    level = "debug",
    skip(content, spec),
    fields(table = %format!("{}_{}", spec.category, spec.table), len = content.len())
)]
pub fn extract_table_prices(
    content: &str,
    spec: &TableSpec,
    captured_at: DateTime<Utc>,
) -> PriceMap {
    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(content.as_bytes());

    let mut in_target_table = false;
    let mut columns = Columns::fixed(spec);
    let mut report_time: Option<DateTime<Utc>> = None;
    let mut seen_comment = false;
    let mut prices: BTreeMap<Region, PriceObservation> = BTreeMap::new();

    for (idx, result) in rdr.records().enumerate() {
        let record = match result {
            Ok(r) => r,
            Err(e) => {
                debug!(row = idx, error = %e, "skipping unreadable row");
                continue;
            }
        };

        match record.get(0) {
            Some("C") => {
                // only the leading C row carries the report time; the trailer doesn't
                if !seen_comment {
                    seen_comment = true;
                    if let (Some(date), Some(time)) = (record.get(5), record.get(6)) {
                        report_time = date_parser::parse_report_time(date, time);
                    }
                }
            }
            Some("I") => {
                let category = record.get(1).unwrap_or_default();
                let table = record.get(2).unwrap_or_default();
                in_target_table = spec.matches(category, table);
                if in_target_table {
                    columns = Columns::from_header(&record, spec);
                    trace!(row = idx, ?columns, "entered target table");
                }
            }
            Some("D") if in_target_table => {
                if record.len() < columns.min_fields() {
                    debug!(row = idx, fields = record.len(), "short data row");
                    continue;
                }
                let code = record.get(columns.region).unwrap_or_default();
                let Some(region) = Region::from_code(code) else {
                    trace!(row = idx, code, "untracked region");
                    continue;
                };
                let raw_price = record.get(columns.price).unwrap_or_default();
                let price = match raw_price.parse::<f64>() {
                    Ok(p) if p.is_finite() => p,
                    _ => {
                        warn!(row = idx, %region, value = raw_price, "invalid price value");
                        continue;
                    }
                };
                let settlement_time = record
                    .get(columns.settlement)
                    .and_then(date_parser::parse_market_timestamp)
                    .or(report_time)
                    .unwrap_or(captured_at);

                let replace = prices
                    .get(&region)
                    .map_or(true, |prev| prev.settlement_time <= settlement_time);
                if replace {
                    debug!(%region, price, %settlement_time, "found price");
                    prices.insert(
                        region,
                        PriceObservation {
                            region,
                            price,
                            settlement_time,
                            data_quality: DataQuality::Real,
                        },
                    );
                }
            }
            _ => {
                // blanks, stray tags and rows of other tables
            }
        }
    }

    if prices.is_empty() {
        debug!("no price rows found");
        return PriceMap::unavailable(captured_at, report_time);
    }

    PriceMap {
        quality: DataQuality::Real,
        captured_at,
        report_time,
        prices,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const HEADER: &str = "C,NEMP.WORLD,DISPATCHIS,AEMO,PUBLIC,2025/09/11,16:50:05,0000000480214720,DISPATCHIS,0000000480214716";
    const PRICE_I: &str = "I,DISPATCH,PRICE,5,SETTLEMENTDATE,RUNNO,REGIONID,DISPATCHINTERVAL,INTERVENTION,RRP,EEP,ROP,APCFLAG,MARKETSUSPENDEDFLAG,LASTCHANGED";

    fn captured() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, 11, 7, 0, 0).unwrap()
    }

    fn price_row(settlement: &str, region: &str, rrp: &str) -> String {
        format!(
            "D,DISPATCH,PRICE,5,\"{}\",1,{},20250911199,0,{},0,{},0,0,\"2025/09/11 16:50:02\"",
            settlement, region, rrp, rrp
        )
    }

    fn report(lines: &[String]) -> String {
        let mut out = String::new();
        out.push_str(HEADER);
        out.push('\n');
        for l in lines {
            out.push_str(l);
            out.push('\n');
        }
        out.push_str("C,\"END OF REPORT\",42\n");
        out
    }

    #[test]
    fn all_five_regions() {
        let regions = [
            ("NSW1", "95.43"),
            ("QLD1", "88.1"),
            ("SA1", "-12.5"),
            ("TAS1", "70"),
            ("VIC1", "101.99"),
        ];
        let mut lines = vec![PRICE_I.to_string()];
        for (r, p) in regions {
            lines.push(price_row("2025/09/11 16:55:00", r, p));
        }
        let map = extract_prices_at(&report(&lines), captured());

        assert_eq!(map.quality, DataQuality::Real);
        assert_eq!(map.prices.len(), 5);
        assert_eq!(map.price(Region::Nsw1), Some(95.43));
        assert_eq!(map.price(Region::Sa1), Some(-12.5));
        assert!(map.missing_regions().is_empty());

        let obs = &map.prices[&Region::Vic1];
        assert_eq!(obs.data_quality, DataQuality::Real);
        assert_eq!(
            obs.settlement_time,
            Utc.with_ymd_and_hms(2025, 9, 11, 6, 55, 0).unwrap()
        );
        assert_eq!(
            map.report_time,
            Some(Utc.with_ymd_and_hms(2025, 9, 11, 6, 50, 5).unwrap())
        );
    }

    #[test]
    fn no_price_table_is_unavailable() {
        let lines = vec![
            "I,DISPATCH,REGIONSUM,8,SETTLEMENTDATE,RUNNO,REGIONID,DISPATCHINTERVAL,INTERVENTION,TOTALDEMAND".to_string(),
            "D,DISPATCH,REGIONSUM,8,\"2025/09/11 16:55:00\",1,NSW1,20250911199,0,7500.2".to_string(),
        ];
        let map = extract_prices_at(&report(&lines), captured());
        assert_eq!(map.quality, DataQuality::Unavailable);
        assert!(map.prices.is_empty());
        assert_eq!(map.missing_regions().len(), 5);
    }

    #[test]
    fn empty_and_garbage_input() {
        assert_eq!(extract_prices_at("", captured()).quality, DataQuality::Unavailable);
        let garbage = "\u{0}\u{1},,,\n\"unterminated,\nD,,,\nI\n";
        let map = extract_prices_at(garbage, captured());
        assert_eq!(map.quality, DataQuality::Unavailable);
        assert_eq!(map.report_time, None);
    }

    #[test]
    fn rows_after_next_table_header_are_excluded() {
        let lines = vec![
            PRICE_I.to_string(),
            price_row("2025/09/11 16:55:00", "NSW1", "95.43"),
            // same shape as PRICE, different table
            "I,DISPATCH,REGIONFCAS,1,SETTLEMENTDATE,RUNNO,REGIONID,DISPATCHINTERVAL,INTERVENTION,RRP,EEP".to_string(),
            "D,DISPATCH,REGIONFCAS,1,\"2025/09/11 16:55:00\",1,VIC1,20250911199,0,555.5,0".to_string(),
            "D,DISPATCH,REGIONFCAS,1,\"2025/09/11 16:55:00\",1,NSW1,20250911199,0,999.9,0".to_string(),
        ];
        let map = extract_prices_at(&report(&lines), captured());
        assert_eq!(map.prices.len(), 1);
        assert_eq!(map.price(Region::Nsw1), Some(95.43));
        assert_eq!(map.price(Region::Vic1), None);
    }

    #[test]
    fn same_category_other_table_also_ends_price_run() {
        let lines = vec![
            PRICE_I.to_string(),
            "I,TRADING,PRICE,3,SETTLEMENTDATE,RUNNO,REGIONID,PERIODID,RRP".to_string(),
            price_row("2025/09/11 16:55:00", "NSW1", "95.43"),
        ];
        let map = extract_prices_at(&report(&lines), captured());
        assert_eq!(map.quality, DataQuality::Unavailable);
    }

    #[test]
    fn non_numeric_price_skips_only_that_row() {
        let lines = vec![
            PRICE_I.to_string(),
            price_row("2025/09/11 16:55:00", "NSW1", "n/a"),
            price_row("2025/09/11 16:55:00", "VIC1", "NaN"),
            price_row("2025/09/11 16:55:00", "QLD1", "80.25"),
        ];
        let map = extract_prices_at(&report(&lines), captured());
        assert_eq!(map.quality, DataQuality::Real);
        assert_eq!(map.prices.len(), 1);
        assert_eq!(map.price(Region::Qld1), Some(80.25));
    }

    #[test]
    fn short_rows_and_untracked_regions_are_ignored() {
        let lines = vec![
            PRICE_I.to_string(),
            "D,DISPATCH,PRICE,5,\"2025/09/11 16:55:00\",1,NSW1".to_string(),
            price_row("2025/09/11 16:55:00", "SNOWY1", "10"),
            "X,stray,tag".to_string(),
            price_row("2025/09/11 16:55:00", "TAS1", "60.5"),
        ];
        let map = extract_prices_at(&report(&lines), captured());
        assert_eq!(map.prices.keys().copied().collect::<Vec<_>>(), vec![Region::Tas1]);
    }

    #[test]
    fn minimal_header_and_row() {
        let content = "I,DISPATCH,PRICE,5,SETTLEMENTDATE,RUNNO,REGIONID,DISPATCHINTERVAL,INTERVENTION,RRP\n\
                       D,DISPATCH,PRICE,5,x,1,NSW1,x,0,95.43\n";
        let map = extract_prices_at(content, captured());
        assert_eq!(map.quality, DataQuality::Real);
        assert_eq!(map.price(Region::Nsw1), Some(95.43));
        // nothing parseable to date the row with, so capture time stands in
        assert_eq!(map.prices[&Region::Nsw1].settlement_time, captured());
        assert_eq!(map.report_time, None);
    }

    #[test]
    fn extraction_is_idempotent() {
        let lines = vec![
            PRICE_I.to_string(),
            price_row("2025/09/11 16:55:00", "NSW1", "95.43"),
            price_row("2025/09/11 16:55:00", "SA1", "110"),
        ];
        let content = report(&lines);
        assert_eq!(
            extract_prices_at(&content, captured()),
            extract_prices_at(&content, captured())
        );
        assert_eq!(
            extract_prices(&content).prices,
            extract_prices(&content).prices
        );
    }

    #[test]
    fn duplicate_region_same_interval_last_seen_wins() {
        let lines = vec![
            PRICE_I.to_string(),
            price_row("2025/09/11 16:55:00", "NSW1", "95.43"),
            price_row("2025/09/11 16:55:00", "NSW1", "97.00"),
        ];
        let map = extract_prices_at(&report(&lines), captured());
        assert_eq!(map.price(Region::Nsw1), Some(97.0));
    }

    #[test]
    fn duplicate_region_latest_interval_wins() {
        let lines = vec![
            PRICE_I.to_string(),
            price_row("2025/09/11 17:00:00", "NSW1", "120.0"),
            price_row("2025/09/11 16:55:00", "NSW1", "95.43"),
        ];
        let map = extract_prices_at(&report(&lines), captured());
        assert_eq!(map.price(Region::Nsw1), Some(120.0));
        assert_eq!(
            map.prices[&Region::Nsw1].settlement_time,
            Utc.with_ymd_and_hms(2025, 9, 11, 7, 0, 0).unwrap()
        );
    }

    #[test]
    fn repeated_price_table_keeps_scanning() {
        let lines = vec![
            PRICE_I.to_string(),
            price_row("2025/09/11 16:55:00", "NSW1", "95.43"),
            "I,DISPATCH,INTERCONNECTORRES,3,SETTLEMENTDATE,RUNNO,INTERCONNECTORID".to_string(),
            "D,DISPATCH,INTERCONNECTORRES,3,\"2025/09/11 16:55:00\",1,N-Q-MNSP1".to_string(),
            PRICE_I.to_string(),
            price_row("2025/09/11 16:55:00", "VIC1", "88.8"),
        ];
        let map = extract_prices_at(&report(&lines), captured());
        assert_eq!(map.prices.len(), 2);
    }

    #[test]
    fn columns_located_by_header_name() {
        // a later table version that moved RRP and REGIONID
        let content = format!(
            "{}\n{}\n{}\n",
            HEADER,
            "I,DISPATCH,PRICE,9,SETTLEMENTDATE,REGIONID,RUNNO,EXTRA,RRP,DISPATCHINTERVAL",
            "D,DISPATCH,PRICE,9,\"2025/09/11 16:55:00\",QLD1,1,zzz,77.7,20250911199",
        );
        let map = extract_prices_at(&content, captured());
        assert_eq!(map.price(Region::Qld1), Some(77.7));
    }

    #[test]
    fn report_time_used_when_settlement_unparseable() {
        let lines = vec![PRICE_I.to_string(), price_row("garbage", "SA1", "50")];
        let map = extract_prices_at(&report(&lines), captured());
        assert_eq!(
            map.prices[&Region::Sa1].settlement_time,
            Utc.with_ymd_and_hms(2025, 9, 11, 6, 50, 5).unwrap()
        );
    }

    #[test]
    fn trading_price_table() {
        let content = "C,NEMP.WORLD,TRADINGIS,AEMO,PUBLIC,2025/09/11,17:00:04,1,TRADINGIS,1\n\
                       I,TRADING,PRICE,3,SETTLEMENTDATE,RUNNO,REGIONID,PERIODID,RRP,EEP,INVALIDFLAG\n\
                       D,TRADING,PRICE,3,\"2025/09/11 17:00:00\",1,VIC1,204,64.12,0,0\n";
        let map = extract_table_prices(content, &TableSpec::trading_price(), captured());
        assert_eq!(map.price(Region::Vic1), Some(64.12));

        // the DISPATCH,PRICE target must not pick it up
        assert!(!extract_prices_at(content, captured()).is_real());
    }
}
