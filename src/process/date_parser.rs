use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};

/// NEM market time is AEST all year round.
const MARKET_OFFSET_SECS: i32 = 10 * 3600;

fn market_to_utc(naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    let offset = FixedOffset::east_opt(MARKET_OFFSET_SECS)?;
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Fast parse of `"YYYY/MM/DD HH:MM:SS"` in market time → UTC.
pub fn parse_market_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim().trim_matches('"');
    // minimal length + separators check
    if s.len() < 19 || !s.is_char_boundary(19) {
        return None;
    }
    let b = s.as_bytes();
    if b[4] != b'/' || b[7] != b'/' || b[10] != b' ' || b[13] != b':' || b[16] != b':' {
        return None;
    }
    let year: i32 = s[0..4].parse().ok()?;
    let month: u32 = s[5..7].parse().ok()?;
    let day: u32 = s[8..10].parse().ok()?;
    let hour: u32 = s[11..13].parse().ok()?;
    let min: u32 = s[14..16].parse().ok()?;
    let sec: u32 = s[17..19].parse().ok()?;

    let naive = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, min, sec)?;
    market_to_utc(naive)
}

/// Calendar date of an instant in market time.
pub fn market_date(at: &DateTime<Utc>) -> NaiveDate {
    (*at + chrono::Duration::seconds(i64::from(MARKET_OFFSET_SECS))).date_naive()
}

/// The `C` header row splits the report time into `YYYY/MM/DD` and `HH:MM:SS`.
pub fn parse_report_time(date: &str, time: &str) -> Option<DateTime<Utc>> {
    let joined = format!("{} {}", date.trim().trim_matches('"'), time.trim().trim_matches('"'));
    parse_market_timestamp(&joined)
}
