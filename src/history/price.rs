use anyhow::{anyhow, Result};
use arrow::{
    array::{ArrayRef, Float64Array, StringArray, TimestampMicrosecondArray},
    datatypes::{DataType as ArrowDataType, Field, Schema as ArrowSchema, TimeUnit},
    record_batch::RecordBatch,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, sync::Arc};

use crate::history::table_history::{f64_at, micros_at, string_at, HistoryRow, TableHistory};
use crate::process::{date_parser::market_date, PriceObservation, Region};

/// One stored spot price. Only REAL observations are persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PriceRow {
    pub region: Region,
    pub settlement_time: DateTime<Utc>,
    pub price: f64,
    pub feed: String,
    /// Report URL the price was read from.
    pub source: String,
    pub captured_at: DateTime<Utc>,
}

impl PriceRow {
    pub fn from_observation(
        obs: &PriceObservation,
        feed: &str,
        source: &str,
        captured_at: DateTime<Utc>,
    ) -> Self {
        Self {
            region: obs.region,
            settlement_time: obs.settlement_time,
            price: obs.price,
            feed: feed.to_string(),
            source: source.to_string(),
            captured_at,
        }
    }
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| anyhow!("timestamp {} out of range", micros))
}

impl HistoryRow for PriceRow {
    const KEY_COLUMN: usize = 0;
    const TIME_COLUMN: usize = 1;

    /// Market (AEST) trading date, so one day's intervals share a partition.
    fn partition_date(&self) -> NaiveDate {
        market_date(&self.settlement_time)
    }

    fn schema() -> ArrowSchema {
        ArrowSchema::new(vec![
            Field::new("region", ArrowDataType::Utf8, false),
            Field::new(
                "settlement_time",
                ArrowDataType::Timestamp(TimeUnit::Microsecond, None),
                false,
            ),
            Field::new("price", ArrowDataType::Float64, false),
            Field::new("feed", ArrowDataType::Utf8, false),
            Field::new("source", ArrowDataType::Utf8, false),
            Field::new(
                "captured_at",
                ArrowDataType::Timestamp(TimeUnit::Microsecond, None),
                false,
            ),
        ])
    }

    fn to_arrays(&self) -> Vec<ArrayRef> {
        vec![
            Arc::new(StringArray::from(vec![self.region.as_str()])),
            Arc::new(TimestampMicrosecondArray::from(vec![self
                .settlement_time
                .timestamp_micros()])),
            Arc::new(Float64Array::from(vec![self.price])),
            Arc::new(StringArray::from(vec![self.feed.clone()])),
            Arc::new(StringArray::from(vec![self.source.clone()])),
            Arc::new(TimestampMicrosecondArray::from(vec![self
                .captured_at
                .timestamp_micros()])),
        ]
    }

    fn unique_key(&self) -> String {
        format!("{}--{}", self.region, self.settlement_time.timestamp_micros())
    }

    fn from_batch(batch: &RecordBatch, row: usize) -> Result<Self> {
        Ok(Self {
            region: string_at(batch, 0, row)?.parse()?,
            settlement_time: from_micros(micros_at(batch, 1, row)?)?,
            price: f64_at(batch, 2, row)?,
            feed: string_at(batch, 3, row)?,
            source: string_at(batch, 4, row)?,
            captured_at: from_micros(micros_at(batch, 5, row)?)?,
        })
    }
}

impl TableHistory<PriceRow> {
    pub fn new_prices(base: impl Into<PathBuf>) -> Result<Arc<Self>> {
        TableHistory::new(base, "prices")
    }
}
