use anyhow::{anyhow, Context, Result};
use arrow::{
    array::{Array, ArrayRef, Float64Array, StringArray, TimestampMicrosecondArray},
    datatypes::Schema as ArrowSchema,
    record_batch::RecordBatch,
};
use chrono::{NaiveDate, Utc};
use glob::glob;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use std::{
    collections::HashSet,
    fs::{self, File},
    io::BufWriter,
    marker::PhantomData,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use tracing::{debug, info};

const CONSOLIDATED: &str = "consolidated.parquet";

/// Trait representing a row in the history table.
/// - Defines schema, to_arrays, unique_key for writes.
/// - Provides column indices and a small extractor for dedupe scanning.
pub trait HistoryRow: Sized {
    /// Partition date for hive partitioning
    fn partition_date(&self) -> NaiveDate;
    /// Arrow schema for this row type
    fn schema() -> ArrowSchema;
    /// Convert this row into column arrays matching the schema
    fn to_arrays(&self) -> Vec<ArrayRef>;
    /// Unique dedupe key for this row (used when writing)
    fn unique_key(&self) -> String;
    /// Rebuild a row from a stored batch
    fn from_batch(batch: &RecordBatch, row: usize) -> Result<Self>;
    /// Column index for key in schema
    const KEY_COLUMN: usize;
    /// Column index for timestamp in schema
    const TIME_COLUMN: usize;
    /// Extract unique key from an existing batch row (for scanning)
    fn extract_key(batch: &RecordBatch, row: usize) -> Result<String> {
        let key = string_at(batch, Self::KEY_COLUMN, row)?;
        let ts = micros_at(batch, Self::TIME_COLUMN, row)?;
        Ok(format!("{}--{}", key, ts))
    }
}

pub(crate) fn string_at(batch: &RecordBatch, col: usize, row: usize) -> Result<String> {
    let arr = batch
        .column(col)
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| anyhow!("column {} is not Utf8", col))?;
    Ok(arr.value(row).to_string())
}

pub(crate) fn micros_at(batch: &RecordBatch, col: usize, row: usize) -> Result<i64> {
    let arr = batch
        .column(col)
        .as_any()
        .downcast_ref::<TimestampMicrosecondArray>()
        .ok_or_else(|| anyhow!("column {} is not Timestamp(µs)", col))?;
    Ok(arr.value(row))
}

pub(crate) fn f64_at(batch: &RecordBatch, col: usize, row: usize) -> Result<f64> {
    let arr = batch
        .column(col)
        .as_any()
        .downcast_ref::<Float64Array>()
        .ok_or_else(|| anyhow!("column {} is not Float64", col))?;
    if arr.is_null(row) {
        return Err(anyhow!("column {} row {} is null", col, row));
    }
    Ok(arr.value(row))
}

fn read_batches(path: &Path) -> Result<Vec<RecordBatch>> {
    let file = File::open(path).with_context(|| format!("failed to open `{}`", path.display()))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?
        .with_batch_size(1024)
        .build()?;
    reader
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("reading `{}`", path.display()))
}

/// Generic hive-partitioned history table:
/// `<base>/<table>/date=YYYYMMDD/<key>---<ts>.parquet`.
pub struct TableHistory<R: HistoryRow> {
    base_dir: PathBuf,
    table: String,
    schema: Arc<ArrowSchema>,
    seen: Arc<Mutex<HashSet<String>>>,
    _marker: PhantomData<R>,
}

impl<R: HistoryRow + Send + Sync + 'static> TableHistory<R> {
    /// Create the table directory and scan existing data into `seen`.
    pub fn new(base_dir: impl Into<PathBuf>, table: &str) -> Result<Arc<Self>> {
        let base_dir = base_dir.into();
        let table_dir = base_dir.join(table);
        fs::create_dir_all(&table_dir)
            .with_context(|| format!("could not create `{}`", table_dir.display()))?;

        let schema = Arc::new(R::schema());
        let mut seen_set = HashSet::new();

        // Scan dedupe keys only
        for path in Self::partition_files(&table_dir)? {
            for batch in read_batches(&path)? {
                for i in 0..batch.num_rows() {
                    seen_set.insert(R::extract_key(&batch, i)?);
                }
            }
        }
        debug!(table, keys = seen_set.len(), "loaded history keys");

        Ok(Arc::new(Self {
            base_dir,
            table: table.to_string(),
            schema,
            seen: Arc::new(Mutex::new(seen_set)),
            _marker: PhantomData,
        }))
    }

    fn table_dir(&self) -> PathBuf {
        self.base_dir.join(&self.table)
    }

    fn partition_dirs(table_dir: &Path) -> Result<Vec<PathBuf>> {
        let mut dirs = Vec::new();
        for part in fs::read_dir(table_dir)? {
            let part = part?;
            if part.file_type()?.is_dir() {
                dirs.push(part.path());
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    fn partition_files(table_dir: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for dir in Self::partition_dirs(table_dir)? {
            files.extend(glob(&format!("{}/*.parquet", dir.display()))?.filter_map(Result::ok));
        }
        Ok(files)
    }

    /// Add a new row of type R. Returns `false` if its key was already stored.
    /// A failed write releases the key so the row can be added again.
    pub fn add(&self, row: &R) -> Result<bool> {
        let key = row.unique_key();
        {
            let mut seen = self
                .seen
                .lock()
                .map_err(|_| anyhow!("history lock poisoned"))?;
            if !seen.insert(key.clone()) {
                return Ok(false);
            }
        }

        if let Err(e) = self.write_row(row, &key) {
            if let Ok(mut seen) = self.seen.lock() {
                seen.remove(&key);
            }
            return Err(e);
        }
        Ok(true)
    }

    fn write_row(&self, row: &R, key: &str) -> Result<()> {
        let partition = format!("date={}", row.partition_date().format("%Y%m%d"));
        let dir = self.table_dir().join(partition);
        fs::create_dir_all(&dir)
            .with_context(|| format!("could not create `{}`", dir.display()))?;

        let ts = Utc::now().timestamp_micros();
        let fname = format!("{}---{}.parquet", key, ts);
        let tmp = dir.join(format!("{}.tmp", fname));

        let written = (|| -> Result<()> {
            let file = File::create(&tmp)?;
            let mut writer =
                ArrowWriter::try_new(BufWriter::new(file), self.schema.clone(), None)?;
            let batch = RecordBatch::try_new(self.schema.clone(), row.to_arrays())?;
            writer.write(&batch)?;
            writer.close()?;
            fs::rename(&tmp, dir.join(&fname))?;
            Ok(())
        })();
        if written.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        written.with_context(|| format!("writing `{}`", fname))
    }

    /// Check if a row exists by its dedupe key
    pub fn contains(&self, key: &str) -> bool {
        self.seen
            .lock()
            .map(|seen| seen.contains(key))
            .unwrap_or(false)
    }

    /// Every stored row, partition by partition.
    pub fn load_all(&self) -> Result<Vec<R>> {
        let mut rows = Vec::new();
        for path in Self::partition_files(&self.table_dir())? {
            for batch in read_batches(&path)? {
                for i in 0..batch.num_rows() {
                    rows.push(R::from_batch(&batch, i)?);
                }
            }
        }
        Ok(rows)
    }

    /// Vacuum each partition into one consolidated file
    pub fn vacuum(&self) -> Result<()> {
        for dir in Self::partition_dirs(&self.table_dir())? {
            let files = glob(&format!("{}/*.parquet", dir.display()))?
                .filter_map(Result::ok)
                .collect::<Vec<_>>();
            let already_done = files.len() == 1
                && files[0].file_name().and_then(|n| n.to_str()) == Some(CONSOLIDATED);
            if files.is_empty() || already_done {
                continue;
            }

            let tmp = dir.join(format!("{}.tmp", CONSOLIDATED));
            let file = File::create(&tmp)?;
            let mut writer = ArrowWriter::try_new(BufWriter::new(file), self.schema.clone(), None)?;

            for p in &files {
                for batch in read_batches(p)? {
                    writer.write(&batch)?;
                }
            }
            writer.close()?;
            fs::rename(&tmp, dir.join(CONSOLIDATED))?;

            for p in &files {
                if p.file_name().and_then(|n| n.to_str()) != Some(CONSOLIDATED) {
                    fs::remove_file(p)?;
                }
            }
            info!(partition = %dir.display(), files = files.len(), "vacuumed");
        }
        Ok(())
    }
}
