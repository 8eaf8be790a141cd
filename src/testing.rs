//! Fixtures for tests of the pipeline and of tools built on it.
//!
//! Containers are assembled from typed rows (converted with `serde_arrow`)
//! and written through any [`ContainerStore`]:
//!
//! ```no_run
//! use evfix::container::BundleStore;
//! use evfix::testing::{ContainerBuilder, SummaryRow};
//!
//! # fn main() -> anyhow::Result<()> {
//! let rows: Vec<SummaryRow> = (0..5).map(|e| SummaryRow::new(1, e)).collect();
//! ContainerBuilder::new()
//!     .table("triggerAna/event_summary", &rows)?
//!     .record("triggerAna/info", b"geometry=1x8x6")
//!     .write(&BundleStore::new(), "data/run1_0_ana.ntuple.root")?;
//! # Ok(())
//! # }
//! ```

use crate::container::{ContainerStore, WriteMode};
use anyhow::{Context, Result, anyhow};
use arrow::array::AsArray;
use arrow::compute::cast;
use arrow::datatypes::{DataType, FieldRef, Int64Type};
use arrow::record_batch::RecordBatch;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_arrow::schema::{SchemaLike, TracingOptions};
use serde_arrow::{from_record_batch, to_record_batch};
use std::path::{Path, PathBuf};

/// Row of the `event_summary` table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryRow {
    pub run: u32,
    pub subrun: u32,
    pub event: u32,
}

impl SummaryRow {
    #[must_use]
    pub const fn new(run: u32, event: u32) -> Self {
        Self { run, subrun: 0, event }
    }
}

/// Row of a trigger-primitive table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimitiveRow {
    pub run: u32,
    pub event: u32,
    pub channel: u32,
    pub samples_over_threshold: u16,
    pub adc_peak: u16,
}

/// Convert typed rows into a table; works for zero rows.
///
/// # Errors
/// Fails when the schema cannot be traced from `T` or conversion fails.
pub fn rows_to_batch<T: Serialize + Deserialize<'static>>(rows: &[T]) -> Result<RecordBatch> {
    let fields: Vec<FieldRef> = Vec::<FieldRef>::from_type::<T>(TracingOptions::default())
        .context("infer Arrow schema from type T")?;
    to_record_batch(&fields, &rows).context("convert rows to RecordBatch")
}

/// Convert a table back into typed rows.
///
/// # Errors
/// Fails when the columns do not match `T`.
pub fn batch_to_rows<T: DeserializeOwned>(batch: &RecordBatch) -> Result<Vec<T>> {
    from_record_batch(batch).context("deserialize RecordBatch rows to T")
}

/// Values of an integer column as `i64`.
///
/// # Errors
/// Fails when the column is missing or cannot be cast.
pub fn int_column(batch: &RecordBatch, name: &str) -> Result<Vec<i64>> {
    let col = batch
        .column_by_name(name)
        .ok_or_else(|| anyhow!("no column {name:?}"))?;
    let col = cast(col, &DataType::Int64)?;
    Ok(col.as_primitive::<Int64Type>().iter().flatten().collect())
}

/// Collects tables and records, then writes them as one container.
#[derive(Default)]
pub struct ContainerBuilder {
    tables: Vec<(String, RecordBatch)>,
    records: Vec<(String, Vec<u8>)>,
}

impl ContainerBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// Fails when the rows cannot be converted.
    pub fn table<T: Serialize + Deserialize<'static>>(mut self, path: &str, rows: &[T]) -> Result<Self> {
        self.tables.push((path.to_string(), rows_to_batch(rows)?));
        Ok(self)
    }

    #[must_use]
    pub fn batch(mut self, path: &str, batch: RecordBatch) -> Self {
        self.tables.push((path.to_string(), batch));
        self
    }

    #[must_use]
    pub fn record(mut self, path: &str, bytes: &[u8]) -> Self {
        self.records.push((path.to_string(), bytes.to_vec()));
        self
    }

    /// # Errors
    /// Propagates store failures.
    pub fn write(self, store: &dyn ContainerStore, path: impl AsRef<Path>) -> Result<PathBuf> {
        let path = path.as_ref();
        let mut w = store.create(path, WriteMode::Recreate)?;
        for (p, batch) in &self.tables {
            w.write_table(p, batch)?;
        }
        for (p, bytes) in &self.records {
            w.write_record(p, bytes)?;
        }
        Ok(path.to_path_buf())
    }
}

/// Metadata payload written by [`sample_ntuple`].
pub const SAMPLE_INFO: &[u8] = b"{\"detector\":\"vd_1x8x6\",\"generator\":\"radbkg\"}";

/// A typical analysis ntuple: `event_summary` and `mctruths` with one row per
/// event, two primitive tables with two rows per event
/// (`samples_over_threshold` 5 and 9), and an `info` record.
///
/// # Errors
/// Propagates store failures.
pub fn sample_ntuple(store: &dyn ContainerStore, path: impl AsRef<Path>, run: u32, events: u32) -> Result<PathBuf> {
    let summary: Vec<SummaryRow> = (0..events).map(|e| SummaryRow::new(run, e)).collect();
    let tps: Vec<PrimitiveRow> = (0..events)
        .flat_map(|e| {
            [5u16, 9].map(|sot| PrimitiveRow {
                run,
                event: e,
                channel: 100 + u32::from(sot),
                samples_over_threshold: sot,
                adc_peak: sot * 10,
            })
        })
        .collect();

    ContainerBuilder::new()
        .table("triggerAna/event_summary", &summary)?
        .table("triggerAna/mctruths", &summary)?
        .table("triggerAna/TriggerPrimitives/tpmakerTPC", &tps)?
        .table("triggerAna/TriggerPrimitives/tpmakerTPCSimpleThreshold", &tps)?
        .record("triggerAna/info", SAMPLE_INFO)
        .write(store, path)
}
