//! Sanity checks run against finished containers.

use crate::config::PipelineConfig;
use crate::container::{ContainerReader, EntryKind, join_path, table_names};
use crate::transform::EVENT_UID_COLUMN;
use anyhow::{Context, Result, anyhow};
use arrow::array::{Array, AsArray};
use arrow::compute::{cast, max};
use arrow::datatypes::{DataType, Int64Type, UInt64Type};
use arrow::record_batch::RecordBatch;
use std::collections::{BTreeMap, HashSet};

/// Distinct `event_uid` values per table.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UidCounts {
    pub event_summary: usize,
    pub primitives: BTreeMap<String, usize>,
}

fn distinct_uids(batch: &RecordBatch, table: &str) -> Result<usize> {
    let col = batch
        .column_by_name(EVENT_UID_COLUMN)
        .ok_or_else(|| anyhow!("table {table:?} has no {EVENT_UID_COLUMN} column"))?;
    let col = cast(col, &DataType::UInt64).context("cast event_uid to UInt64")?;
    let values: HashSet<u64> = col.as_primitive::<UInt64Type>().iter().flatten().collect();
    Ok(values.len())
}

/// Count distinct `event_uid` values in `event_summary` and every primitive table.
///
/// # Errors
/// Fails when a table is missing or lacks the column.
pub fn count_event_uids(reader: &dyn ContainerReader, config: &PipelineConfig) -> Result<UidCounts> {
    let summary_path = join_path(&config.namespace, "event_summary");
    let event_summary = distinct_uids(&reader.read_table(&summary_path)?, &summary_path)?;

    let mut primitives = BTreeMap::new();
    let has_group = reader
        .list_entries(&config.namespace)?
        .iter()
        .any(|e| e.kind == EntryKind::Namespace && e.name == config.primitives_group);
    if has_group {
        let group = config.primitives_path();
        for name in table_names(reader, &group)? {
            let path = join_path(&group, &name);
            let n = distinct_uids(&reader.read_table(&path)?, &path)?;
            primitives.insert(name, n);
        }
    }
    Ok(UidCounts { event_summary, primitives })
}

/// Largest `timestamp` in `<namespace>/simides`, `None` for an empty table.
///
/// # Errors
/// Fails when the table or column is missing or not integer-valued.
pub fn max_timestamp(reader: &dyn ContainerReader, config: &PipelineConfig) -> Result<Option<i64>> {
    let path = join_path(&config.namespace, "simides");
    let batch = reader.read_table(&path)?;
    let col = batch
        .column_by_name("timestamp")
        .ok_or_else(|| anyhow!("table {path:?} has no timestamp column"))?;
    if !col.data_type().is_integer() {
        return Err(anyhow!("timestamp in {path:?} is {}, expected an integer type", col.data_type()));
    }
    let col = cast(col, &DataType::Int64)?;
    Ok(max(col.as_primitive::<Int64Type>()))
}
