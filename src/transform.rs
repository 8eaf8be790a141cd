//! Record transformer: one input container in, one output container out.
//!
//! For every partition the transformer
//!
//! 1. opens the input (after remote rewriting) and lists the top-level tables
//!    and the nested primitive tables,
//! 2. applies the table mask to the top-level tables,
//! 3. renumbers `event` (and overwrites `run` when the partition carries a run
//!    number), derives `event_uid` when asked, and filters primitive tables,
//! 4. writes each table at its original path in a freshly recreated output,
//! 5. copies the metadata record last.

use crate::config::PipelineConfig;
use crate::container::{ContainerReader, ContainerStore, EntryKind, WriteMode, join_path, table_names};
use crate::error::JobError;
use crate::expr::{self, Expr};
use crate::io::paths::same_location;
use crate::metadata::MetadataRecord;
use crate::partition::{InputDescriptor, PartitionKey};
use anyhow::{Context, Result, anyhow, bail};
use arrow::array::AsArray;
use arrow::compute::{cast, max, min};
use arrow::datatypes::{DataType, Int64Type};
use arrow::record_batch::RecordBatch;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

pub const EVENT_COLUMN: &str = "event";
pub const RUN_COLUMN: &str = "run";
pub const EVENT_UID_COLUMN: &str = "event_uid";

/// Primitive cut applied by every slimming mode.
pub const SOT_CUT: &str = "samples_over_threshold > 7";

/// Row predicate applied to primitive tables, labelled for diagnostics.
#[derive(Clone, Debug, PartialEq)]
pub struct NamedFilter {
    pub name: String,
    pub predicate: Expr,
}

impl NamedFilter {
    /// # Errors
    /// Fails when `predicate` does not parse.
    pub fn parse(name: impl Into<String>, predicate: &str) -> Result<Self> {
        Ok(Self { name: name.into(), predicate: Expr::parse(predicate)? })
    }
}

/// Which tables and rows to keep, and whether to derive `event_uid`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TransformSpec {
    /// Top-level tables to keep; `None` keeps all of them.
    pub table_mask: Option<BTreeSet<String>>,
    pub add_event_uid: bool,
    /// Applied in order to primitive tables only.
    pub primitive_filters: Vec<NamedFilter>,
}

/// Table selections offered by the slimming tool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlimMode {
    /// Radiological background samples.
    Bkg,
    /// Neutrino samples.
    Nu,
    /// Particle-gun samples.
    Pgun,
}

impl TransformSpec {
    /// Keep everything, derive nothing.
    #[must_use]
    pub fn identity() -> Self {
        Self::default()
    }

    /// The slimming selection for `mode`.
    ///
    /// # Errors
    /// Fails only if the built-in primitive cut does not parse.
    pub fn slim(mode: SlimMode) -> Result<Self> {
        let mut mask: BTreeSet<String> = BTreeSet::from(["event_summary".to_string()]);
        match mode {
            SlimMode::Bkg => {}
            SlimMode::Nu => {
                mask.extend(["mctruths".to_string(), "mcneutrinos".to_string()]);
            }
            SlimMode::Pgun => {
                mask.insert("mctruths".to_string());
            }
        }
        Ok(Self {
            table_mask: Some(mask),
            add_event_uid: true,
            primitive_filters: vec![NamedFilter::parse("sot_cut", SOT_CUT)?],
        })
    }

    fn keeps(&self, table: &str) -> bool {
        self.table_mask.as_ref().is_none_or(|m| m.contains(table))
    }
}

/// Identifier rewrite derived from a partition key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Renumber {
    /// Added to every `event` value.
    pub offset: i64,
    /// Literal written to every `run` value.
    pub run_override: Option<i64>,
}

impl Renumber {
    /// `offset = job * multiplier`; the run number, when present, overrides `run`.
    ///
    /// # Errors
    /// Fails when the offset or run number does not fit in `i64`.
    pub fn for_key(key: &PartitionKey, multiplier: u64) -> Result<Self> {
        let offset = key
            .job
            .checked_mul(multiplier)
            .and_then(|v| i64::try_from(v).ok())
            .ok_or_else(|| anyhow!("event offset for job {} overflows", key.job))?;
        let run_override = key
            .run
            .map(i64::try_from)
            .transpose()
            .with_context(|| format!("run number of partition {key} overflows"))?;
        Ok(Self { offset, run_override })
    }

    /// Rewrite `event` (and `run`) in one table.
    ///
    /// # Errors
    /// Fails when the columns are missing or the offset overflows their type.
    pub fn apply(&self, batch: &RecordBatch) -> Result<RecordBatch> {
        let mut out = expr::redefine(batch, EVENT_COLUMN, &Expr::column_plus(EVENT_COLUMN, self.offset))?;
        if let Some(run) = self.run_override {
            out = expr::redefine(&out, RUN_COLUMN, &Expr::Int(run))?;
        }
        Ok(out)
    }
}

/// Append `event_uid = run * multiplier + event` as `UInt64`.
///
/// Every `event` must lie in `[0, multiplier)`, otherwise ids of neighbouring
/// runs could coincide.
///
/// # Errors
/// Fails on missing columns or out-of-range events.
pub fn add_event_uid(batch: &RecordBatch, multiplier: u64) -> Result<RecordBatch> {
    let events = batch
        .column_by_name(EVENT_COLUMN)
        .ok_or_else(|| anyhow!("cannot derive {EVENT_UID_COLUMN}: no {EVENT_COLUMN:?} column"))?;
    let events = cast(events, &DataType::Int64).context("cast event to Int64")?;
    let events = events.as_primitive::<Int64Type>();
    let limit = i64::try_from(multiplier).context("uid multiplier overflows i64")?;
    if let (Some(lo), Some(hi)) = (min(events), max(events))
        && (lo < 0 || hi >= limit)
    {
        bail!("event values [{lo}, {hi}] fall outside [0, {limit}); {EVENT_UID_COLUMN} would not be unique");
    }

    let formula = Expr::parse(&format!("{RUN_COLUMN} * {limit} + {EVENT_COLUMN}"))?;
    expr::define(batch, EVENT_UID_COLUMN, &formula, Some(&DataType::UInt64))
}

/// How output containers are named.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputNaming {
    /// `<base>_<key>_evfix_ana.ntuple.<ext>`
    Fixed,
    /// The input file name, unchanged.
    Slim,
}

/// Per-run transformer settings. Immutable while jobs run.
#[derive(Clone, Debug)]
pub struct TransformPlan {
    pub spec: TransformSpec,
    /// Rewrite `event`/`run` from the partition key.
    pub renumber: bool,
    pub naming: OutputNaming,
    pub outdir: PathBuf,
}

impl TransformPlan {
    #[must_use]
    pub fn output_path(&self, input: &InputDescriptor) -> PathBuf {
        match self.naming {
            OutputNaming::Fixed => input.fixed_output_path(&self.outdir),
            OutputNaming::Slim => input.slim_output_path(&self.outdir),
        }
    }
}

/// Tables found in an input, as full container paths.
struct Inventory {
    top: Vec<String>,
    primitives: Vec<String>,
    metadata: MetadataRecord,
}

/// Runs the per-partition transform against a container store.
#[derive(Clone)]
pub struct RecordTransformer {
    store: Arc<dyn ContainerStore>,
    config: Arc<PipelineConfig>,
    plan: Arc<TransformPlan>,
}

impl RecordTransformer {
    pub fn new(store: Arc<dyn ContainerStore>, config: Arc<PipelineConfig>, plan: TransformPlan) -> Self {
        Self { store, config, plan: Arc::new(plan) }
    }

    fn inventory(&self, reader: &dyn ContainerReader) -> Result<Inventory> {
        let ns = &self.config.namespace;
        let entries = reader.list_entries(ns)?;
        let top = entries
            .iter()
            .filter(|e| e.kind == EntryKind::Table && self.plan.spec.keeps(&e.name))
            .map(|e| join_path(ns, &e.name))
            .collect();

        let has_primitives = entries
            .iter()
            .any(|e| e.kind == EntryKind::Namespace && e.name == self.config.primitives_group);
        let primitives = if has_primitives {
            let group = self.config.primitives_path();
            table_names(reader, &group)?
                .into_iter()
                .map(|name| join_path(&group, &name))
                .collect()
        } else {
            Vec::new()
        };

        let metadata = MetadataRecord::read(reader, &self.config.metadata_path())?;
        Ok(Inventory { top, primitives, metadata })
    }

    fn rewrite(&self, batch: &RecordBatch, renumber: Option<&Renumber>, primitive: bool) -> Result<RecordBatch> {
        let mut out = match renumber {
            Some(r) => r.apply(batch)?,
            None => batch.clone(),
        };
        if self.plan.spec.add_event_uid {
            out = add_event_uid(&out, self.config.uid_run_multiplier)?;
        }
        if primitive {
            for f in &self.plan.spec.primitive_filters {
                out = expr::filter(&out, &f.predicate, &f.name)?;
            }
        }
        Ok(out)
    }

    /// Transform one partition and return the output container path.
    ///
    /// # Errors
    /// [`JobError::Open`] when the input cannot be opened or inventoried;
    /// [`JobError::Transform`] for anything after that. A half-written output
    /// is left in place.
    pub fn transform(&self, input: &InputDescriptor) -> Result<PathBuf, JobError> {
        info!(partition = %input.key, location = %input.location, "processing");

        let reader = self.store.open(&input.location).map_err(JobError::Open)?;
        let inventory = self.inventory(reader.as_ref()).map_err(JobError::Open)?;

        let out_path = self.plan.output_path(input);
        info!(partition = %input.key, output = %out_path.display(), "saving transformed tables");
        self.write_output(reader.as_ref(), input, &inventory, &out_path)
            .map_err(JobError::Transform)?;
        Ok(out_path)
    }

    fn write_output(
        &self,
        reader: &dyn ContainerReader,
        input: &InputDescriptor,
        inventory: &Inventory,
        out_path: &Path,
    ) -> Result<()> {
        let renumber = if self.plan.renumber {
            Some(Renumber::for_key(&input.key, self.config.job_offset_multiplier)?)
        } else {
            None
        };

        if same_location(out_path, &input.raw_path) {
            bail!(
                "output {} would overwrite its own input {}",
                out_path.display(),
                input.raw_path.display()
            );
        }

        let mut writer = self.store.create(out_path, WriteMode::Recreate)?;
        writer.make_namespace(&self.config.namespace)?;
        drop(writer);

        let tables = inventory
            .top
            .iter()
            .map(|t| (t, false))
            .chain(inventory.primitives.iter().map(|t| (t, true)));
        for (path, primitive) in tables {
            let batch = reader.read_table(path)?;
            let rows_in = batch.num_rows();
            let out = self
                .rewrite(&batch, renumber.as_ref(), primitive)
                .with_context(|| format!("transform table {path:?} of partition {}", input.key))?;
            debug!(table = %path, rows_in, rows_out = out.num_rows(), "table rewritten");

            let mut writer = self.store.create(out_path, WriteMode::Update)?;
            writer.write_table(path, &out)?;
        }

        let mut writer = self.store.create(out_path, WriteMode::Update)?;
        inventory
            .metadata
            .write(writer.as_mut(), &self.config.metadata_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renumber_offsets() {
        let r = Renumber::for_key(&PartitionKey::run_job(4, 12), 10).unwrap();
        assert_eq!(r, Renumber { offset: 120, run_override: Some(4) });
        assert!(Renumber::for_key(&PartitionKey::job(u64::MAX), 10).is_err());
    }

    #[test]
    fn slim_masks() {
        let nu = TransformSpec::slim(SlimMode::Nu).unwrap();
        assert!(nu.keeps("mcneutrinos"));
        assert!(!TransformSpec::slim(SlimMode::Pgun).unwrap().keeps("mcneutrinos"));
        assert!(TransformSpec::slim(SlimMode::Bkg).unwrap().keeps("event_summary"));
        assert_eq!(nu.primitive_filters[0].name, "sot_cut");
        assert_eq!(nu.primitive_filters[0].predicate.to_string(), "(samples_over_threshold > 7)");
        assert!(TransformSpec::identity().keeps("anything"));
    }
}
