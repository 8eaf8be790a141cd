//! Hierarchical merging under a fan-in limit.
//!
//! The merge primitive keeps every input open for the whole call, so merging
//! thousands of containers at once exhausts file handles. [`HierarchicalMerger`]
//! splits the inputs into consecutive chunks of at most `fan_in` containers,
//! merges each chunk into a temporary container next to the final output, and
//! repeats on the temporaries until a single merge produces the output.
//!
//! Temporaries are named `tmp_l<level>_<chunk>_<output name>` and removed as
//! soon as the level above has consumed them, whether or not that merge
//! succeeded.
//!
//! The merger never rewrites fields. Inputs must already carry non-colliding
//! identifiers (see [`crate::transform`]).

use crate::container::{ContainerReader, ContainerStore, EntryKind, WriteMode, walk};
use crate::io::paths::{resolve, same_location};
use anyhow::{Context, Result, bail};
use arrow::compute::concat_batches;
use arrow::record_batch::RecordBatch;
use rayon::prelude::*;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Merge an ordered list of containers into one output in a single call.
pub trait MergePrimitive: Send + Sync {
    /// # Errors
    /// Any failure aborts the merge; the output may be incomplete.
    fn merge(&self, inputs: &[PathBuf], output: &Path) -> Result<()>;
}

/// Concatenates same-path tables across inputs in input order; scalar
/// records are taken from the first input holding them.
pub struct ContainerMerger {
    store: Arc<dyn ContainerStore>,
}

impl ContainerMerger {
    pub fn new(store: Arc<dyn ContainerStore>) -> Self {
        Self { store }
    }
}

impl MergePrimitive for ContainerMerger {
    fn merge(&self, inputs: &[PathBuf], output: &Path) -> Result<()> {
        if inputs.iter().any(|p| same_location(p, output)) {
            bail!("merge output {} is also an input", output.display());
        }
        info!(inputs = inputs.len(), output = %output.display(), "merging");

        // All inputs stay open until the output is written.
        let readers = inputs
            .iter()
            .map(|p| self.store.open(&p.to_string_lossy()))
            .collect::<Result<Vec<Box<dyn ContainerReader>>>>()?;

        let mut order: Vec<(String, EntryKind)> = Vec::new();
        let mut holders: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, reader) in readers.iter().enumerate() {
            for (path, kind) in walk(reader.as_ref(), "")
                .with_context(|| format!("list {}", reader.location()))?
            {
                let entry = holders.entry(path.clone()).or_default();
                if entry.is_empty() {
                    order.push((path, kind));
                }
                entry.push(idx);
            }
        }

        let mut writer = self.store.create(output, WriteMode::Recreate)?;
        for (path, kind) in &order {
            let holders = &holders[path];
            match kind {
                EntryKind::Table => {
                    let batches = holders
                        .iter()
                        .map(|&i| readers[i].read_table(path))
                        .collect::<Result<Vec<RecordBatch>>>()?;
                    let schema = batches[0].schema();
                    for (b, &i) in batches.iter().zip(holders).skip(1) {
                        if b.schema().fields() != schema.fields() {
                            bail!(
                                "table {path:?} in {} does not match the schema from {}",
                                readers[i].location(),
                                readers[holders[0]].location()
                            );
                        }
                    }
                    let merged = concat_batches(&schema, &batches)
                        .with_context(|| format!("concatenate table {path:?}"))?;
                    debug!(table = %path, rows = merged.num_rows(), "merged table");
                    writer.write_table(path, &merged)?;
                }
                EntryKind::Record => {
                    if let Some(bytes) = readers[holders[0]].read_record(path)? {
                        writer.write_record(path, &bytes)?;
                    }
                }
                EntryKind::Namespace => {}
            }
        }
        Ok(())
    }
}

/// Removes a temporary container when dropped. Absence is not an error.
struct TempContainer<'a> {
    path: PathBuf,
    store: &'a dyn ContainerStore,
}

impl Drop for TempContainer<'_> {
    fn drop(&mut self) {
        match self.store.remove(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "removed temporary"),
            Err(e) => warn!(path = %self.path.display(), "failed to remove temporary: {e:#}"),
        }
    }
}

/// Number of primitive merge calls made at each level, leaves first.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub calls_per_level: Vec<usize>,
}

impl MergeSummary {
    #[must_use]
    pub fn total_calls(&self) -> usize {
        self.calls_per_level.iter().sum()
    }

    #[must_use]
    pub fn levels(&self) -> usize {
        self.calls_per_level.len()
    }
}

pub struct HierarchicalMerger {
    primitive: Arc<dyn MergePrimitive>,
    store: Arc<dyn ContainerStore>,
    fan_in: usize,
    jobs: usize,
}

impl HierarchicalMerger {
    /// `store` is used to remove temporaries.
    ///
    /// # Errors
    /// Fails when `fan_in < 2` or `jobs == 0`.
    pub fn new(
        primitive: Arc<dyn MergePrimitive>,
        store: Arc<dyn ContainerStore>,
        fan_in: usize,
        jobs: usize,
    ) -> Result<Self> {
        if fan_in < 2 {
            bail!("fan-in limit must be at least 2 (got {fan_in})");
        }
        if jobs == 0 {
            bail!("merge jobs must be at least 1");
        }
        Ok(Self { primitive, store, fan_in, jobs })
    }

    /// Merge `inputs`, in order, into `output`.
    ///
    /// At most `fan_in` containers are passed to any single primitive call,
    /// and at most `jobs` such calls run at once.
    ///
    /// # Errors
    /// Fails up front when an input is named like one of this merge's
    /// temporaries. Any chunk failure aborts the whole merge. Temporaries
    /// created so far are still removed.
    pub fn merge(&self, inputs: &[PathBuf], output: &Path) -> Result<MergeSummary> {
        if inputs.is_empty() {
            bail!("nothing to merge");
        }
        if let Some(clash) = inputs.iter().find(|p| is_temp_of(p, output)) {
            bail!(
                "input {} is named like a temporary of {}; rename it or pick another output",
                clash.display(),
                output.display()
            );
        }
        let pool = if self.jobs > 1 {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(self.jobs)
                    .thread_name(|i| format!("evfix-merge-{i}"))
                    .build()
                    .context("build merge pool")?,
            )
        } else {
            None
        };

        let mut summary = MergeSummary::default();
        self.merge_level(inputs, output, 1, pool.as_ref(), &mut summary)?;
        info!(
            output = %output.display(),
            levels = summary.levels(),
            calls = summary.total_calls(),
            "merge finished"
        );
        Ok(summary)
    }

    fn merge_level(
        &self,
        inputs: &[PathBuf],
        output: &Path,
        level: usize,
        pool: Option<&rayon::ThreadPool>,
        summary: &mut MergeSummary,
    ) -> Result<()> {
        if inputs.len() <= self.fan_in {
            summary.calls_per_level.push(1);
            return self.primitive.merge(inputs, output);
        }

        let chunks: Vec<&[PathBuf]> = inputs.chunks(self.fan_in).collect();
        info!(level, inputs = inputs.len(), chunks = chunks.len(), "merging in chunks");

        let temps: Vec<TempContainer<'_>> = (0..chunks.len())
            .map(|idx| TempContainer {
                path: temp_path(output, level, idx),
                store: self.store.as_ref(),
            })
            .collect();

        let merge_chunk = |(chunk, temp): (&&[PathBuf], &TempContainer<'_>)| {
            self.primitive
                .merge(chunk, &temp.path)
                .with_context(|| format!("merge level {level} into {}", temp.path.display()))
        };
        match pool {
            Some(pool) => pool.install(|| {
                chunks
                    .par_iter()
                    .zip(temps.par_iter())
                    .try_for_each(merge_chunk)
            })?,
            None => chunks.iter().zip(temps.iter()).try_for_each(merge_chunk)?,
        }
        summary.calls_per_level.push(chunks.len());

        let temp_paths: Vec<PathBuf> = temps.iter().map(|t| t.path.clone()).collect();
        self.merge_level(&temp_paths, output, level + 1, pool, summary)
        // `temps` drop here, after the level above consumed them.
    }
}

/// `<dir>/tmp_l<level>_<idx>_<name>` next to `output`.
#[must_use]
pub fn temp_path(output: &Path, level: usize, idx: usize) -> PathBuf {
    let name = output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "merged".to_string());
    output.with_file_name(format!("tmp_l{level}_{idx:03}_{name}"))
}

/// Whether `candidate` could be produced by [`temp_path`] for `output`.
#[must_use]
pub fn is_temp_of(candidate: &Path, output: &Path) -> bool {
    let (Some(file), Some(name)) = (candidate.file_name(), output.file_name()) else {
        return false;
    };
    let file = file.to_string_lossy();
    let name = name.to_string_lossy();
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    let matches_scheme = file
        .strip_prefix("tmp_l")
        .and_then(|rest| rest.strip_suffix(name.as_ref()))
        .and_then(|rest| rest.strip_suffix('_'))
        .and_then(|rest| rest.split_once('_'))
        .is_some_and(|(level, idx)| digits(level) && digits(idx));
    matches_scheme && resolve(&parent_dir(candidate)) == resolve(&parent_dir(output))
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
