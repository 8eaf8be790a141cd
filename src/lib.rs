//! # evfix
//!
//! Consolidate partitioned ntuple containers produced by batch jobs into a
//! dataset with globally unique event identifiers, then merge the results
//! into a few final containers without exceeding a file-handle budget.
//!
//! ## Pipeline
//!
//! 1. [`partition`] derives a [`PartitionKey`] (job number, or run and job
//!    number) from each input file name. Names that do not match are reported
//!    and skipped; keys claimed twice are reported and never processed.
//! 2. [`transform`] rewrites one container per partition: `event` is offset by
//!    `10 × job`, `run` is overwritten when the key carries a run number,
//!    tables can be masked, `event_uid` can be derived, and primitive tables
//!    can be filtered with [`expr`] predicates. The metadata record is copied
//!    verbatim by [`metadata`].
//! 3. [`scheduler`] runs the transform for every partition on a fixed-size
//!    worker pool. A failed or panicking job only affects its own
//!    [`JobOutcome`].
//! 4. [`merge`] folds any number of containers into one, chunking by a fan-in
//!    limit and removing every temporary it creates.
//!
//! Storage goes through the [`container`] traits; [`container::BundleStore`]
//! keeps each container as a directory of Parquet tables.
//!
//! ## Example
//!
//! ```no_run
//! use evfix::*;
//! use std::sync::Arc;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = Arc::new(PipelineConfig::default());
//! let store: Arc<dyn ContainerStore> = Arc::new(BundleStore::new());
//!
//! let inputs = vec!["data/run1_0_ana.ntuple.root", "data/run1_1_ana.ntuple.root"];
//! let discovery = discover(&inputs, KeyPattern::Job, &config.remote_rewrites);
//!
//! let transformer = RecordTransformer::new(
//!     Arc::clone(&store),
//!     Arc::clone(&config),
//!     TransformPlan {
//!         spec: TransformSpec::identity(),
//!         renumber: true,
//!         naming: OutputNaming::Fixed,
//!         outdir: "fixed".into(),
//!     },
//! );
//! let outcomes = Scheduler::new(config.workers).run(Arc::new(transformer), &discovery.accepted, |_| {})?;
//!
//! let outputs: Vec<_> = outcomes.values().filter_map(|o| o.output().cloned()).collect();
//! let merger = HierarchicalMerger::new(
//!     Arc::new(ContainerMerger::new(Arc::clone(&store))),
//!     store,
//!     config.fan_in,
//!     config.merge_jobs,
//! )?;
//! merger.merge(&outputs, "merged.ntuple.root".as_ref())?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Overview
//!
//! - [`config`] - batch-wide settings, loadable from TOML
//! - [`container`] - storage traits and the Parquet bundle engine
//! - [`expr`] - column expressions for redefinitions and filters
//! - [`inspect`] - post-run checks (`event_uid` counts, timestamps)
//! - [`io`] - command-line input expansion
//! - [`report`] - end-of-batch summary
//! - [`testing`] - fixtures for building containers in tests

pub mod config;
pub mod container;
pub mod error;
pub mod expr;
pub mod inspect;
pub mod io;
pub mod merge;
pub mod metadata;
pub mod partition;
pub mod report;
pub mod scheduler;
pub mod testing;
pub mod transform;

pub use config::{PipelineConfig, RemoteRewrite};
pub use container::{BundleStore, ContainerReader, ContainerStore, ContainerWriter, Entry, EntryKind, WriteMode};
pub use error::{FailureKind, JobError};
pub use expr::Expr;
pub use merge::{ContainerMerger, HierarchicalMerger, MergePrimitive, MergeSummary};
pub use metadata::MetadataRecord;
pub use partition::{Discovery, InputDescriptor, KeyPattern, PartitionKey, discover, enumerate_inputs};
pub use report::BatchReport;
pub use scheduler::{Job, JobOutcome, JobResult, Scheduler};
pub use transform::{NamedFilter, OutputNaming, RecordTransformer, Renumber, SlimMode, TransformPlan, TransformSpec};
