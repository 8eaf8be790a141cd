//! End-of-batch summary for the operator.
//!
//! A [`BatchReport`] is assembled from discovery results and job outcomes.
//! It can be printed in a human-readable form or saved as JSON.

use crate::error::FailureKind;
use crate::partition::{Discovery, PartitionKey};
use crate::scheduler::{JobOutcome, JobResult};
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Completed {
    pub partition: String,
    pub output: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub partition: String,
    pub kind: FailureKind,
    pub message: String,
}

/// Per-partition lists keep partition-key order, so `10` follows `9`.

#[derive(Clone, Debug, Default, Serialize)]
pub struct BatchReport {
    pub accepted: usize,
    pub no_match: Vec<PathBuf>,
    pub collisions: Vec<(String, Vec<PathBuf>)>,
    pub succeeded: Vec<Completed>,
    pub failed: Vec<Failure>,
    pub timed_out: Vec<String>,
    pub elapsed_secs: f64,
}

impl BatchReport {
    #[must_use]
    pub fn new(
        discovery: &Discovery,
        outcomes: &BTreeMap<PartitionKey, JobOutcome>,
        elapsed: Duration,
    ) -> Self {
        let mut report = Self {
            accepted: discovery.accepted.len(),
            no_match: discovery.no_match.clone(),
            collisions: discovery
                .collisions
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            elapsed_secs: elapsed.as_secs_f64(),
            ..Self::default()
        };

        for (key, outcome) in outcomes {
            match &outcome.result {
                JobResult::Done(path) => report
                    .succeeded
                    .push(Completed { partition: key.to_string(), output: path.clone() }),
                JobResult::Failed(e) => report.failed.push(Failure {
                    partition: key.to_string(),
                    kind: e.kind(),
                    message: e.to_string(),
                }),
                JobResult::TimedOut => report.timed_out.push(key.to_string()),
            }
        }
        report
    }

    /// Successful outputs in partition-key order, ready for merging.
    #[must_use]
    pub fn outputs(&self) -> Vec<PathBuf> {
        self.succeeded.iter().map(|c| c.output.clone()).collect()
    }

    /// Failed plus timed-out partitions.
    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.failed.len() + self.timed_out.len()
    }

    /// Print the summary to stdout.
    pub fn print(&self) {
        println!("\n========== Batch Summary ==========");
        println!("Elapsed: {:.3}s", self.elapsed_secs);
        println!(
            "Accepted: {}  Succeeded: {}  Failed: {}  Timed out: {}",
            self.accepted,
            self.succeeded.len(),
            self.failed.len(),
            self.timed_out.len()
        );
        if !self.no_match.is_empty() {
            println!("Files without a partition id:");
            for f in &self.no_match {
                println!("- {}", f.display());
            }
        }
        if !self.collisions.is_empty() {
            println!("Partition ids claimed by several files:");
            for (key, files) in &self.collisions {
                println!("- {key}:");
                for f in files {
                    println!("    {}", f.display());
                }
            }
        }
        if !self.failed.is_empty() {
            println!("Failed partitions:");
            for failure in &self.failed {
                println!("- {} [{:?}]: {}", failure.partition, failure.kind, failure.message);
            }
        }
        if !self.timed_out.is_empty() {
            println!("Timed out: {}", self.timed_out.join(", "));
        }
        println!("===================================\n");
    }

    /// Save the report as pretty-printed JSON.
    ///
    /// # Errors
    /// Fails when the file cannot be created or written.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut file = File::create(path).with_context(|| format!("create {}", path.display()))?;
        let formatted = serde_json::to_string_pretty(self)?;
        file.write_all(formatted.as_bytes())?;
        Ok(())
    }
}
