//! Bounded-concurrency job scheduler with per-job failure isolation.
//!
//! Every accepted partition becomes one job on a dedicated Rayon pool of
//! `workers` threads. A job that fails, or panics, only affects its own
//! [`JobOutcome`]; siblings keep running. Outcomes are delivered to the caller
//! in completion order and also returned keyed by [`PartitionKey`].

use crate::error::{JobError, panic_message};
use crate::partition::{InputDescriptor, PartitionKey};
use crate::transform::RecordTransformer;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::{RecvTimeoutError, channel};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Work performed for one partition.
pub trait Job: Send + Sync + 'static {
    /// # Errors
    /// Any failure is recorded as this partition's outcome.
    fn run(&self, input: &InputDescriptor) -> Result<PathBuf, JobError>;
}

impl Job for RecordTransformer {
    fn run(&self, input: &InputDescriptor) -> Result<PathBuf, JobError> {
        self.transform(input)
    }
}

impl<F> Job for F
where
    F: Fn(&InputDescriptor) -> Result<PathBuf, JobError> + Send + Sync + 'static,
{
    fn run(&self, input: &InputDescriptor) -> Result<PathBuf, JobError> {
        self(input)
    }
}

/// What happened to one job.
#[derive(Debug)]
pub enum JobResult {
    Done(PathBuf),
    Failed(JobError),
    /// Still pending when the scheduler stopped waiting.
    TimedOut,
}

#[derive(Debug)]
pub struct JobOutcome {
    pub key: PartitionKey,
    pub result: JobResult,
}

impl JobOutcome {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.result, JobResult::Done(_))
    }

    #[must_use]
    pub fn output(&self) -> Option<&PathBuf> {
        match &self.result {
            JobResult::Done(p) => Some(p),
            _ => None,
        }
    }
}

/// Runs jobs on a private pool of fixed size.
#[derive(Clone, Copy, Debug)]
pub struct Scheduler {
    pub workers: usize,
    pub timeout: Option<Duration>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self { workers: num_cpus::get().max(1), timeout: None }
    }
}

impl Scheduler {
    /// `workers == 0` selects one worker per CPU.
    #[must_use]
    pub fn new(workers: usize) -> Self {
        Self {
            workers: if workers == 0 { num_cpus::get().max(1) } else { workers },
            timeout: None,
        }
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run `job` for every input and wait for all outcomes (or the timeout).
    ///
    /// `on_outcome` sees each outcome as it completes. The returned map holds
    /// exactly one outcome per input.
    ///
    /// # Errors
    /// Fails only when the worker pool cannot be built.
    pub fn run<J, F>(
        &self,
        job: Arc<J>,
        inputs: &BTreeMap<PartitionKey, InputDescriptor>,
        mut on_outcome: F,
    ) -> Result<BTreeMap<PartitionKey, JobOutcome>>
    where
        J: Job,
        F: FnMut(&JobOutcome),
    {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .thread_name(|i| format!("evfix-worker-{i}"))
            .build()
            .context("build worker pool")?;

        let (tx, rx) = channel::<JobOutcome>();
        for input in inputs.values() {
            let job = Arc::clone(&job);
            let input = input.clone();
            let tx = tx.clone();
            pool.spawn(move || {
                let result = match catch_unwind(AssertUnwindSafe(|| job.run(&input))) {
                    Ok(Ok(path)) => JobResult::Done(path),
                    Ok(Err(e)) => JobResult::Failed(e),
                    Err(payload) => JobResult::Failed(JobError::Panicked(panic_message(payload.as_ref()))),
                };
                // The receiver is gone only after a timeout; the outcome is moot then.
                let _ = tx.send(JobOutcome { key: input.key, result });
            });
        }
        drop(tx);

        let deadline = self.timeout.map(|t| Instant::now() + t);
        let mut outcomes = BTreeMap::new();
        while outcomes.len() < inputs.len() {
            let next = match deadline {
                Some(d) => rx.recv_timeout(d.saturating_duration_since(Instant::now())),
                None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match next {
                Ok(outcome) => {
                    log_outcome(&outcome);
                    on_outcome(&outcome);
                    outcomes.insert(outcome.key, outcome);
                }
                Err(RecvTimeoutError::Timeout) => {
                    warn!(pending = inputs.len() - outcomes.len(), "stopped waiting for jobs");
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        for key in inputs.keys() {
            if !outcomes.contains_key(key) {
                let outcome = JobOutcome { key: *key, result: JobResult::TimedOut };
                on_outcome(&outcome);
                outcomes.insert(*key, outcome);
            }
        }
        Ok(outcomes)
    }
}

fn log_outcome(outcome: &JobOutcome) {
    match &outcome.result {
        JobResult::Done(path) => info!(partition = %outcome.key, output = %path.display(), "job completed"),
        JobResult::Failed(e) => warn!(partition = %outcome.key, kind = ?e.kind(), "job failed: {e}"),
        JobResult::TimedOut => warn!(partition = %outcome.key, "job timed out"),
    }
}
