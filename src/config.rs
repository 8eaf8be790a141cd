//! Batch-wide configuration.
//!
//! A [`PipelineConfig`] is built once per invocation (defaults, then an
//! optional TOML file, then command-line overrides) and handed explicitly to
//! every worker. Nothing in the crate reads process-global settings.
//!
//! ```
//! use evfix::config::PipelineConfig;
//!
//! let cfg: PipelineConfig = toml::from_str(r#"
//!     workers = 8
//!     fan_in = 100
//!
//!     [[remote_rewrites]]
//!     prefix = "/eos/project/"
//!     replacement = "root://eosproject.cern.ch/"
//! "#).unwrap();
//! assert_eq!(cfg.workers, 8);
//! assert_eq!(cfg.namespace, "triggerAna");
//! ```

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Rewrite raw input paths that start with `prefix` by prepending `replacement`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRewrite {
    pub prefix: String,
    pub replacement: String,
}

/// Settings shared by every job and merge of one run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Top-level namespace holding the tables.
    pub namespace: String,
    /// Sub-group of `namespace` holding the trigger-primitive tables.
    pub primitives_group: String,
    /// Name of the metadata record inside `namespace`.
    pub metadata_name: String,
    /// Transform worker pool size.
    pub workers: usize,
    /// Maximum number of containers a single merge call may hold open.
    pub fan_in: usize,
    /// Number of same-level chunk merges allowed to run at once.
    pub merge_jobs: usize,
    /// `RenumberOffset = job * job_offset_multiplier`.
    pub job_offset_multiplier: u64,
    /// `event_uid = run * uid_run_multiplier + event`.
    pub uid_run_multiplier: u64,
    /// Applied in order; the first matching prefix wins.
    pub remote_rewrites: Vec<RemoteRewrite>,
    /// Ceiling on the scheduler's wait for outcomes.
    pub job_timeout_secs: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            namespace: "triggerAna".to_string(),
            primitives_group: "TriggerPrimitives".to_string(),
            metadata_name: "info".to_string(),
            workers: 30,
            fan_in: 500,
            merge_jobs: 1,
            job_offset_multiplier: 10,
            uid_run_multiplier: 100_000,
            remote_rewrites: Vec::new(),
            job_timeout_secs: None,
        }
    }
}

impl PipelineConfig {
    /// Load from a TOML file; missing keys keep their defaults.
    ///
    /// # Errors
    /// Fails when the file cannot be read, is not valid TOML, contains unknown
    /// keys, or the resulting values do not pass [`PipelineConfig::validate`].
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let cfg: Self =
            toml::from_str(&text).with_context(|| format!("parse config {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check the invariants every stage relies on.
    ///
    /// # Errors
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            bail!("workers must be at least 1");
        }
        if self.fan_in < 2 {
            bail!("fan_in must be at least 2 (got {})", self.fan_in);
        }
        if self.merge_jobs == 0 {
            bail!("merge_jobs must be at least 1");
        }
        if self.job_offset_multiplier == 0 || self.uid_run_multiplier == 0 {
            bail!("multipliers must be at least 1");
        }
        if self.namespace.is_empty() || self.namespace.contains('/') {
            bail!("namespace must be a single non-empty path component");
        }
        if self.primitives_group.is_empty() || self.primitives_group.contains('/') {
            bail!("primitives_group must be a single non-empty path component");
        }
        Ok(())
    }

    /// Path of the primitive sub-group, e.g. `triggerAna/TriggerPrimitives`.
    #[must_use]
    pub fn primitives_path(&self) -> String {
        format!("{}/{}", self.namespace, self.primitives_group)
    }

    /// Path of the metadata record, e.g. `triggerAna/info`.
    #[must_use]
    pub fn metadata_path(&self) -> String {
        format!("{}/{}", self.namespace, self.metadata_name)
    }
}
