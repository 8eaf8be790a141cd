//! Partition identity: derive a typed key from each input file name.
//!
//! Batch jobs name their outputs `<base>_<job>_ana.ntuple.<ext>` or
//! `<base>_<run>_<job>_ana.ntuple.<ext>`. [`KeyPattern`] selects which form a
//! tool expects, and [`discover`] sorts a list of paths into accepted inputs,
//! names that do not match, and keys claimed by more than one file.

use crate::config::RemoteRewrite;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static JOB_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.*)_(\d+)_ana\.ntuple\.([A-Za-z0-9]+)$").expect("valid job pattern")
});

static RUN_JOB_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.*)_(\d+)_(\d+)_ana\.ntuple\.([A-Za-z0-9]+)$").expect("valid run+job pattern")
});

/// Identity of one partition within a batch.
///
/// Ordered by run (absent first), then job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct PartitionKey {
    pub run: Option<u64>,
    pub job: u64,
}

impl PartitionKey {
    #[must_use]
    pub const fn job(job: u64) -> Self {
        Self { run: None, job }
    }

    #[must_use]
    pub const fn run_job(run: u64, job: u64) -> Self {
        Self { run: Some(run), job }
    }

    /// Name fragment used in output file names: `7` or `3_7`.
    #[must_use]
    pub fn file_tag(&self) -> String {
        match self.run {
            Some(run) => format!("{run}_{}", self.job),
            None => self.job.to_string(),
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.run {
            Some(run) => write!(f, "({run}, {})", self.job),
            None => write!(f, "{}", self.job),
        }
    }
}

/// Which naming convention the invoking tool expects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyPattern {
    /// `<base>_<job>_ana.ntuple.<ext>`
    Job,
    /// `<base>_<run>_<job>_ana.ntuple.<ext>`
    RunJob,
}

/// Result of matching a file name against a [`KeyPattern`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedName {
    pub key: PartitionKey,
    pub base: String,
    pub ext: String,
}

impl KeyPattern {
    /// Match a bare file name. Returns `None` when the name does not fit, or
    /// when a captured number does not fit in `u64`.
    #[must_use]
    pub fn parse(self, file_name: &str) -> Option<ParsedName> {
        match self {
            Self::Job => {
                let caps = JOB_RE.captures(file_name)?;
                Some(ParsedName {
                    key: PartitionKey::job(caps[2].parse().ok()?),
                    base: caps[1].to_string(),
                    ext: caps[3].to_string(),
                })
            }
            Self::RunJob => {
                let caps = RUN_JOB_RE.captures(file_name)?;
                Some(ParsedName {
                    key: PartitionKey::run_job(caps[2].parse().ok()?, caps[3].parse().ok()?),
                    base: caps[1].to_string(),
                    ext: caps[4].to_string(),
                })
            }
        }
    }
}

/// One accepted input. Immutable once discovered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InputDescriptor {
    /// Path as given by the caller.
    pub raw_path: PathBuf,
    /// Location handed to the container store after remote rewriting.
    pub location: String,
    pub key: PartitionKey,
    pub base: String,
    pub ext: String,
}

impl InputDescriptor {
    /// Output path for the renumbering tools:
    /// `<outdir>/<base>_<tag>_evfix_ana.ntuple.<ext>`.
    #[must_use]
    pub fn fixed_output_path(&self, outdir: &Path) -> PathBuf {
        outdir.join(format!(
            "{}_{}_evfix_ana.ntuple.{}",
            self.base,
            self.key.file_tag(),
            self.ext
        ))
    }

    /// Output path for the slimming tool: the input file name under `outdir`.
    #[must_use]
    pub fn slim_output_path(&self, outdir: &Path) -> PathBuf {
        match self.raw_path.file_name() {
            Some(name) => outdir.join(name),
            None => outdir.join(format!("{}.ntuple.{}", self.base, self.ext)),
        }
    }
}

/// Apply the first matching remote rewrite to `raw`.
#[must_use]
pub fn resolve_location(raw: &Path, rewrites: &[RemoteRewrite]) -> String {
    let raw = raw.to_string_lossy();
    rewrites
        .iter()
        .find(|r| raw.starts_with(r.prefix.as_str()))
        .map_or_else(|| raw.to_string(), |r| format!("{}{raw}", r.replacement))
}

/// Inputs sorted by how they fared during name matching.
#[derive(Debug, Default)]
pub struct Discovery {
    pub accepted: BTreeMap<PartitionKey, InputDescriptor>,
    pub no_match: Vec<PathBuf>,
    /// Keys claimed by more than one file. None of these files is accepted.
    pub collisions: BTreeMap<PartitionKey, Vec<PathBuf>>,
}

impl Discovery {
    #[must_use]
    pub fn has_collisions(&self) -> bool {
        !self.collisions.is_empty()
    }
}

/// Match every path against `pattern` and resolve the accepted ones.
pub fn discover<P: AsRef<Path>>(
    paths: &[P],
    pattern: KeyPattern,
    rewrites: &[RemoteRewrite],
) -> Discovery {
    let mut out = Discovery::default();
    for path in paths {
        let path = path.as_ref();
        let parsed = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| pattern.parse(n));
        let Some(parsed) = parsed else {
            out.no_match.push(path.to_path_buf());
            continue;
        };

        if let Some(clashing) = out.collisions.get_mut(&parsed.key) {
            clashing.push(path.to_path_buf());
            continue;
        }
        if let Some(previous) = out.accepted.remove(&parsed.key) {
            out.collisions
                .insert(parsed.key, vec![previous.raw_path, path.to_path_buf()]);
            continue;
        }

        out.accepted.insert(
            parsed.key,
            InputDescriptor {
                raw_path: path.to_path_buf(),
                location: resolve_location(path, rewrites),
                key: parsed.key,
                base: parsed.base,
                ext: parsed.ext,
            },
        );
    }
    out
}

/// Accept every path in argument order, keyed by its position.
///
/// Used by the slimming tool, which does not rely on the naming convention.
pub fn enumerate_inputs<P: AsRef<Path>>(paths: &[P], rewrites: &[RemoteRewrite]) -> Discovery {
    let mut out = Discovery::default();
    for (idx, path) in paths.iter().enumerate() {
        let path = path.as_ref();
        let key = PartitionKey::job(idx as u64);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let (base, ext) = match name.rsplit_once('.') {
            Some((b, e)) => (b.to_string(), e.to_string()),
            None => (name.clone(), String::new()),
        };
        out.accepted.insert(
            key,
            InputDescriptor {
                raw_path: path.to_path_buf(),
                location: resolve_location(path, rewrites),
                key,
                base,
                ext,
            },
        );
    }
    out
}
