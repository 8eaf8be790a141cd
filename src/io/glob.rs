//! Input expansion for command-line file arguments.
//!
//! Each argument is either a literal path or a glob pattern such as
//! `data/run1_*_ana.ntuple.root`. Patterns are expanded in sorted order so a
//! batch always sees its inputs in the same sequence. Containers may be
//! directories, so both files and directories are accepted.
//!
//! ```no_run
//! use evfix::io::glob::expand_inputs;
//!
//! let files = expand_inputs(&["data/*_ana.ntuple.root".to_string()])?;
//! # use anyhow::Error; Ok::<(), Error>(())
//! ```

use anyhow::{Context, Result, bail};
use glob::glob;
use std::path::PathBuf;

fn is_pattern(arg: &str) -> bool {
    arg.contains(['*', '?', '['])
}

/// Expand a glob pattern into sorted matching paths (files or directories).
///
/// # Errors
///
/// Returns an error if the pattern is invalid or a matched entry cannot be read.
/// No matches yield an empty vector.
pub fn expand_glob(pattern: &str) -> Result<Vec<PathBuf>> {
    let paths = glob(pattern).with_context(|| format!("invalid glob pattern: {pattern}"))?;

    let mut result = Vec::new();
    for entry in paths {
        let path =
            entry.with_context(|| format!("error reading glob entry for pattern: {pattern}"))?;
        if path.exists() {
            result.push(path);
        }
    }

    result.sort();
    Ok(result)
}

/// Expand every argument, keeping argument order between arguments.
///
/// Literal paths must exist locally unless they are URLs (`scheme://…`).
///
/// # Errors
///
/// Returns an error for a missing literal path, an invalid pattern, or a
/// pattern that matches nothing.
pub fn expand_inputs(args: &[String]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for arg in args {
        if arg.contains("://") {
            out.push(PathBuf::from(arg));
        } else if is_pattern(arg) {
            let matched = expand_glob(arg)?;
            if matched.is_empty() {
                bail!("no files found matching pattern: {arg}");
            }
            out.extend(matched);
        } else {
            let path = PathBuf::from(arg);
            if !path.exists() {
                bail!("input does not exist: {arg}");
            }
            out.push(path);
        }
    }
    Ok(out)
}
