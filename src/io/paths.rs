//! Path identity on the local filesystem.
//!
//! Two spellings of one location (`data/x`, `/abs/data/x`, `sub/../data/x`,
//! or a path through a symlink) must compare equal before anything is
//! recreated at an output path.

use std::path::{Component, Path, PathBuf};

/// `path` with symlinks, `.` and `..` resolved.
///
/// The longest existing prefix is canonicalized by the filesystem. Components
/// below it do not exist yet, so they cannot be symlinks and are resolved
/// lexically.
#[must_use]
pub fn resolve(path: &Path) -> PathBuf {
    for ancestor in path.ancestors() {
        let existing = if ancestor.as_os_str().is_empty() { Path::new(".") } else { ancestor };
        let Ok(mut out) = existing.canonicalize() else {
            continue;
        };
        let rest = path.strip_prefix(ancestor).unwrap_or(Path::new(""));
        for component in rest.components() {
            match component {
                Component::CurDir => {}
                Component::ParentDir => {
                    out.pop();
                }
                other => out.push(other),
            }
        }
        return out;
    }
    path.to_path_buf()
}

/// Whether `a` and `b` name the same filesystem location.
#[must_use]
pub fn same_location(a: &Path, b: &Path) -> bool {
    a == b || resolve(a) == resolve(b)
}
