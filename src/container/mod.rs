//! Container storage boundary.
//!
//! A container is a hierarchy of namespaces holding named tables and opaque
//! scalar records. The pipeline only talks to storage through the traits in
//! this module:
//!
//! - [`ContainerStore`] opens containers for reading, creates them for
//!   writing, and removes them.
//! - [`ContainerReader`] lists entries with their kind and reads tables and
//!   records.
//! - [`ContainerWriter`] writes tables and records.
//!
//! [`bundle::BundleStore`] is the bundled engine (directory of Parquet files).

pub mod bundle;

pub use bundle::BundleStore;

use anyhow::Result;
use arrow::record_batch::RecordBatch;
use std::path::Path;

/// Kind of a container entry, as reported by [`ContainerReader::list_entries`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntryKind {
    Namespace,
    Table,
    Record,
}

/// A named entry directly under a namespace.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Entry {
    pub name: String,
    pub kind: EntryKind,
}

impl Entry {
    pub fn new(name: impl Into<String>, kind: EntryKind) -> Self {
        Self { name: name.into(), kind }
    }
}

/// How [`ContainerStore::create`] treats an existing container.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteMode {
    /// Discard anything already at the path.
    Recreate,
    /// Keep existing entries; writes add or replace individual entries.
    Update,
}

/// Read access to one open container.
pub trait ContainerReader: Send {
    /// Location this reader was opened from.
    fn location(&self) -> &str;

    /// Entries directly under `namespace` (`""` is the root), sorted by name.
    ///
    /// # Errors
    /// Fails when the namespace does not exist or cannot be listed.
    fn list_entries(&self, namespace: &str) -> Result<Vec<Entry>>;

    /// Read a whole table into memory.
    ///
    /// # Errors
    /// Fails when the table is missing or cannot be decoded.
    fn read_table(&self, path: &str) -> Result<RecordBatch>;

    /// Read a scalar record, `None` when absent.
    ///
    /// # Errors
    /// Fails only on I/O errors other than absence.
    fn read_record(&self, path: &str) -> Result<Option<Vec<u8>>>;
}

/// Write access to one container.
pub trait ContainerWriter: Send {
    /// Create a namespace (and its parents) if missing.
    ///
    /// # Errors
    /// Fails on I/O errors.
    fn make_namespace(&mut self, path: &str) -> Result<()>;

    /// Write a table at `path`, replacing a table of the same name only.
    ///
    /// # Errors
    /// Fails on encoding or I/O errors.
    fn write_table(&mut self, path: &str, batch: &RecordBatch) -> Result<()>;

    /// Write a scalar record at `path`.
    ///
    /// # Errors
    /// Fails on I/O errors.
    fn write_record(&mut self, path: &str, bytes: &[u8]) -> Result<()>;
}

/// Factory for readers and writers of one storage engine.
pub trait ContainerStore: Send + Sync {
    /// Open an existing container read-only.
    ///
    /// # Errors
    /// Fails when the location cannot be served or does not hold a container.
    fn open(&self, location: &str) -> Result<Box<dyn ContainerReader>>;

    /// Open a container for writing.
    ///
    /// # Errors
    /// Fails on I/O errors.
    fn create(&self, path: &Path, mode: WriteMode) -> Result<Box<dyn ContainerWriter>>;

    /// Delete a container. A missing container is not an error.
    ///
    /// # Errors
    /// Fails on I/O errors other than absence.
    fn remove(&self, path: &Path) -> Result<()>;
}

/// Join container path components, skipping empty ones.
#[must_use]
pub fn join_path(parent: &str, name: &str) -> String {
    match (parent.is_empty(), name.is_empty()) {
        (true, _) => name.to_string(),
        (false, true) => parent.to_string(),
        (false, false) => format!("{parent}/{name}"),
    }
}

/// Names of the tables directly under `namespace`.
///
/// # Errors
/// Propagates listing failures.
pub fn table_names(reader: &dyn ContainerReader, namespace: &str) -> Result<Vec<String>> {
    Ok(reader
        .list_entries(namespace)?
        .into_iter()
        .filter(|e| e.kind == EntryKind::Table)
        .map(|e| e.name)
        .collect())
}

/// Every table and record below `namespace`, as full paths, depth first in
/// name order.
///
/// # Errors
/// Propagates listing failures.
pub fn walk(reader: &dyn ContainerReader, namespace: &str) -> Result<Vec<(String, EntryKind)>> {
    let mut out = Vec::new();
    for entry in reader.list_entries(namespace)? {
        let path = join_path(namespace, &entry.name);
        match entry.kind {
            EntryKind::Namespace => out.extend(walk(reader, &path)?),
            kind => out.push((path, kind)),
        }
    }
    Ok(out)
}
