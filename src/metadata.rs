//! Carry the free-form metadata record from input to output unchanged.

use crate::container::{ContainerReader, ContainerWriter};
use anyhow::{Context, Result};
use tracing::debug;

/// Opaque metadata payload. `None` when the input had no record.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetadataRecord(pub Option<Vec<u8>>);

impl MetadataRecord {
    /// Read the record at `path`; absence is not an error.
    ///
    /// # Errors
    /// Fails on I/O errors other than absence.
    pub fn read(reader: &dyn ContainerReader, path: &str) -> Result<Self> {
        reader
            .read_record(path)
            .map(Self)
            .with_context(|| format!("read metadata {path:?} from {}", reader.location()))
    }

    /// Write the record at `path`. Nothing is written when it was absent.
    ///
    /// Must run after the table writes so the target namespace already exists.
    ///
    /// # Errors
    /// Fails on I/O errors.
    pub fn write(&self, writer: &mut dyn ContainerWriter, path: &str) -> Result<()> {
        match &self.0 {
            Some(bytes) => writer
                .write_record(path, bytes)
                .with_context(|| format!("write metadata {path:?}")),
            None => {
                debug!(path, "no metadata record to carry");
                Ok(())
            }
        }
    }
}
