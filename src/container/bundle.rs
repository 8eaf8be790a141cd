//! Directory-backed container engine.
//!
//! A bundle is a directory tree:
//!
//! - a sub-directory is a namespace,
//! - `<name>.parquet` is a table (Arrow schema embedded by the writer),
//! - `<name>.obj` is an opaque scalar record.
//!
//! Anything else in the tree is ignored when listing.
//!
//! ```no_run
//! use evfix::container::{BundleStore, ContainerStore, WriteMode};
//! use std::path::Path;
//!
//! # fn main() -> anyhow::Result<()> {
//! let store = BundleStore::new();
//! let reader = store.open("data/run1_0_ana.ntuple.root")?;
//! for entry in reader.list_entries("triggerAna")? {
//!     println!("{entry:?}");
//! }
//! let mut out = store.create(Path::new("out/copy.ntuple.root"), WriteMode::Recreate)?;
//! out.write_table("triggerAna/event_summary", &reader.read_table("triggerAna/event_summary")?)?;
//! # Ok(())
//! # }
//! ```

use super::{ContainerReader, ContainerStore, ContainerWriter, Entry, EntryKind, WriteMode};
use anyhow::{Context, Result, bail};
use arrow::compute::concat_batches;
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::arrow_writer::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;
use std::fs::{File, create_dir_all, read_dir, remove_dir_all, remove_file};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const TABLE_EXT: &str = "parquet";
const RECORD_EXT: &str = "obj";

/// Stateless factory for bundle readers and writers.
#[derive(Clone, Copy, Debug, Default)]
pub struct BundleStore;

impl BundleStore {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

/// Map a `/`-separated container path onto the filesystem below `root`.
fn fs_path(root: &Path, path: &str) -> Result<PathBuf> {
    let mut out = root.to_path_buf();
    for part in path.split('/').filter(|p| !p.is_empty()) {
        if part == "." || part == ".." {
            bail!("invalid container path component {part:?} in {path:?}");
        }
        out.push(part);
    }
    Ok(out)
}

fn with_ext(root: &Path, path: &str, ext: &str) -> Result<PathBuf> {
    let mut p = fs_path(root, path)?;
    if p == root {
        bail!("empty entry path");
    }
    let name = format!(
        "{}.{ext}",
        p.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
    );
    p.set_file_name(name);
    Ok(p)
}

pub struct BundleReader {
    location: String,
    root: PathBuf,
}

impl ContainerReader for BundleReader {
    fn location(&self) -> &str {
        &self.location
    }

    fn list_entries(&self, namespace: &str) -> Result<Vec<Entry>> {
        let dir = fs_path(&self.root, namespace)?;
        let rd = read_dir(&dir)
            .with_context(|| format!("list namespace {namespace:?} in {}", self.location))?;

        let mut out = Vec::new();
        for entry in rd {
            let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
            let path = entry.path();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                out.push(Entry::new(entry.file_name().to_string_lossy(), EntryKind::Namespace));
                continue;
            }
            let kind = match path.extension().and_then(|e| e.to_str()) {
                Some(TABLE_EXT) => EntryKind::Table,
                Some(RECORD_EXT) => EntryKind::Record,
                _ => continue,
            };
            if let Some(stem) = path.file_stem() {
                out.push(Entry::new(stem.to_string_lossy(), kind));
            }
        }
        out.sort();
        Ok(out)
    }

    fn read_table(&self, path: &str) -> Result<RecordBatch> {
        let file_path = with_ext(&self.root, path, TABLE_EXT)?;
        let f = File::open(&file_path)
            .with_context(|| format!("open table {path:?} in {}", self.location))?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(f)
            .with_context(|| format!("open ParquetRecordBatchReader for {path:?}"))?;
        let schema = builder.schema().clone();
        let reader = builder
            .with_batch_size(64 * 1024)
            .build()
            .context("build ParquetRecordBatchReader")?;

        let batches = reader
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("read table {path:?} in {}", self.location))?;
        concat_batches(&schema, &batches).with_context(|| format!("concat batches of {path:?}"))
    }

    fn read_record(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let file_path = with_ext(&self.root, path, RECORD_EXT)?;
        match std::fs::read(&file_path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("read record {path:?} in {}", self.location)),
        }
    }
}

pub struct BundleWriter {
    root: PathBuf,
}

impl BundleWriter {
    fn ensure_parent(&self, file_path: &Path) -> Result<()> {
        if let Some(parent) = file_path.parent() {
            create_dir_all(parent).with_context(|| format!("mkdir -p {}", parent.display()))?;
        }
        Ok(())
    }
}

impl ContainerWriter for BundleWriter {
    fn make_namespace(&mut self, path: &str) -> Result<()> {
        let dir = fs_path(&self.root, path)?;
        create_dir_all(&dir).with_context(|| format!("mkdir -p {}", dir.display()))
    }

    fn write_table(&mut self, path: &str, batch: &RecordBatch) -> Result<()> {
        let file_path = with_ext(&self.root, path, TABLE_EXT)?;
        self.ensure_parent(&file_path)?;

        let file = File::create(&file_path)
            .with_context(|| format!("create {}", file_path.display()))?;
        let props = WriterProperties::builder()
            .set_compression(Compression::ZSTD(ZstdLevel::default()))
            .build();
        let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))
            .context("create ArrowWriter")?;
        writer
            .write(batch)
            .with_context(|| format!("write table {path:?}"))?;
        writer.close().context("close ArrowWriter")?;
        Ok(())
    }

    fn write_record(&mut self, path: &str, bytes: &[u8]) -> Result<()> {
        let file_path = with_ext(&self.root, path, RECORD_EXT)?;
        self.ensure_parent(&file_path)?;
        std::fs::write(&file_path, bytes)
            .with_context(|| format!("write record {}", file_path.display()))
    }
}

impl ContainerStore for BundleStore {
    fn open(&self, location: &str) -> Result<Box<dyn ContainerReader>> {
        if let Some((scheme, _)) = location.split_once("://") {
            bail!("{scheme}:// locations are not served by the bundle store: {location}");
        }
        let root = PathBuf::from(location);
        let meta = std::fs::metadata(&root).with_context(|| format!("open {location}"))?;
        if !meta.is_dir() {
            bail!("{location} is not a container bundle");
        }
        Ok(Box::new(BundleReader { location: location.to_string(), root }))
    }

    fn create(&self, path: &Path, mode: WriteMode) -> Result<Box<dyn ContainerWriter>> {
        if mode == WriteMode::Recreate {
            self.remove(path)?;
        }
        create_dir_all(path).with_context(|| format!("create container {}", path.display()))?;
        Ok(Box::new(BundleWriter { root: path.to_path_buf() }))
    }

    fn remove(&self, path: &Path) -> Result<()> {
        let res = match std::fs::symlink_metadata(path) {
            Ok(m) if m.is_dir() => remove_dir_all(path),
            Ok(_) => remove_file(path),
            Err(e) => Err(e),
        };
        match res {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
        }
    }
}
