//! In-memory session log and the JSON export written at shutdown

use crate::error::{Error, Result};
use crate::record::CapturedEntry;
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Default)]
struct SessionInner {
  entries: Vec<CapturedEntry>,
  sealed: bool,
}

/// Captured entries in completion order
///
/// Shared by every connection task. [`SessionBuffer::drain`] hands the entries
/// to the exporter once and seals the buffer.
#[derive(Default)]
pub struct SessionBuffer {
  inner: Mutex<SessionInner>,
}

impl SessionBuffer {
  /// Empty buffer
  pub fn new() -> Self {
    Self::default()
  }

  /// Append an entry, returns false once the buffer is sealed
  pub fn append(&self, entry: CapturedEntry) -> bool {
    let mut inner = self.inner.lock();
    if inner.sealed {
      tracing::warn!(
        "session already exported, dropping {} {}",
        entry.method,
        entry.url
      );
      return false;
    }
    inner.entries.push(entry);
    true
  }

  /// Number of entries held
  pub fn len(&self) -> usize {
    self.inner.lock().entries.len()
  }

  /// Whether no entries are held
  pub fn is_empty(&self) -> bool {
    self.inner.lock().entries.is_empty()
  }

  /// Copy of the current entries
  pub fn snapshot(&self) -> Vec<CapturedEntry> {
    self.inner.lock().entries.clone()
  }

  /// Take every entry and seal the buffer
  pub fn drain(&self) -> Vec<CapturedEntry> {
    let mut inner = self.inner.lock();
    inner.sealed = true;
    std::mem::take(&mut inner.entries)
  }

  /// Whether [`SessionBuffer::drain`] has run
  pub fn is_sealed(&self) -> bool {
    self.inner.lock().sealed
  }
}

/// Result of an export
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportReport {
  /// entries written
  pub count: usize,
  /// file written
  pub path: PathBuf,
}

/// Writes entries as one pretty-printed JSON array
pub struct Exporter;

impl Exporter {
  /// Write `entries` to `path`
  ///
  /// Output goes to a sibling temp file first and is renamed into place, so a
  /// failed export never leaves a half-written file at `path`.
  pub fn export(entries: &[CapturedEntry], path: impl AsRef<Path>) -> Result<ExportReport> {
    let path = path.as_ref();
    let tmp = temp_path(path);
    let written = write_json(entries, &tmp).and_then(|_| fs::rename(&tmp, path));
    if let Err(e) = written {
      // best effort, the temp file may not exist
      let _ = fs::remove_file(&tmp);
      return Err(Error::export(path, e));
    }
    tracing::info!("wrote {} entries to {}", entries.len(), path.display());
    Ok(ExportReport {
      count: entries.len(),
      path: path.to_path_buf(),
    })
  }
}

fn temp_path(path: &Path) -> PathBuf {
  let name = path
    .file_name()
    .map(|n| n.to_string_lossy().into_owned())
    .unwrap_or_else(|| "capture.json".to_string());
  path.with_file_name(format!(".{}.tmp", name))
}

fn write_json(entries: &[CapturedEntry], path: &Path) -> std::io::Result<()> {
  let mut writer = BufWriter::new(File::create(path)?);
  serde_json::to_writer_pretty(&mut writer, entries)?;
  writer.write_all(b"\n")?;
  writer.flush()?;
  writer.get_ref().sync_all()
}
