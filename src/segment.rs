use std::{
  fs::OpenOptions,
  path::{Path, PathBuf},
};

use anyhow::Result;
use tracing::instrument;

use crate::{
  error::LogError,
  index::{self, Index},
  record::Record,
  store::Store,
};

/// The segment wraps the index and store types to coordinate operations
/// across the two.
///
/// When the log appends a record to the active segment,
/// the segment needs to write the data to its store and add
/// a new entry in the index.
///
/// For reads, the segment needs to lookup the entry from the index
/// and then fetch the data from the store.
#[derive(Debug, Clone, Copy)]
pub struct Config {
  pub max_index_bytes: u64,
  pub max_store_bytes: u64,
  pub initial_offset: u64,
}

#[derive(Debug)]
pub struct Segment {
  store: Store,
  index: Index,
  base_offset: u64,
  next_offset: u64,
  config: Config,
  store_path: PathBuf,
  index_path: PathBuf,
}

impl Segment {
  /// Opens or creates the `<base_offset>.store`/`<base_offset>.index` pair
  /// in `dir` and recovers `next_offset` from the index's last entry.
  #[instrument(skip(dir, config), fields(base_offset))]
  pub fn new(dir: impl AsRef<Path>, base_offset: u64, config: Config) -> Result<Self> {
    let store_path = dir.as_ref().join(format!("{}.store", base_offset));
    let index_path = dir.as_ref().join(format!("{}.index", base_offset));

    let store_file = OpenOptions::new()
      .create(true)
      .read(true)
      .append(true)
      .open(&store_path)?;
    let store = Store::new(store_file)?;

    let index_file = OpenOptions::new()
      .create(true)
      .read(true)
      .write(true)
      .open(&index_path)?;
    let index = Index::new(
      index_file,
      index::Config {
        max_index_bytes: config.max_index_bytes,
      },
    )?;

    let next_offset = match index.read(-1) {
      Ok((rel_off, _)) => base_offset + rel_off as u64 + 1,
      Err(LogError::EndOfIndex) => base_offset,
      Err(other) => return Err(other.into()),
    };

    Ok(Self {
      store,
      index,
      base_offset,
      next_offset,
      config,
      store_path,
      index_path,
    })
  }

  pub fn base_offset(&self) -> u64 {
    self.base_offset
  }

  pub fn next_offset(&self) -> u64 {
    self.next_offset
  }

  /// Appends `record`, assigning it `self.next_offset`. Returns the
  /// assigned offset, or `LogError::EndOfIndex` if the segment is already
  /// full - the caller (`Log::append`) treats that as "roll a new
  /// segment".
  #[instrument(skip(self, record))]
  pub fn append(&mut self, mut record: Record) -> Result<u64> {
    let offset = self.next_offset;
    record.offset = offset;

    let encoded = record.encode()?;

    let append_output = self.store.append(&encoded)?;

    let rel_off = (offset - self.base_offset) as u32;
    self.index.write(rel_off, append_output.position)?;

    self.next_offset += 1;

    Ok(offset)
  }

  /// Reads the record stored at the absolute `offset`.
  #[instrument(skip(self))]
  pub fn read(&self, offset: u64) -> Result<Record> {
    let rel_off = (offset - self.base_offset) as i64;

    let (_, position) = self
      .index
      .read(rel_off)
      .map_err(|_| LogError::OffsetOutOfRange { offset })?;

    let encoded = self.store.read(position)?;

    Ok(Record::decode(&encoded)?)
  }

  /// A segment accepts no further appends once either its store or its
  /// index has reached its configured maximum size.
  pub fn is_maxed(&self) -> bool {
    self.store.size() >= self.config.max_store_bytes || self.index.size() >= self.config.max_index_bytes
  }

  /// Flushes and closes the store, then the index - in that order, so the
  /// index's close-time truncation observes a store that has already
  /// flushed every byte it describes.
  pub fn close(self) -> Result<()> {
    self.store.close()?;
    self.index.close()?;
    Ok(())
  }

  /// Direct access to the underlying store, bypassing the record codec.
  /// Used only by `Log::reader()` to stream raw store bytes for
  /// snapshotting; ordinary reads go through `Segment::read`.
  pub(crate) fn store(&self) -> &Store {
    &self.store
  }

  /// Closes, then deletes both files from disk.
  pub fn remove(self) -> Result<()> {
    let store_path = self.store_path.clone();
    let index_path = self.index_path.clone();

    self.close()?;

    std::fs::remove_file(store_path)?;
    std::fs::remove_file(index_path)?;

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::record::RecordType;

  fn config(max_store_bytes: u64, max_index_bytes: u64) -> Config {
    Config {
      max_store_bytes,
      max_index_bytes,
      initial_offset: 0,
    }
  }

  fn record(value: &[u8]) -> Record {
    Record {
      value: value.to_vec(),
      offset: 0,
      term: 0,
      record_type: RecordType::Append,
    }
  }

  #[test_log::test]
  fn new_segment_recovers_next_offset_from_base_offset_when_empty() {
    let dir = tempfile::tempdir().unwrap();

    let segment = Segment::new(dir.path(), 16, config(1024, 1024)).unwrap();

    assert_eq!(16, segment.next_offset());
    assert!(!segment.is_maxed());
  }

  #[test_log::test]
  fn append_assigns_sequential_offsets_starting_at_base_offset() {
    let dir = tempfile::tempdir().unwrap();
    let mut segment = Segment::new(dir.path(), 16, config(1024, 1024)).unwrap();

    assert_eq!(16, segment.append(record(b"hello world")).unwrap());
    assert_eq!(17, segment.append(record(b"hello world")).unwrap());
    assert_eq!(18, segment.append(record(b"hello world")).unwrap());
  }

  #[test_log::test]
  fn append_fails_with_end_of_index_once_maxed_by_index() {
    // entry width is 12 bytes; three entries exactly fill this mapping.
    let dir = tempfile::tempdir().unwrap();
    let mut segment = Segment::new(dir.path(), 16, config(1024, index::ENTRY_WIDTH * 3)).unwrap();

    segment.append(record(b"hello world")).unwrap();
    segment.append(record(b"hello world")).unwrap();
    segment.append(record(b"hello world")).unwrap();

    let err = segment.append(record(b"hello world")).unwrap_err();
    assert_eq!(
      Some(&LogError::EndOfIndex),
      err.downcast_ref::<LogError>()
    );
    assert!(segment.is_maxed());
  }

  #[test_log::test]
  fn read_returns_the_record_appended_at_that_offset() {
    let dir = tempfile::tempdir().unwrap();
    let mut segment = Segment::new(dir.path(), 16, config(1024, 1024)).unwrap();

    segment.append(record(b"hello world")).unwrap();

    let read = segment.read(16).unwrap();

    assert_eq!(b"hello world".to_vec(), read.value);
    assert_eq!(16, read.offset);
  }

  #[test_log::test]
  fn read_fails_with_offset_out_of_range_past_next_offset() {
    let dir = tempfile::tempdir().unwrap();
    let segment = Segment::new(dir.path(), 16, config(1024, 1024)).unwrap();

    let err = segment.read(16).unwrap_err();

    assert_eq!(
      Some(&LogError::OffsetOutOfRange { offset: 16 }),
      err.downcast_ref::<LogError>()
    );
  }

  #[test_log::test]
  fn close_then_reopen_recovers_next_offset_and_reads() {
    let dir = tempfile::tempdir().unwrap();

    {
      let mut segment = Segment::new(dir.path(), 0, config(1024, 1024)).unwrap();
      segment.append(record(b"a")).unwrap();
      segment.append(record(b"b")).unwrap();
      segment.close().unwrap();
    }

    let reopened = Segment::new(dir.path(), 0, config(1024, 1024)).unwrap();

    assert_eq!(2, reopened.next_offset());
    assert_eq!(b"a".to_vec(), reopened.read(0).unwrap().value);
    assert_eq!(b"b".to_vec(), reopened.read(1).unwrap().value);
  }
}
