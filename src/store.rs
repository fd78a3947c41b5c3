/// Store represents a file where records are stored.
use std::{
  fs::File,
  io::{BufWriter, Write},
  os::unix::prelude::FileExt,
  sync::Mutex,
};

use anyhow::Result;
use tracing::instrument;

use crate::error::LogError;

/// Number of bytes used to encode a record's length ahead of its bytes.
const LEN_WIDTH: u64 = 8;

#[derive(Debug)]
pub struct Store {
  /// File is wrapped in a BufWriter because it can be inefficient
  /// to work directly with something that implements Write
  /// because it may issue too many systems calls.
  ///
  /// BufWriter will keep an in-memory buffer of data
  /// and write it to the underlying writer in batches.
  writer: Mutex<BufWriter<File>>,
  /// Next append position; also the file's logical length.
  size: Mutex<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutput {
  pub bytes_written: u64,
  pub position: u64,
}

impl Store {
  pub fn new(file: File) -> Result<Self> {
    let size = file.metadata()?.len();

    Ok(Self {
      writer: Mutex::new(BufWriter::new(file)),
      size: Mutex::new(size),
    })
  }

  /// Writes `len(buffer)` as an 8 byte big-endian prefix followed by
  /// `buffer` itself, returning how many bytes were written (prefix
  /// included) and the position the record starts at.
  #[instrument(skip(self, buffer), fields(len = buffer.len()))]
  pub fn append(&self, buffer: &[u8]) -> Result<AppendOutput> {
    let mut writer = self.writer.lock().unwrap();
    let mut size = self.size.lock().unwrap();

    let position = *size;

    writer.write_all(&(buffer.len() as u64).to_be_bytes())?;
    writer.write_all(buffer)?;

    let bytes_written = LEN_WIDTH + buffer.len() as u64;
    *size += bytes_written;

    Ok(AppendOutput {
      bytes_written,
      position,
    })
  }

  /// Reads the record starting at `position`: flushes the write buffer so
  /// that the positional read below observes every byte written so far,
  /// then decodes the length prefix and reads exactly that many bytes.
  ///
  /// Fails with `LogError::Corrupt` rather than a raw `io::Error` if
  /// `position` or the decoded length prefix implies a read past `size` -
  /// the store's own record of how many bytes it has actually written
  /// (`spec.md` §7 "length prefix implies a read past end-of-file...
  /// fatal; node refuses to serve").
  #[instrument(skip(self))]
  pub fn read(&self, position: u64) -> Result<Vec<u8>> {
    let mut writer = self.writer.lock().unwrap();
    writer.flush()?;

    let size = *self.size.lock().unwrap();

    if position + LEN_WIDTH > size {
      return Err(LogError::Corrupt(format!(
        "record position {position} has no room for a length prefix before store size {size}"
      ))
      .into());
    }

    let file = writer.get_ref();

    let mut len_buffer = [0u8; LEN_WIDTH as usize];
    file.read_exact_at(&mut len_buffer, position)?;
    let len = u64::from_be_bytes(len_buffer);

    if position + LEN_WIDTH + len > size {
      return Err(LogError::Corrupt(format!(
        "record at position {position} claims length {len}, past store size {size}"
      ))
      .into());
    }

    let mut buffer = vec![0u8; len as usize];
    file.read_exact_at(&mut buffer, position + LEN_WIDTH)?;

    Ok(buffer)
  }

  /// Flushes the write buffer, then reads directly from the underlying
  /// file at `offset`, bypassing the buffer. Used by `Log::reader()` to
  /// stream raw store bytes for snapshotting.
  pub fn read_at(&self, buffer: &mut [u8], offset: u64) -> std::io::Result<usize> {
    let mut writer = self.writer.lock().unwrap();
    writer.flush()?;

    writer.get_ref().read_at(buffer, offset)
  }

  pub fn size(&self) -> u64 {
    *self.size.lock().unwrap()
  }

  pub fn flush(&self) -> Result<(), std::io::Error> {
    self.writer.lock().unwrap().flush()
  }

  /// Flushes and closes the underlying file. Must happen before the
  /// sibling `Index` is truncated, so the index's final extent reflects
  /// only entries whose store bytes actually landed on disk.
  pub fn close(&self) -> Result<(), std::io::Error> {
    self.writer.lock().unwrap().flush()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Read;

  fn temp_file() -> File {
    tempfile::tempfile().unwrap()
  }

  #[test_log::test]
  fn append_writes_len_prefix_then_bytes() {
    let store = Store::new(temp_file()).unwrap();

    let output = store.append(b"hello world").unwrap();

    assert_eq!(
      AppendOutput {
        bytes_written: 19,
        position: 0,
      },
      output
    );
  }

  #[test_log::test]
  fn append_returns_increasing_positions() {
    let store = Store::new(temp_file()).unwrap();

    let first = store.append(b"hello world").unwrap();
    let second = store.append(b"hello world").unwrap();
    let third = store.append(b"hello world").unwrap();

    assert_eq!(0, first.position);
    assert_eq!(19, second.position);
    assert_eq!(38, third.position);
    assert_eq!(57, store.size());
  }

  #[test_log::test]
  fn read_returns_the_bytes_written_at_append() {
    let store = Store::new(temp_file()).unwrap();

    let a = store.append(b"hello world").unwrap();
    let b = store.append(b"hello world").unwrap();
    let c = store.append(b"hello world").unwrap();

    assert_eq!(b"hello world".to_vec(), store.read(a.position).unwrap());
    assert_eq!(b"hello world".to_vec(), store.read(b.position).unwrap());
    assert_eq!(b"hello world".to_vec(), store.read(c.position).unwrap());
  }

  #[test_log::test]
  fn read_round_trips_an_empty_record() {
    let store = Store::new(temp_file()).unwrap();

    let output = store.append(b"").unwrap();

    assert_eq!(Vec::<u8>::new(), store.read(output.position).unwrap());
  }

  #[test_log::test]
  fn read_past_the_end_of_the_store_fails_with_corrupt() {
    let store = Store::new(temp_file()).unwrap();

    store.append(b"hello world").unwrap();

    let err = store.read(1_000).unwrap_err();

    assert!(matches!(
      err.downcast_ref::<LogError>(),
      Some(LogError::Corrupt(_))
    ));
  }

  #[test_log::test]
  fn read_with_a_length_prefix_past_the_end_fails_with_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.store");

    // Hand-craft a frame whose length prefix claims far more data than is
    // actually written after it, before the store ever opens the file.
    std::fs::write(&path, (9_999u64).to_be_bytes()).unwrap();

    let file = std::fs::OpenOptions::new()
      .read(true)
      .write(true)
      .open(&path)
      .unwrap();
    let store = Store::new(file).unwrap();

    let err = store.read(0).unwrap_err();

    assert!(matches!(
      err.downcast_ref::<LogError>(),
      Some(LogError::Corrupt(_))
    ));
  }

  #[test_log::test]
  fn reopening_the_file_preserves_store_contents() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.store");

    let file = std::fs::OpenOptions::new()
      .create(true)
      .read(true)
      .write(true)
      .open(&path)
      .unwrap();
    let store = Store::new(file).unwrap();

    store.append(b"hello world").unwrap();
    store.append(b"hello world").unwrap();
    store.append(b"hello world").unwrap();
    store.close().unwrap();
    drop(store);

    let file = std::fs::OpenOptions::new()
      .read(true)
      .write(true)
      .open(&path)
      .unwrap();
    let reopened = Store::new(file).unwrap();

    assert_eq!(b"hello world".to_vec(), reopened.read(0).unwrap());
    assert_eq!(b"hello world".to_vec(), reopened.read(19).unwrap());
    assert_eq!(b"hello world".to_vec(), reopened.read(38).unwrap());
  }

  #[test_log::test]
  fn read_at_bypasses_the_write_buffer() {
    let store = Store::new(temp_file()).unwrap();

    store.append(b"hello world").unwrap();

    let mut buffer = [0u8; 8];
    let n = store.read_at(&mut buffer, 0).unwrap();

    assert_eq!(8, n);
    assert_eq!(11u64, u64::from_be_bytes(buffer));
  }

  #[test_log::test]
  fn close_flushes_pending_writes_to_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.store");
    let file = std::fs::OpenOptions::new()
      .create(true)
      .read(true)
      .write(true)
      .open(&path)
      .unwrap();

    let store = Store::new(file).unwrap();
    store.append(b"hello world").unwrap();
    store.close().unwrap();

    let mut raw = Vec::new();
    std::fs::File::open(&path)
      .unwrap()
      .read_to_end(&mut raw)
      .unwrap();

    assert_eq!(19, raw.len());
  }
}
