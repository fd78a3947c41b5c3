/// Index represents a file where we index each record in the store file.
///
/// It contains an in memory file and a persisted memory mapped file.
///
/// Memory-mapped file - https://en.wikipedia.org/wiki/Memory-mapped_file
///
/// A memory-mapped file is a segment of virtual memory that has
/// been assigned a direct byte-for-byte correlation with some
/// portion of a file or file-like resource.
/// This resource is typically a file that is physically present on disk,
/// but can also be a device, shared memory object,
/// or other resource that the operating system can reference through
/// a file descriptor.
///
/// The benefit of memory mapping a file is increasing I/O performance,
/// especially when used on large files.
///
/// Accessing memory mapped files is faster than using direct read
/// and write operations for two reasons:
///
/// Firstly, a system call is orders of magnitude slower than a simple
/// change to a program's local memory.
///
/// Secondly, in most operating systems the memory region mapped
/// actually is the kernel's page cache, meaning that no copies need to be
/// created in user space.
use std::{fs::File, io::Write, sync::Mutex};

use anyhow::Result;
use memmap::MmapMut;

use crate::error::LogError;

/// OFFSET_WIDTH/POSITION_WIDTH/ENTRY_WIDTH define the number of bytes that
/// make up each index entry.
///
/// Index entries contain two fields: the record's offset relative to the
/// segment's base offset (4 bytes), and its position in the store file
/// (8 bytes).
const OFFSET_WIDTH: u64 = 4;
const POSITION_WIDTH: u64 = 8;
pub const ENTRY_WIDTH: u64 = OFFSET_WIDTH + POSITION_WIDTH;

#[derive(Debug)]
pub struct Index {
  file: File,
  mmap: MmapMut,
  /// Size of the index in bytes and the offset the next entry is written
  /// at.
  size: Mutex<u64>,
}

#[derive(Debug, Clone, Copy)]
pub struct Config {
  pub max_index_bytes: u64,
}

impl Index {
  pub fn new(file: File, config: Config) -> Result<Self> {
    let size = file.metadata()?.len();

    // Grow the file to the max index size before memory mapping it,
    // because the file cannot be resized once it's memory mapped.
    file.set_len(config.max_index_bytes)?;

    let mmap = unsafe { MmapMut::map_mut(&file)? };

    Ok(Self {
      file,
      mmap,
      size: Mutex::new(size),
    })
  }

  /// Returns how many entries the index contains.
  pub fn len(&self) -> u64 {
    *self.size.lock().unwrap() / ENTRY_WIDTH
  }

  pub fn is_empty(&self) -> bool {
    *self.size.lock().unwrap() == 0
  }

  pub fn size(&self) -> u64 {
    *self.size.lock().unwrap()
  }

  /// Appends `(rel_off, pos)` to the index. Fails with `LogError::EndOfIndex`
  /// if the preallocated mapping has no room left for another entry; the
  /// `Log` layer catches exactly this error to roll a new active segment.
  pub fn write(&mut self, rel_off: u32, pos: u64) -> Result<(), LogError> {
    let mut size = self.size.lock().unwrap();

    if *size + ENTRY_WIDTH > self.mmap.len() as u64 {
      return Err(LogError::EndOfIndex);
    }

    let start = *size as usize;
    let offset_ends_at = start + OFFSET_WIDTH as usize;
    let position_ends_at = offset_ends_at + POSITION_WIDTH as usize;

    (&mut self.mmap[start..offset_ends_at])
      .write_all(&rel_off.to_be_bytes())
      .expect("slice write cannot fail");
    (&mut self.mmap[offset_ends_at..position_ends_at])
      .write_all(&pos.to_be_bytes())
      .expect("slice write cannot fail");

    *size += ENTRY_WIDTH;

    Ok(())
  }

  /// Reads entry `n`. `n == -1` selects the most recently written entry.
  /// Returns `LogError::EndOfIndex` if the index is empty or `n` is past
  /// the last written entry.
  pub fn read(&self, n: i64) -> Result<(u32, u64), LogError> {
    let size = *self.size.lock().unwrap();

    if size == 0 {
      return Err(LogError::EndOfIndex);
    }

    let entry_count = (size / ENTRY_WIDTH) as i64;
    let n = if n == -1 { entry_count - 1 } else { n };

    if n < 0 {
      return Err(LogError::EndOfIndex);
    }

    let start = n as u64 * ENTRY_WIDTH;
    if start + ENTRY_WIDTH > size {
      return Err(LogError::EndOfIndex);
    }

    let start = start as usize;
    let offset_ends_at = start + OFFSET_WIDTH as usize;
    let position_ends_at = offset_ends_at + POSITION_WIDTH as usize;

    let mut offset_buffer = [0u8; OFFSET_WIDTH as usize];
    offset_buffer.copy_from_slice(&self.mmap[start..offset_ends_at]);
    let rel_off = u32::from_be_bytes(offset_buffer);

    let mut position_buffer = [0u8; POSITION_WIDTH as usize];
    position_buffer.copy_from_slice(&self.mmap[offset_ends_at..position_ends_at]);
    let pos = u64::from_be_bytes(position_buffer);

    Ok((rel_off, pos))
  }

  /// Syncs the memory-mapped file to the persisted file, flushes the
  /// persisted file's contents to stable storage, and truncates the
  /// persisted file to the amount of data that's actually in it, so that
  /// on next open the file's length alone recovers `size`.
  pub fn close(self) -> Result<(), std::io::Error> {
    self.mmap.flush()?;

    let size = *self.size.lock().unwrap();
    self.file.set_len(size)?;
    self.file.sync_all()?;

    drop(self.file);

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Read;
  use tempfile::NamedTempFile;

  fn config() -> Config {
    Config {
      max_index_bytes: 1024,
    }
  }

  #[test_log::test]
  fn index_rebuilds_state_from_file_if_file_is_not_empty() {
    let file = NamedTempFile::new().unwrap();
    let file_copy = file.reopen().unwrap();

    let mut index1 = Index::new(file.into_file(), config()).unwrap();

    index1.write(1, 10).unwrap();
    index1.close().unwrap();

    let index2 = Index::new(file_copy, config()).unwrap();

    assert_eq!(Ok((1, 10)), index2.read(0));
  }

  #[test_log::test]
  fn write_encodes_offset_and_position_as_big_endian() {
    let file_write = NamedTempFile::new().unwrap();
    let mut file_read = file_write.reopen().unwrap();

    let mut index = Index::new(file_write.into_file(), config()).unwrap();

    index.write(0, 0).unwrap();
    index.write(1, 10).unwrap();
    index.write(2, 1000).unwrap();
    index.close().unwrap();

    let mut buffer: Vec<u8> = Vec::new();
    file_read.read_to_end(&mut buffer).unwrap();

    let expected = vec![
      0, 0, 0, 0, // offset = 0
      0, 0, 0, 0, 0, 0, 0, 0, // position = 0
      0, 0, 0, 1, // offset = 1
      0, 0, 0, 0, 0, 0, 0, 10, // position = 10
      0, 0, 0, 2, // offset = 2
      0, 0, 0, 0, 0, 0, 3, 232, // position = 1000
    ];

    assert_eq!(expected, buffer);
  }

  #[test_log::test]
  fn read_returns_end_of_index_when_index_is_empty() {
    let file_write = NamedTempFile::new().unwrap();

    let index = Index::new(file_write.into_file(), config()).unwrap();

    assert_eq!(Err(LogError::EndOfIndex), index.read(0));
  }

  #[test_log::test]
  fn read_returns_end_of_index_past_the_last_entry() {
    let file_write = NamedTempFile::new().unwrap();

    let mut index = Index::new(file_write.into_file(), config()).unwrap();

    index.write(0, 11).unwrap();

    assert_eq!(Err(LogError::EndOfIndex), index.read(1));
  }

  #[test_log::test]
  fn read_returns_position_mapped_to_the_offset() {
    let file_write = NamedTempFile::new().unwrap();

    let mut index = Index::new(file_write.into_file(), config()).unwrap();

    index.write(0, 10).unwrap();
    index.write(1, 0).unwrap();
    index.write(2, 1).unwrap();
    index.write(3, 333).unwrap();

    assert_eq!(Ok((0, 10)), index.read(0));
    assert_eq!(Ok((1, 0)), index.read(1));
    assert_eq!(Ok((2, 1)), index.read(2));
    assert_eq!(Ok((3, 333)), index.read(3));
  }

  #[test_log::test]
  fn read_minus_one_returns_the_last_entry() {
    let file_write = NamedTempFile::new().unwrap();

    let mut index = Index::new(file_write.into_file(), config()).unwrap();

    index.write(0, 10).unwrap();
    index.write(1, 0).unwrap();
    index.write(2, 333).unwrap();

    assert_eq!(Ok((2, 333)), index.read(-1));
  }

  #[test_log::test]
  fn write_fails_with_end_of_index_once_the_mapping_is_full() {
    let file_write = NamedTempFile::new().unwrap();

    let mut index = Index::new(
      file_write.into_file(),
      Config {
        max_index_bytes: ENTRY_WIDTH * 3,
      },
    )
    .unwrap();

    index.write(0, 0).unwrap();
    index.write(1, 0).unwrap();
    index.write(2, 0).unwrap();

    assert_eq!(Err(LogError::EndOfIndex), index.write(3, 0));
  }
}
