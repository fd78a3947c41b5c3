/// The "Raft-log adapter" from `spec.md` §4.5: a second `Log` instance
/// reused as the consensus log, exposed through `openraft`'s
/// `RaftLogStorage`/`RaftLogReader` trait surface. Each consensus entry is
/// wrapped into a `Record` (`value` = bincode of the `openraft::Entry`,
/// `offset` kept equal to the entry's consensus index - both sequences are
/// append-only and increment by one, so `Log::append`'s own offset
/// assignment stays in lockstep with the index the caller intends, as long
/// as both are reset/truncated together) and appended to the log exactly
/// like an application record would be.
///
/// Vote and the purge watermark live in `sled` (`spec.md` §6: "a
/// stable-store file (key-value, for term and vote)").
use std::ops::RangeBounds;
use std::sync::Arc;

use async_trait::async_trait;
use openraft::storage::{IOFlushed, LogState, RaftLogReader, RaftLogStorage};
use openraft::{OptionalSend, StorageError, StorageIOError};
use tokio::sync::RwLock;

use crate::log::Log;
use crate::record::Record;

use super::type_config::{Entry, LogId, NodeId, TypeConfig, Vote};

const VOTE_KEY: &[u8] = b"vote";
const LAST_PURGED_KEY: &[u8] = b"last_purged";

fn encode_entry(entry: &Entry) -> anyhow::Result<Record> {
  Ok(Record {
    value: bincode::serialize(entry)?,
    offset: entry.log_id.index,
    term: entry.log_id.leader_id.term,
    record_type: crate::record::RecordType::Append,
  })
}

fn decode_entry(record: &Record) -> anyhow::Result<Entry> {
  Ok(bincode::deserialize(&record.value)?)
}

#[derive(Clone)]
pub struct LogStore {
  log: Arc<Log>,
  stable: sled::Db,
  last_purged: Arc<RwLock<Option<LogId>>>,
}

impl LogStore {
  pub fn new(log: Arc<Log>, stable: sled::Db) -> anyhow::Result<Self> {
    let last_purged = match stable.get(LAST_PURGED_KEY)? {
      Some(bytes) => Some(bincode::deserialize(&bytes)?),
      None => None,
    };

    Ok(Self {
      log,
      stable,
      last_purged: Arc::new(RwLock::new(last_purged)),
    })
  }

}

#[async_trait]
impl RaftLogReader<TypeConfig> for LogStore {
  async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + std::fmt::Debug + OptionalSend>(
    &mut self,
    range: RB,
  ) -> Result<Vec<Entry>, StorageError<NodeId>> {
    let log = Arc::clone(&self.log);
    let range = range.clone();

    tokio::task::spawn_blocking(move || -> Result<Vec<Entry>, StorageError<NodeId>> {
      let mut entries = Vec::new();

      let start = match range.start_bound() {
        std::ops::Bound::Included(n) => *n,
        std::ops::Bound::Excluded(n) => n + 1,
        std::ops::Bound::Unbounded => log.lowest_offset(),
      };
      let end = match range.end_bound() {
        std::ops::Bound::Included(n) => *n + 1,
        std::ops::Bound::Excluded(n) => *n,
        std::ops::Bound::Unbounded => log.highest_offset() + 1,
      };

      for offset in start..end {
        match log.read(offset) {
          Ok(record) => entries.push(
            decode_entry(&record).map_err(|e| StorageIOError::read_logs(&std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?,
          ),
          Err(_) => break,
        }
      }

      Ok(entries)
    })
    .await
    .map_err(|e| StorageIOError::read_logs(&std::io::Error::new(std::io::ErrorKind::Other, e)))?
  }
}

#[async_trait]
impl RaftLogStorage<TypeConfig> for LogStore {
  type LogReader = Self;

  async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<NodeId>> {
    let log = Arc::clone(&self.log);
    let last_log_id = tokio::task::spawn_blocking(move || -> anyhow::Result<Option<LogId>> {
      Ok(LogStore::last_entry_of(&log)?.map(|entry| entry.log_id))
    })
    .await
    .map_err(|e| StorageIOError::read(&std::io::Error::new(std::io::ErrorKind::Other, e)))?
    .map_err(|e| StorageIOError::read(&std::io::Error::new(std::io::ErrorKind::Other, e)))?;

    let last_purged_log_id = *self.last_purged.read().await;

    Ok(LogState {
      last_purged_log_id,
      last_log_id: last_log_id.or(last_purged_log_id),
    })
  }

  async fn save_vote(&mut self, vote: &Vote) -> Result<(), StorageError<NodeId>> {
    let bytes = bincode::serialize(vote).map_err(|e| StorageIOError::write_vote(&std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
    self
      .stable
      .insert(VOTE_KEY, bytes)
      .map_err(|e| StorageIOError::write_vote(&std::io::Error::new(std::io::ErrorKind::Other, e)))?;
    self
      .stable
      .flush_async()
      .await
      .map_err(|e| StorageIOError::write_vote(&std::io::Error::new(std::io::ErrorKind::Other, e)))?;
    Ok(())
  }

  async fn read_vote(&mut self) -> Result<Option<Vote>, StorageError<NodeId>> {
    match self
      .stable
      .get(VOTE_KEY)
      .map_err(|e| StorageIOError::read_vote(&std::io::Error::new(std::io::ErrorKind::Other, e)))?
    {
      Some(bytes) => Ok(Some(bincode::deserialize(&bytes).map_err(|e| {
        StorageIOError::read_vote(&std::io::Error::new(std::io::ErrorKind::InvalidData, e))
      })?)),
      None => Ok(None),
    }
  }

  async fn append<I>(&mut self, entries: I, callback: IOFlushed<TypeConfig>) -> Result<(), StorageError<NodeId>>
  where
    I: IntoIterator<Item = Entry> + OptionalSend,
  {
    let log = Arc::clone(&self.log);
    let entries: Vec<Entry> = entries.into_iter().collect();

    let result = tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
      for entry in entries {
        log.append(encode_entry(&entry)?)?;
      }
      Ok(())
    })
    .await;

    match result {
      Ok(Ok(())) => callback.io_completed(Ok(())),
      Ok(Err(e)) => callback.io_completed(Err(std::io::Error::new(std::io::ErrorKind::Other, e))),
      Err(e) => callback.io_completed(Err(std::io::Error::new(std::io::ErrorKind::Other, e))),
    }

    Ok(())
  }

  /// Tail truncation for conflict resolution. `Log` can only drop whole
  /// leading segments (`Log::truncate`), not an arbitrary suffix, so this
  /// reads the surviving prefix `[lowest, log_id.index)`, resets the log,
  /// and replays it - `SPEC_FULL.md` §4.5's resolution of the gap
  /// `spec.md` §9 flags as an open question.
  async fn truncate(&mut self, log_id: LogId) -> Result<(), StorageError<NodeId>> {
    let log = Arc::clone(&self.log);

    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
      let lowest = log.lowest_offset();
      let highest = log.highest_offset();

      if highest < lowest || log_id.index > highest {
        return Ok(());
      }

      let mut surviving = Vec::new();
      for offset in lowest..log_id.index {
        surviving.push(log.read(offset)?);
      }

      log.reset()?;
      for record in surviving {
        log.append(record)?;
      }

      Ok(())
    })
    .await
    .map_err(|e| StorageIOError::write(&std::io::Error::new(std::io::ErrorKind::Other, e)))?
    .map_err(|e| StorageIOError::write(&std::io::Error::new(std::io::ErrorKind::Other, e)))?;

    Ok(())
  }

  /// Prefix compaction. Maps directly onto `Log::truncate`, which already
  /// removes every segment fully below a threshold offset.
  async fn purge(&mut self, log_id: LogId) -> Result<(), StorageError<NodeId>> {
    let log = Arc::clone(&self.log);
    let index = log_id.index;

    tokio::task::spawn_blocking(move || log.truncate(index))
      .await
      .map_err(|e| StorageIOError::write(&std::io::Error::new(std::io::ErrorKind::Other, e)))?
      .map_err(|e| StorageIOError::write(&std::io::Error::new(std::io::ErrorKind::Other, e)))?;

    *self.last_purged.write().await = Some(log_id);
    let bytes = bincode::serialize(&log_id).map_err(|e| StorageIOError::write(&std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
    self
      .stable
      .insert(LAST_PURGED_KEY, bytes)
      .map_err(|e| StorageIOError::write(&std::io::Error::new(std::io::ErrorKind::Other, e)))?;

    Ok(())
  }

  async fn get_log_reader(&mut self) -> Self::LogReader {
    self.clone()
  }
}

impl LogStore {
  fn last_entry_of(log: &Log) -> anyhow::Result<Option<Entry>> {
    if log.highest_offset() < log.lowest_offset() {
      return Ok(None);
    }
    let record = log.read(log.highest_offset())?;
    decode_entry(&record).map(Some)
  }
}
