/// Structured error kinds shared by the storage engine and the consensus
/// layer built on top of it.
///
/// Most call sites propagate these through `anyhow::Result` (see
/// `store.rs`); code that needs to branch on *which* error happened -
/// rolling a segment on `EndOfIndex`, enriching a `NotLeader` with a leader
/// hint - matches on `LogError` directly.
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum LogError {
  #[error("offset {offset} is out of range")]
  OffsetOutOfRange { offset: u64 },

  #[error("index has reached its maximum amount of entries")]
  EndOfIndex,

  #[error("not the leader, hint: {leader_hint:?}")]
  NotLeader { leader_hint: Option<String> },

  #[error("commit timed out")]
  CommitTimeout,

  #[error("record is corrupt: {0}")]
  Corrupt(String),
}

impl LogError {
  pub fn is_end_of_index(&self) -> bool {
    matches!(self, LogError::EndOfIndex)
  }
}
