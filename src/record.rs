/// Internal representation of a record as stored in a segment and proposed
/// through consensus.
///
/// This is distinct from `api::v1::Record`, the prost type generated for
/// the gRPC surface: the wire type only carries `value`/`offset`, while
/// this type also carries the consensus `term` and a `record_type` so the
/// FSM can tell application appends apart from membership markers.
///
/// Encoded with `bincode`, which - unlike JSON - has a single canonical byte
/// representation for a given struct layout, which `DistributedLog`'s FSM
/// apply path depends on (apply must be a deterministic function of
/// `(state, entry)`, see `distributed_log/state_machine.rs`).
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum RecordType {
  Append = 0,
  Remove = 1,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
  pub value: Vec<u8>,
  /// Assigned by the log at append time; any value set here by the caller
  /// is overwritten.
  pub offset: u64,
  pub term: u64,
  pub record_type: RecordType,
}

impl Record {
  pub fn new(value: Vec<u8>) -> Self {
    Self {
      value,
      offset: 0,
      term: 0,
      record_type: RecordType::Append,
    }
  }

  pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(self)
  }

  pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
    bincode::deserialize(bytes)
  }
}

impl From<Record> for crate::api::v1::Record {
  fn from(record: Record) -> Self {
    crate::api::v1::Record {
      value: record.value,
      offset: record.offset,
    }
  }
}

impl From<crate::api::v1::Record> for Record {
  fn from(record: crate::api::v1::Record) -> Self {
    Record {
      value: record.value,
      offset: record.offset,
      term: 0,
      record_type: RecordType::Append,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn encode_decode_round_trips() {
    let record = Record {
      value: b"hello world".to_vec(),
      offset: 42,
      term: 3,
      record_type: RecordType::Append,
    };

    let encoded = record.encode().unwrap();
    let decoded = Record::decode(&encoded).unwrap();

    assert_eq!(record, decoded);
  }

  #[test]
  fn encoding_is_deterministic() {
    let record = Record {
      value: b"same bytes every time".to_vec(),
      offset: 7,
      term: 1,
      record_type: RecordType::Remove,
    };

    assert_eq!(record.encode().unwrap(), record.encode().unwrap());
  }
}
