/// The `openraft` type configuration for this cluster: node identities are
/// plain `u64`s, nodes carry only an address (`openraft::BasicNode`), and
/// the application-defined request/response types are `AppRequest`/
/// `AppResponse` below.
use serde::{Deserialize, Serialize};

use crate::record::Record;

pub type NodeId = u64;
pub type Node = openraft::BasicNode;

/// The command a client proposes through consensus. `spec.md` §4.5 describes
/// this as "a command `(request_type = Append, payload = serialized
/// record)`"; `Remove` exists for wire-format symmetry with the data stream
/// (see `SPEC_FULL.md` §4.5's resolution of the membership/Remove overlap)
/// and is applied as a traced no-op, not as the authoritative membership
/// change - that goes through `Raft::change_membership` directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AppRequest {
  Append(Record),
  Remove { node_id: NodeId },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppResponse {
  pub offset: u64,
}

openraft::declare_raft_types!(
  pub TypeConfig:
    D = AppRequest,
    R = AppResponse,
    NodeId = NodeId,
    Node = Node,
    Entry = openraft::Entry<TypeConfig>,
    SnapshotData = std::io::Cursor<Vec<u8>>,
    AsyncRuntime = openraft::TokioRuntime,
);

pub type Entry = openraft::Entry<TypeConfig>;
pub type LogId = openraft::LogId<NodeId>;
pub type SnapshotMeta = openraft::SnapshotMeta<NodeId, Node>;
pub type StorageError = openraft::StorageError<NodeId>;
pub type Vote = openraft::Vote<NodeId>;
pub type Raft = openraft::Raft<TypeConfig>;
