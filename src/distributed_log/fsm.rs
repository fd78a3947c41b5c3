/// `spec.md` §4.5/§9: "the consensus library expects `apply/snapshot/
/// restore` as a capability set; express this as an interface/trait with
/// three methods. Snapshot handles are a separate capability set with
/// `persist/release`."
///
/// `openraft::RaftStateMachine` already is that capability set, but it is
/// shaped around openraft's own `Entry`/`Snapshot` types. This trait is the
/// narrower, storage-agnostic FSM contract `spec.md` describes; `StateMachine`
/// (in `state_machine.rs`) implements both: it satisfies `openraft`'s trait
/// for the consensus library, and delegates to this one for the actual
/// "turn a committed command into a `Log::append` call" behavior.
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use super::type_config::{AppRequest, AppResponse};

#[async_trait]
pub trait SnapshotHandle: Send + Sync {
  /// Copies the handle's bytes into `sink`. For `StateMachine`, this is a
  /// byte-for-byte dump of the application log's store files
  /// (`spec.md` §4.5/§6's "Snapshot format").
  async fn persist(&self, sink: &mut (dyn AsyncWrite + Send + Unpin)) -> anyhow::Result<u64>;

  /// A no-op for this implementation; exists so the capability set matches
  /// what `spec.md` §4.5 describes ("a handle whose... `release` is a
  /// no-op").
  async fn release(self: Box<Self>) {}
}

#[async_trait]
pub trait Fsm: Send + Sync {
  async fn apply(&self, request: AppRequest) -> anyhow::Result<AppResponse>;

  async fn snapshot(&self) -> anyhow::Result<Box<dyn SnapshotHandle>>;

  /// Resets the local log, then replays length-prefixed record frames read
  /// from `source` until end-of-data, per `spec.md` §4.5's restore
  /// contract.
  async fn restore(&self, source: &mut (dyn AsyncRead + Send + Unpin)) -> anyhow::Result<()>;
}
