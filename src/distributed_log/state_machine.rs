/// The FSM `openraft` drives on every committed entry, adapting it onto
/// the application's own single-node `Log` (`spec.md` §4.5's "FSM
/// (finite-state-machine) contract" and §9's "DistributedLog <-> FSM <->
/// Log": "Implement as a small object that holds a shared, mutex-protected
/// handle to the Log; do not build a cycle back to DistributedLog").
///
/// `Log`'s own `RwLock` already is that mutex-protected handle, so
/// `StateMachine` just needs to share an `Arc<Log>`.
///
/// `last_applied`/`last_membership` are mirrored into the same `sled`
/// stable store `LogStore` uses for vote/purge-watermark (`spec.md` §6:
/// "a stable-store file (key-value, for term and vote)"), and snapshot
/// bytes are written under a `raft_snapshots/` directory in the data
/// directory (`spec.md` §6 "...and a snapshot directory"). Without this,
/// a restarted node reports `applied_state() == None` and `openraft`
/// replays every retained log entry through `apply()`, which re-appends
/// already-committed records onto the live `Log` under new offsets.
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use openraft::storage::{RaftSnapshotBuilder, RaftStateMachine, Snapshot};
use openraft::{EntryPayload, StorageError, StorageIOError, StoredMembership};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::RwLock;
use tracing::{instrument, trace};

use crate::log::Log;

use super::fsm::{Fsm, SnapshotHandle};
use super::type_config::{AppRequest, AppResponse, LogId, Node, NodeId, SnapshotMeta, TypeConfig};

const LAST_APPLIED_KEY: &[u8] = b"sm_last_applied";
const LAST_MEMBERSHIP_KEY: &[u8] = b"sm_last_membership";

struct LogSnapshotHandle {
  log: Arc<Log>,
}

#[async_trait]
impl SnapshotHandle for LogSnapshotHandle {
  async fn persist(&self, sink: &mut (dyn AsyncWrite + Send + Unpin)) -> anyhow::Result<u64> {
    let log = Arc::clone(&self.log);
    let bytes = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<u8>> {
      let mut buffer = Vec::new();
      std::io::copy(&mut log.reader(), &mut buffer)?;
      Ok(buffer)
    })
    .await??;

    sink.write_all(&bytes).await?;
    Ok(bytes.len() as u64)
  }
}

#[derive(Clone)]
pub struct StateMachine {
  log: Arc<Log>,
  stable: sled::Db,
  snapshot_dir: PathBuf,
  last_applied: Arc<RwLock<Option<LogId>>>,
  last_membership: Arc<RwLock<StoredMembership<NodeId, Node>>>,
  current_snapshot: Arc<RwLock<Option<(SnapshotMeta, Vec<u8>)>>>,
  snapshot_idx: Arc<std::sync::atomic::AtomicU64>,
}

impl StateMachine {
  /// Restores `last_applied`/`last_membership` from `stable` and the most
  /// recent snapshot file from `snapshot_dir` (created if missing), so a
  /// restarted node reports its true applied watermark instead of `None`.
  pub fn new(log: Arc<Log>, stable: sled::Db, snapshot_dir: impl AsRef<Path>) -> anyhow::Result<Self> {
    std::fs::create_dir_all(&snapshot_dir)?;
    let snapshot_dir = snapshot_dir.as_ref().to_path_buf();

    let last_applied = match stable.get(LAST_APPLIED_KEY)? {
      Some(bytes) => bincode::deserialize(&bytes)?,
      None => None,
    };
    let last_membership = match stable.get(LAST_MEMBERSHIP_KEY)? {
      Some(bytes) => bincode::deserialize(&bytes)?,
      None => StoredMembership::default(),
    };
    let current_snapshot = Self::load_latest_snapshot(&snapshot_dir)?;

    Ok(Self {
      log,
      stable,
      snapshot_dir,
      last_applied: Arc::new(RwLock::new(last_applied)),
      last_membership: Arc::new(RwLock::new(last_membership)),
      current_snapshot: Arc::new(RwLock::new(current_snapshot)),
      snapshot_idx: Arc::new(std::sync::atomic::AtomicU64::new(0)),
    })
  }

  fn persist_last_applied(&self, log_id: LogId) -> anyhow::Result<()> {
    let bytes = bincode::serialize(&log_id)?;
    self.stable.insert(LAST_APPLIED_KEY, bytes)?;
    Ok(())
  }

  fn persist_last_membership(&self, membership: &StoredMembership<NodeId, Node>) -> anyhow::Result<()> {
    let bytes = bincode::serialize(membership)?;
    self.stable.insert(LAST_MEMBERSHIP_KEY, bytes)?;
    Ok(())
  }

  /// Writes `(meta, data)` to a file under `snapshot_dir`, discarding
  /// whatever snapshot files were there before - this implementation
  /// keeps only the latest snapshot on disk, per `spec.md` §4.5 "partial
  /// snapshot files are discarded".
  async fn persist_snapshot_to_disk(&self, meta: &SnapshotMeta, data: &[u8]) -> anyhow::Result<()> {
    let snapshot_dir = self.snapshot_dir.clone();
    let meta_bytes = bincode::serialize(meta)?;
    let data = data.to_vec();
    let file_name = format!("{}.snapshot", meta.snapshot_id);

    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
      use std::io::Write;

      for entry in std::fs::read_dir(&snapshot_dir)? {
        let _ = std::fs::remove_file(entry?.path());
      }

      let mut file = std::fs::File::create(snapshot_dir.join(file_name))?;
      file.write_all(&(meta_bytes.len() as u64).to_be_bytes())?;
      file.write_all(&meta_bytes)?;
      file.write_all(&data)?;
      file.sync_all()?;
      Ok(())
    })
    .await??;

    Ok(())
  }

  fn load_latest_snapshot(dir: &Path) -> anyhow::Result<Option<(SnapshotMeta, Vec<u8>)>> {
    let mut latest: Option<(std::time::SystemTime, PathBuf)> = None;
    for entry in std::fs::read_dir(dir)? {
      let entry = entry?;
      if !entry.file_type()?.is_file() {
        continue;
      }
      let modified = entry.metadata()?.modified()?;
      if latest.as_ref().map_or(true, |(t, _)| modified > *t) {
        latest = Some((modified, entry.path()));
      }
    }

    let Some((_, path)) = latest else {
      return Ok(None);
    };

    let bytes = std::fs::read(path)?;
    let mut len_buffer = [0u8; 8];
    len_buffer.copy_from_slice(&bytes[..8]);
    let meta_len = u64::from_be_bytes(len_buffer) as usize;

    let meta: SnapshotMeta = bincode::deserialize(&bytes[8..8 + meta_len])?;
    let data = bytes[8 + meta_len..].to_vec();

    Ok(Some((meta, data)))
  }
}

#[async_trait]
impl Fsm for StateMachine {
  #[instrument(skip(self, request))]
  async fn apply(&self, request: AppRequest) -> anyhow::Result<AppResponse> {
    match request {
      AppRequest::Append(record) => {
        let log = Arc::clone(&self.log);
        let offset = tokio::task::spawn_blocking(move || log.append(record)).await??;
        Ok(AppResponse { offset })
      }
      AppRequest::Remove { node_id } => {
        // Bookkeeping only: the authoritative membership change already
        // went through `Raft::change_membership` (see `mod.rs::leave`).
        // This variant exists so the data stream can carry a record
        // marking a node's planned departure without it being confused
        // with the real `Leave` RPC (`SPEC_FULL.md` §4.5).
        trace!(node_id, "applied Remove marker, no local effect");
        Ok(AppResponse { offset: 0 })
      }
    }
  }

  async fn snapshot(&self) -> anyhow::Result<Box<dyn SnapshotHandle>> {
    Ok(Box::new(LogSnapshotHandle {
      log: Arc::clone(&self.log),
    }))
  }

  async fn restore(&self, source: &mut (dyn tokio::io::AsyncRead + Send + Unpin)) -> anyhow::Result<()> {
    let log = Arc::clone(&self.log);
    tokio::task::spawn_blocking(move || log.reset()).await??;

    loop {
      let mut len_buffer = [0u8; 8];
      match source.read_exact(&mut len_buffer).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
        Err(e) => return Err(e.into()),
      }
      let len = u64::from_be_bytes(len_buffer) as usize;

      let mut buffer = vec![0u8; len];
      source.read_exact(&mut buffer).await?;

      let record = crate::record::Record::decode(&buffer)?;
      let log = Arc::clone(&self.log);
      tokio::task::spawn_blocking(move || log.append(record)).await??;
    }

    Ok(())
  }
}

#[async_trait]
impl RaftSnapshotBuilder<TypeConfig> for StateMachine {
  async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
    let handle = self
      .snapshot()
      .await
      .map_err(|e| StorageIOError::write_snapshot(None, &*e))?;

    let mut buffer = Cursor::new(Vec::new());
    handle
      .persist(&mut buffer)
      .await
      .map_err(|e| StorageIOError::write_snapshot(None, &*e))?;

    let last_applied = *self.last_applied.read().await;
    let last_membership = self.last_membership.read().await.clone();

    let idx = self
      .snapshot_idx
      .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
      + 1;
    let snapshot_id = match last_applied {
      Some(log_id) => format!("{}-{}-{}", log_id.leader_id, log_id.index, idx),
      None => format!("0-0-{}", idx),
    };

    let meta = SnapshotMeta {
      last_log_id: last_applied,
      last_membership,
      snapshot_id,
    };

    let data = buffer.into_inner();

    self
      .persist_snapshot_to_disk(&meta, &data)
      .await
      .map_err(|e| StorageIOError::write_snapshot(Some(meta.signature()), &*e))?;

    *self.current_snapshot.write().await = Some((meta.clone(), data.clone()));

    Ok(Snapshot {
      meta,
      snapshot: Box::new(Cursor::new(data)),
    })
  }
}

#[async_trait]
impl RaftStateMachine<TypeConfig> for StateMachine {
  type SnapshotBuilder = Self;

  async fn applied_state(
    &mut self,
  ) -> Result<(Option<LogId>, StoredMembership<NodeId, Node>), StorageError<NodeId>> {
    Ok((
      *self.last_applied.read().await,
      self.last_membership.read().await.clone(),
    ))
  }

  /// Persists `last_applied`/`last_membership` to the stable store as each
  /// entry lands, so that `applied_state()` reports the true watermark
  /// after a restart instead of replaying the entire retained raft log
  /// back through `Fsm::apply` (which would re-append already-committed
  /// records onto the live `Log` under new offsets).
  #[instrument(skip(self, entries))]
  async fn apply(&mut self, entries: &[super::type_config::Entry]) -> Result<Vec<AppResponse>, StorageError<NodeId>> {
    let mut responses = Vec::with_capacity(entries.len());

    for entry in entries {
      *self.last_applied.write().await = Some(entry.log_id);
      self
        .persist_last_applied(entry.log_id)
        .map_err(|e| StorageIOError::write_state_machine(&*e))?;

      match &entry.payload {
        EntryPayload::Blank => responses.push(AppResponse { offset: 0 }),
        EntryPayload::Normal(request) => {
          let response = Fsm::apply(self, request.clone())
            .await
            .map_err(|e| StorageIOError::write_state_machine(&*e))?;
          responses.push(response);
        }
        EntryPayload::Membership(membership) => {
          let stored = StoredMembership::new(Some(entry.log_id), membership.clone());
          self
            .persist_last_membership(&stored)
            .map_err(|e| StorageIOError::write_state_machine(&*e))?;
          *self.last_membership.write().await = stored;
          responses.push(AppResponse { offset: 0 });
        }
      }
    }

    self
      .stable
      .flush_async()
      .await
      .map_err(|e| StorageIOError::write_state_machine(&e))?;

    Ok(responses)
  }

  async fn begin_receiving_snapshot(&mut self) -> Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
    Ok(Box::new(Cursor::new(Vec::new())))
  }

  async fn install_snapshot(
    &mut self,
    meta: &SnapshotMeta,
    snapshot: Box<Cursor<Vec<u8>>>,
  ) -> Result<(), StorageError<NodeId>> {
    let mut data = snapshot.into_inner();
    self
      .restore(&mut Cursor::new(&mut data))
      .await
      .map_err(|e| StorageIOError::read_snapshot(Some(meta.signature()), &*e))?;

    self
      .persist_snapshot_to_disk(meta, &data)
      .await
      .map_err(|e| StorageIOError::read_snapshot(Some(meta.signature()), &*e))?;

    if let Some(log_id) = meta.last_log_id {
      self
        .persist_last_applied(log_id)
        .map_err(|e| StorageIOError::read_snapshot(Some(meta.signature()), &*e))?;
    }
    self
      .persist_last_membership(&meta.last_membership)
      .map_err(|e| StorageIOError::read_snapshot(Some(meta.signature()), &*e))?;
    self
      .stable
      .flush_async()
      .await
      .map_err(|e| StorageIOError::read_snapshot(Some(meta.signature()), &e))?;

    *self.last_applied.write().await = meta.last_log_id;
    *self.last_membership.write().await = meta.last_membership.clone();
    *self.current_snapshot.write().await = Some((meta.clone(), data));

    Ok(())
  }

  async fn get_current_snapshot(&mut self) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
    Ok(
      self
        .current_snapshot
        .read()
        .await
        .clone()
        .map(|(meta, data)| Snapshot {
          meta,
          snapshot: Box::new(Cursor::new(data)),
        }),
    )
  }

  async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
    self.clone()
  }
}
