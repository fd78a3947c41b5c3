/// `DistributedLog` wraps a single-node `Log` (the application's data)
/// behind `openraft` consensus (`spec.md` §3 "DistributedLog", §4.5).
///
/// It owns no lock of its own - consensus serializes its own mutations
/// (`spec.md` §5 "Locking discipline") - and holds no back-pointer from
/// the FSM; `state_machine::StateMachine` only holds a shared `Arc<Log>`
/// (`spec.md` §9).
pub mod fsm;
pub mod log_store;
pub mod network;
pub mod raft_service;
pub mod state_machine;
pub mod stream_layer;
pub mod type_config;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use openraft::error::{ClientWriteError, RaftError};
use tracing::{info, instrument};

use crate::config::Config as AppConfig;
use crate::error::LogError;
use crate::log::{Config as LogConfig, Log};
use crate::record::Record;

use log_store::LogStore;
use network::NetworkFactory;
use raft_service::RaftService;
use state_machine::StateMachine;
use stream_layer::{StreamLayer, TlsConfig};
use type_config::{AppRequest, Node, NodeId, Raft, TypeConfig};

fn to_log_config(config: &AppConfig) -> LogConfig {
  LogConfig {
    initial_offset: config.segment.initial_offset,
    max_store_bytes_per_segment: config.segment.max_store_bytes,
    max_index_bytes_per_segment: config.segment.max_index_bytes,
  }
}

pub struct DistributedLog {
  local_id: NodeId,
  log: Arc<Log>,
  raft: Raft,
  commit_timeout: Duration,
  #[allow(dead_code)]
  stream_layer: Arc<StreamLayer>,
}

impl DistributedLog {
  /// Bootstraps the storage layer - the application `Log`, the raft-log
  /// adapter's own `Log`, and the `sled` stable store - wires them into an
  /// `openraft::Raft`, and starts the consensus RPC server on the
  /// multiplexed listener. Pass `config.raft.bootstrap = true` to seed a
  /// fresh single-node cluster; otherwise join later via `Self::join` on
  /// the leader.
  #[instrument(skip(config), fields(local_id = config.raft.local_id))]
  pub async fn new(data_dir: impl AsRef<Path>, config: &AppConfig) -> anyhow::Result<Self> {
    let data_dir = data_dir.as_ref();
    std::fs::create_dir_all(data_dir)?;

    let log = Arc::new(Log::new(data_dir.join("log"), to_log_config(config))?);
    let raft_log = Arc::new(Log::new(data_dir.join("raft_log"), to_log_config(config))?);
    let stable = sled::open(data_dir.join("raft_stable"))?;

    let log_store = LogStore::new(Arc::clone(&raft_log), stable.clone())?;
    let state_machine = StateMachine::new(Arc::clone(&log), stable, data_dir.join("raft_snapshots"))?;

    let bind_addr: SocketAddr = config.bind_addr.parse()?;
    let stream_layer = Arc::new(StreamLayer::bind(bind_addr, TlsConfig::default()).await?);

    let network = NetworkFactory::new(config.raft.local_id, Arc::clone(&stream_layer));

    let raft_config = Arc::new(
      openraft::Config {
        heartbeat_interval: config.raft.heartbeat_timeout.as_millis() as u64,
        election_timeout_min: config.raft.election_timeout.as_millis() as u64,
        election_timeout_max: config.raft.election_timeout.as_millis() as u64 * 2,
        ..Default::default()
      }
      .validate()?,
    );

    let raft = openraft::Raft::new(
      config.raft.local_id,
      raft_config,
      network,
      log_store,
      state_machine,
    )
    .await?;

    let raft_service = RaftService::new(raft.clone());
    let raft_incoming = stream_layer.raft_incoming().await;
    tokio::spawn(async move {
      let result = tonic::transport::Server::builder()
        .add_service(crate::api::raft::v1::raft_server::RaftServer::new(raft_service))
        .serve_with_incoming(raft_incoming)
        .await;
      if let Err(e) = result {
        tracing::error!(error = %e, "raft rpc server exited");
      }
    });

    if config.raft.bootstrap {
      let mut members = BTreeMap::new();
      members.insert(
        config.raft.local_id,
        Node {
          addr: config.bind_addr.clone(),
        },
      );
      match raft.initialize(members).await {
        Ok(()) => info!("bootstrapped single-node cluster"),
        Err(e) => info!(error = %e, "skipping bootstrap, cluster already initialized"),
      }
    }

    Ok(Self {
      local_id: config.raft.local_id,
      log,
      raft,
      commit_timeout: config.raft.commit_timeout,
      stream_layer,
    })
  }

  /// Gives callers (the gRPC adapter, the multiplexer bootstrap) access to
  /// the listener the stream layer bound, so the application's own gRPC
  /// service can be served off the same socket's `app_incoming` queue.
  pub fn stream_layer(&self) -> Arc<StreamLayer> {
    Arc::clone(&self.stream_layer)
  }

  /// Proposes `record` through consensus, bounded by `config.raft.
  /// commit_timeout` (`spec.md` §4.5 "submits to consensus with a bounded
  /// timeout" / §5 "Append carries a deadline; on expiry the proposal is
  /// abandoned"). Leader-only: non-leader nodes fail fast with
  /// `LogError::NotLeader` carrying a leader hint, per `spec.md` §4.5/§7
  /// ("Propose on non-leader: fail fast... do not retry internally");
  /// every other `client_write` failure is propagated as-is rather than
  /// being collapsed into `NotLeader`.
  #[instrument(skip(self, record))]
  pub async fn append(&self, record: Record) -> anyhow::Result<u64> {
    let write = self.raft.client_write(AppRequest::Append(record));

    match tokio::time::timeout(self.commit_timeout, write).await {
      Ok(Ok(response)) => Ok(response.data.offset),
      Ok(Err(RaftError::APIError(ClientWriteError::ForwardToLeader(forward)))) => {
        let hint = forward.leader_node.map(|node| node.addr);
        tracing::debug!(?hint, "append rejected, not the leader");
        Err(LogError::NotLeader { leader_hint: hint }.into())
      }
      Ok(Err(e)) => {
        tracing::debug!(error = %e, "append failed");
        Err(e.into())
      }
      Err(_elapsed) => {
        tracing::debug!("append timed out waiting for commit");
        Err(LogError::CommitTimeout.into())
      }
    }
  }

  /// Local to whichever node receives the call. Returns
  /// `LogError::OffsetOutOfRange` if this node hasn't applied that offset
  /// yet (`spec.md` §4.5 "Read").
  pub fn read(&self, offset: u64) -> anyhow::Result<Record> {
    self.log.read(offset)
  }

  async fn leader_hint(&self) -> Option<String> {
    let metrics = self.raft.metrics().borrow().clone();
    let leader_id = metrics.current_leader?;
    metrics
      .membership_config
      .membership()
      .get_node(&leader_id)
      .map(|node| node.addr.clone())
  }

  /// Leader-only. Adds `id` as a learner, then promotes the cluster's
  /// voter set to include it - `openraft`'s own joint-consensus commits
  /// this as an internal log entry, the authoritative membership-change
  /// path per `SPEC_FULL.md` §4.5.
  #[instrument(skip(self))]
  pub async fn join(&self, id: NodeId, addr: String) -> anyhow::Result<()> {
    self.raft.add_learner(id, Node { addr }, true).await?;

    let mut voters = self.current_voters().await;
    voters.insert(id);
    self.raft.change_membership(voters, false).await?;

    Ok(())
  }

  /// Leader-only.
  #[instrument(skip(self))]
  pub async fn leave(&self, id: NodeId) -> anyhow::Result<()> {
    let mut voters = self.current_voters().await;
    voters.remove(&id);
    self.raft.change_membership(voters, false).await?;

    Ok(())
  }

  async fn current_voters(&self) -> std::collections::BTreeSet<NodeId> {
    self
      .raft
      .metrics()
      .borrow()
      .membership_config
      .membership()
      .voter_ids()
      .collect()
  }

  /// Polls until a leader address is observable or `timeout` elapses.
  #[instrument(skip(self))]
  pub async fn wait_for_leader(&self, timeout: Duration) -> anyhow::Result<String> {
    let deadline = Instant::now() + timeout;

    loop {
      if let Some(addr) = self.leader_hint().await {
        return Ok(addr);
      }

      if Instant::now() >= deadline {
        return Err(LogError::CommitTimeout.into());
      }

      tokio::time::sleep(Duration::from_millis(50)).await;
    }
  }

  pub fn local_id(&self) -> NodeId {
    self.local_id
  }

  /// Transitions to shutdown: drains in-flight applies, closes consensus,
  /// then closes the local log (`spec.md` §5 "Shutdown... never aborts an
  /// in-progress apply").
  pub async fn close(self) -> anyhow::Result<()> {
    self.raft.shutdown().await?;

    match Arc::try_unwrap(self.log) {
      Ok(log) => log.close()?,
      Err(_) => tracing::warn!("log still shared on close, skipping final flush"),
    }

    Ok(())
  }
}
