/// `openraft`'s `RaftNetwork`/`RaftNetworkFactory`, dialing peers through
/// the multiplexed `StreamLayer` (`stream_layer.rs`) rather than a plain
/// `tonic::transport::Channel::connect`: the custom connector writes the
/// demux byte before the gRPC handshake even starts, so these RPCs land on
/// the same listening socket the application's `Log` service uses
/// (`spec.md` §4.5 "Stream layer").
///
/// Grounded on the `tower::util::service_fn` custom-connector pattern this
/// pack's `estuary-flow` uses for its own non-TCP-default transport
/// (`crates/gazette/src/journal/mod.rs`).
use std::sync::Arc;

use openraft::error::{InstallSnapshotError, NetworkError, RPCError, RaftError, Unreachable};
use openraft::network::{RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
  AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse, VoteRequest, VoteResponse,
};
use openraft::RPCOption;
use tonic::transport::{Channel, Endpoint, Uri};

use crate::api::raft::v1::raft_client::RaftClient;
use crate::api::raft::v1::RaftMessage;

use super::stream_layer::StreamLayer;
use super::type_config::{Node, NodeId, TypeConfig};

pub struct NetworkFactory {
  local_id: NodeId,
  stream_layer: Arc<StreamLayer>,
}

impl NetworkFactory {
  pub fn new(local_id: NodeId, stream_layer: Arc<StreamLayer>) -> Self {
    Self { local_id, stream_layer }
  }
}

impl RaftNetworkFactory<TypeConfig> for NetworkFactory {
  type Network = NetworkConnection;

  async fn new_client(&mut self, target: NodeId, node: &Node) -> Self::Network {
    NetworkConnection {
      local_id: self.local_id,
      target,
      addr: node.addr.clone(),
      stream_layer: Arc::clone(&self.stream_layer),
    }
  }
}

pub struct NetworkConnection {
  local_id: NodeId,
  target: NodeId,
  addr: String,
  stream_layer: Arc<StreamLayer>,
}

impl NetworkConnection {
  async fn client(&self) -> Result<RaftClient<Channel>, RPCError<NodeId, Node, RaftError<NodeId>>> {
    let socket_addr = self
      .addr
      .parse()
      .map_err(|e| RPCError::Unreachable(Unreachable::new(&std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("{e}")))))?;

    let stream_layer = Arc::clone(&self.stream_layer);
    let endpoint = Endpoint::try_from(format!("http://{}", self.addr))
      .map_err(|e| RPCError::Network(NetworkError::new(&e)))?;

    let channel = endpoint
      .connect_with_connector(tower::util::service_fn(move |_uri: Uri| {
        let stream_layer = Arc::clone(&stream_layer);
        async move { stream_layer.dial(socket_addr, "localhost").await }
      }))
      .await
      .map_err(|e| RPCError::Unreachable(Unreachable::new(&e)))?;

    Ok(RaftClient::new(channel))
  }

  fn encode<T: serde::Serialize>(&self, value: &T) -> Result<RaftMessage, RPCError<NodeId, Node, RaftError<NodeId>>> {
    Ok(RaftMessage {
      source_id: self.local_id,
      payload: bincode::serialize(value).map_err(|e| RPCError::Network(NetworkError::new(&e)))?,
    })
  }

  fn decode<T: serde::de::DeserializeOwned>(&self, reply: RaftMessage) -> Result<T, RPCError<NodeId, Node, RaftError<NodeId>>> {
    bincode::deserialize(&reply.payload).map_err(|e| RPCError::Network(NetworkError::new(&e)))
  }
}

impl RaftNetwork<TypeConfig> for NetworkConnection {
  async fn append_entries(
    &mut self,
    rpc: AppendEntriesRequest<TypeConfig>,
    _option: RPCOption,
  ) -> Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, Node, RaftError<NodeId>>> {
    let message = self.encode(&rpc)?;
    let mut client = self.client().await?;
    let reply = client
      .append_entries(message)
      .await
      .map_err(|status| RPCError::Network(NetworkError::new(&status)))?
      .into_inner();
    self.decode(reply)
  }

  async fn install_snapshot(
    &mut self,
    rpc: InstallSnapshotRequest<TypeConfig>,
    _option: RPCOption,
  ) -> Result<InstallSnapshotResponse<NodeId>, RPCError<NodeId, Node, RaftError<NodeId, InstallSnapshotError>>> {
    let message = RaftMessage {
      source_id: self.local_id,
      payload: bincode::serialize(&rpc).map_err(|e| RPCError::Network(NetworkError::new(&e)))?,
    };
    let mut client = self
      .client()
      .await
      .map_err(|e| RPCError::Network(NetworkError::new(&e)))?;
    let reply = client
      .install_snapshot(message)
      .await
      .map_err(|status| RPCError::Network(NetworkError::new(&status)))?
      .into_inner();
    bincode::deserialize(&reply.payload).map_err(|e| RPCError::Network(NetworkError::new(&e)))
  }

  async fn vote(
    &mut self,
    rpc: VoteRequest<NodeId>,
    _option: RPCOption,
  ) -> Result<VoteResponse<NodeId>, RPCError<NodeId, Node, RaftError<NodeId>>> {
    let message = self.encode(&rpc)?;
    let mut client = self.client().await?;
    let reply = client
      .vote(message)
      .await
      .map_err(|status| RPCError::Network(NetworkError::new(&status)))?
      .into_inner();
    self.decode(reply)
  }
}
