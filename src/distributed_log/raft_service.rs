/// Server-side half of the consensus RPCs (`network.rs` is the client
/// half): decodes the bincode payload carried in each `RaftMessage` and
/// forwards it to the local `openraft::Raft` handle.
use tonic::{Request, Response, Status};

use crate::api::raft::v1::raft_server::Raft as RaftRpc;
use crate::api::raft::v1::{RaftMessage, RaftReply};

use super::type_config::{NodeId, Raft};

pub struct RaftService {
  raft: Raft,
}

impl RaftService {
  pub fn new(raft: Raft) -> Self {
    Self { raft }
  }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<RaftReply, Status> {
  Ok(RaftReply {
    payload: bincode::serialize(value).map_err(|e| Status::internal(e.to_string()))?,
  })
}

fn decode<T: serde::de::DeserializeOwned>(message: RaftMessage) -> Result<T, Status> {
  bincode::deserialize(&message.payload).map_err(|e| Status::invalid_argument(e.to_string()))
}

#[tonic::async_trait]
impl RaftRpc for RaftService {
  async fn append_entries(&self, request: Request<RaftMessage>) -> Result<Response<RaftReply>, Status> {
    let rpc = decode(request.into_inner())?;
    let response = self
      .raft
      .append_entries(rpc)
      .await
      .map_err(|e| Status::internal(e.to_string()))?;
    Ok(Response::new(encode(&response)?))
  }

  async fn install_snapshot(&self, request: Request<RaftMessage>) -> Result<Response<RaftReply>, Status> {
    let rpc = decode(request.into_inner())?;
    let response = self
      .raft
      .install_snapshot(rpc)
      .await
      .map_err(|e| Status::internal(e.to_string()))?;
    Ok(Response::new(encode(&response)?))
  }

  async fn vote(&self, request: Request<RaftMessage>) -> Result<Response<RaftReply>, Status> {
    let rpc = decode(request.into_inner())?;
    let response: openraft::raft::VoteResponse<NodeId> =
      self.raft.vote(rpc).await.map_err(|e| Status::internal(e.to_string()))?;
    Ok(Response::new(encode(&response)?))
  }
}
