/// Generated gRPC types, compiled by `build.rs` from the `.proto` files
/// under `src/api/`.
///
/// `v1` is the application-facing surface (`Produce`/`Consume`/
/// `ConsumeStream`/`ProduceStream`), out of scope for the core per
/// `spec.md` §1 but kept here as the thin adapter that sits in front of it.
/// `raft::v1` is the consensus transport's wire envelope, carried over the
/// same listening socket once the stream layer has peeled off the leading
/// `0x01` demux byte.
pub mod v1 {
  tonic::include_proto!("log.v1");
}

pub mod raft {
  pub mod v1 {
    tonic::include_proto!("raft.v1");
  }
}
