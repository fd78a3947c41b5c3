/// The application gRPC adapter (`spec.md` §4.5/§6): thin translation
/// between `api::v1::Log` and `DistributedLog`. `Produce` proposes through
/// consensus; a `NotLeader` error surfaces as `FAILED_PRECONDITION` carrying
/// the leader's address in the status message so a client can redirect,
/// per `spec.md` §7's propagation policy ("do not retry internally").
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::error;

use crate::{api, distributed_log::DistributedLog, error::LogError, record::Record};

#[derive(Clone)]
pub struct LogServer {
  log: Arc<DistributedLog>,
}

impl LogServer {
  pub fn new(log: Arc<DistributedLog>) -> Self {
    Self { log }
  }
}

fn to_status(err: anyhow::Error) -> Status {
  match err.downcast_ref::<LogError>() {
    Some(LogError::NotLeader { leader_hint }) => Status::failed_precondition(format!(
      "not the leader, hint: {}",
      leader_hint.clone().unwrap_or_else(|| "unknown".to_string())
    )),
    Some(LogError::OffsetOutOfRange { offset }) => Status::out_of_range(format!("offset {offset} out of range")),
    Some(LogError::CommitTimeout) => Status::deadline_exceeded("commit timed out"),
    _ => {
      error!(error = %err, "log server request failed");
      Status::unavailable("service unavailable")
    }
  }
}

#[tonic::async_trait]
impl api::v1::log_server::Log for LogServer {
  async fn produce(&self, request: Request<api::v1::ProduceRequest>) -> Result<Response<api::v1::ProduceResponse>, Status> {
    let record: Record = request
      .into_inner()
      .record
      .ok_or_else(|| Status::invalid_argument("record is required"))?
      .into();

    let offset = self.log.append(record).await.map_err(to_status)?;

    Ok(Response::new(api::v1::ProduceResponse { offset }))
  }

  async fn consume(&self, request: Request<api::v1::ConsumeRequest>) -> Result<Response<api::v1::ConsumeResponse>, Status> {
    let offset = request.into_inner().offset;

    let record = self.log.read(offset).map_err(to_status)?;

    Ok(Response::new(api::v1::ConsumeResponse {
      record: Some(record.into()),
    }))
  }

  type consume_streamStream = ReceiverStream<Result<api::v1::ConsumeResponse, Status>>;

  async fn consume_stream(
    &self,
    request: Request<api::v1::ConsumeRequest>,
  ) -> Result<Response<Self::consume_streamStream>, Status> {
    let mut offset = request.into_inner().offset;

    let (tx, rx) = mpsc::channel(4);

    let log = Arc::clone(&self.log);

    tokio::spawn(async move {
      loop {
        match log.read(offset) {
          Ok(record) => {
            offset += 1;
            if tx
              .send(Ok(api::v1::ConsumeResponse {
                record: Some(record.into()),
              }))
              .await
              .is_err()
            {
              return;
            }
          }
          Err(e) if e.downcast_ref::<LogError>().map_or(false, |le| matches!(le, LogError::OffsetOutOfRange { .. })) => {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
          }
          Err(e) => {
            let _ = tx.send(Err(to_status(e))).await;
            return;
          }
        }
      }
    });

    Ok(Response::new(ReceiverStream::new(rx)))
  }

  type produce_streamStream = ReceiverStream<Result<api::v1::ProduceResponse, Status>>;

  async fn produce_stream(
    &self,
    request: Request<Streaming<api::v1::ProduceRequest>>,
  ) -> Result<Response<Self::produce_streamStream>, Status> {
    let mut request_streamer = request.into_inner();

    let (tx, rx) = mpsc::channel(4);

    let log = Arc::clone(&self.log);

    tokio::spawn(async move {
      loop {
        let message = match request_streamer.message().await {
          Ok(Some(message)) => message,
          Ok(None) => return,
          Err(e) => {
            let _ = tx.send(Err(e)).await;
            return;
          }
        };

        let record: Record = match message.record {
          Some(record) => record.into(),
          None => {
            let _ = tx.send(Err(Status::invalid_argument("record is required"))).await;
            continue;
          }
        };

        match log.append(record).await {
          Ok(offset) => {
            if tx.send(Ok(api::v1::ProduceResponse { offset })).await.is_err() {
              return;
            }
          }
          Err(e) => {
            let _ = tx.send(Err(to_status(e))).await;
            return;
          }
        }
      }
    });

    Ok(Response::new(ReceiverStream::new(rx)))
  }
}
