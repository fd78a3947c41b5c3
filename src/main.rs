use std::sync::Arc;

use dotenv::dotenv;
use tracing::info;

use proglog::{api, config::Config, distributed_log::DistributedLog, server::LogServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  dotenv().ok();
  tracing_subscriber::fmt::init();

  let config_path = std::env::var("PROGLOG_CONFIG").unwrap_or_else(|_| "proglog.toml".to_string());
  let config = Config::from_file(&config_path).unwrap_or_default().apply_env_overrides();

  info!(bind_addr = %config.bind_addr, local_id = config.raft.local_id, "starting proglog node");

  let distributed_log = Arc::new(DistributedLog::new(&config.data_dir, &config).await?);

  let stream_layer = distributed_log.stream_layer();
  let log_server = LogServer::new(Arc::clone(&distributed_log));
  let app_incoming = stream_layer.app_incoming().await;

  tonic::transport::Server::builder()
    .add_service(api::v1::log_server::LogServer::new(log_server))
    .serve_with_incoming(app_incoming)
    .await?;

  Ok(())
}
