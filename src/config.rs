/// Recognized configuration, per `spec.md` §6.
///
/// Loaded from a TOML file (`Config::from_file`) with environment
/// overrides applied on top via `dotenv` + `std::env::var`, the same
/// pattern `main.rs` already used for `HOST`/`PORT` before this crate grew
/// a consensus layer.
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentConfig {
  pub max_store_bytes: u64,
  pub max_index_bytes: u64,
  pub initial_offset: u64,
}

impl Default for SegmentConfig {
  fn default() -> Self {
    Self {
      max_store_bytes: 1024,
      max_index_bytes: 1024,
      initial_offset: 0,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
  pub local_id: u64,
  #[serde(with = "duration_millis")]
  pub heartbeat_timeout: Duration,
  #[serde(with = "duration_millis")]
  pub election_timeout: Duration,
  #[serde(with = "duration_millis")]
  pub leader_lease_timeout: Duration,
  #[serde(with = "duration_millis")]
  pub commit_timeout: Duration,
  pub bootstrap: bool,
}

impl Default for RaftConfig {
  fn default() -> Self {
    Self {
      local_id: 0,
      heartbeat_timeout: Duration::from_millis(150),
      election_timeout: Duration::from_millis(300),
      leader_lease_timeout: Duration::from_millis(150),
      commit_timeout: Duration::from_millis(500),
      bootstrap: false,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  pub data_dir: String,
  pub bind_addr: String,
  pub segment: SegmentConfig,
  pub raft: RaftConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      data_dir: "data".to_string(),
      bind_addr: "127.0.0.1:8400".to_string(),
      segment: SegmentConfig::default(),
      raft: RaftConfig::default(),
    }
  }
}

impl Config {
  pub fn from_file(path: &str) -> anyhow::Result<Self> {
    let contents = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&contents)?)
  }

  /// Applies `PROGLOG_*` environment overrides on top of whatever was
  /// loaded from the config file. Mirrors the book's environment-driven
  /// configuration without pulling in a full CLI parsing framework, which
  /// `spec.md` §1 places out of scope.
  pub fn apply_env_overrides(mut self) -> Self {
    if let Ok(dir) = std::env::var("PROGLOG_DATA_DIR") {
      self.data_dir = dir;
    }
    if let Ok(addr) = std::env::var("PROGLOG_BIND_ADDR") {
      self.bind_addr = addr;
    }
    if let Ok(id) = std::env::var("PROGLOG_RAFT_LOCAL_ID") {
      if let Ok(id) = id.parse() {
        self.raft.local_id = id;
      }
    }
    if let Ok(bootstrap) = std::env::var("PROGLOG_RAFT_BOOTSTRAP") {
      self.raft.bootstrap = bootstrap == "1" || bootstrap.eq_ignore_ascii_case("true");
    }
    self
  }
}

/// `Duration` (de)serialization as milliseconds, since `toml`/`serde` have
/// no first-class duration support and pulling in `humantime-serde` just
/// for this one field isn't worth a new dependency.
mod duration_millis {
  use std::time::Duration;

  use serde::{Deserialize, Deserializer, Serialize, Serializer};

  pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    (duration.as_millis() as u64).serialize(serializer)
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let millis = u64::deserialize(deserializer)?;
    Ok(Duration::from_millis(millis))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_config_has_sane_segment_sizes() {
    let config = Config::default();

    assert_eq!(1024, config.segment.max_store_bytes);
    assert_eq!(1024, config.segment.max_index_bytes);
    assert_eq!(0, config.segment.initial_offset);
  }

  #[test]
  fn env_overrides_take_precedence_over_file_values() {
    std::env::set_var("PROGLOG_DATA_DIR", "/tmp/proglog-test-override");
    let config = Config::default().apply_env_overrides();
    std::env::remove_var("PROGLOG_DATA_DIR");

    assert_eq!("/tmp/proglog-test-override", config.data_dir);
  }
}
