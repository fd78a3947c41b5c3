/// Multi-node scenarios E5/E6 (`spec.md` §8): three-node replication and
/// leaving a cluster. Lives under `tests/` (rather than a `#[cfg(test)]`
/// module) following the multi-process integration-test layout this pack's
/// `estuary-flow` uses for scenarios a single crate's unit tests can't host.
use std::time::Duration;

use proglog::config::{Config, RaftConfig, SegmentConfig};
use proglog::distributed_log::DistributedLog;
use proglog::record::Record;

fn node_config(local_id: u64, port: u16, bootstrap: bool) -> Config {
  Config {
    data_dir: "unused".to_string(),
    bind_addr: format!("127.0.0.1:{port}"),
    segment: SegmentConfig::default(),
    raft: RaftConfig {
      local_id,
      heartbeat_timeout: Duration::from_millis(50),
      election_timeout: Duration::from_millis(150),
      leader_lease_timeout: Duration::from_millis(50),
      commit_timeout: Duration::from_millis(500),
      bootstrap,
    },
  }
}

async fn read_eventually(log: &DistributedLog, offset: u64, expect: &[u8], deadline: Duration) -> bool {
  let start = tokio::time::Instant::now();
  loop {
    if let Ok(record) = log.read(offset) {
      if record.value == expect {
        return true;
      }
    }
    if start.elapsed() >= deadline {
      return false;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_node_replication_and_leave() {
  let dir0 = tempfile::tempdir().unwrap();
  let dir1 = tempfile::tempdir().unwrap();
  let dir2 = tempfile::tempdir().unwrap();

  let config0 = node_config(0, 18100, true);
  let config1 = node_config(1, 18101, false);
  let config2 = node_config(2, 18102, false);

  let node0 = DistributedLog::new(dir0.path(), &config0).await.unwrap();
  let node1 = DistributedLog::new(dir1.path(), &config1).await.unwrap();
  let node2 = DistributedLog::new(dir2.path(), &config2).await.unwrap();

  node0.wait_for_leader(Duration::from_secs(2)).await.unwrap();

  node0.join(1, config1.bind_addr.clone()).await.unwrap();
  node0.join(2, config2.bind_addr.clone()).await.unwrap();

  let offset_first = node0.append(Record::new(b"first".to_vec())).await.unwrap();
  let offset_second = node0.append(Record::new(b"second".to_vec())).await.unwrap();

  assert_eq!(0, offset_first);
  assert_eq!(1, offset_second);

  // E5: within 500ms every node observes both records.
  for node in [&node0, &node1, &node2] {
    assert!(read_eventually(node, 0, b"first", Duration::from_millis(500)).await);
    assert!(read_eventually(node, 1, b"second", Duration::from_millis(500)).await);
  }

  // E6: after node 1 leaves, new writes no longer reach it.
  node0.leave(1).await.unwrap();
  tokio::time::sleep(Duration::from_millis(50)).await;

  let offset_third = node0.append(Record::new(b"third".to_vec())).await.unwrap();
  assert_eq!(2, offset_third);

  assert!(read_eventually(&node2, 2, b"third", Duration::from_millis(500)).await);
  assert!(node1.read(2).is_err());
}
