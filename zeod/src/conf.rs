use crate::registry::ServerCfg;
use libzeod::StorageCfg;
use serde::Deserialize;
use serde::Serialize;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfStorage {
  pub name: String,
  pub path: PathBuf,
  #[serde(default)]
  pub read_only: bool,
  // Write buffer used when checkpointing; not a read cache.
  #[serde(default = "default_cache_size")]
  pub cache_size: usize,
  // 0 disables the checkpoint worker.
  #[serde(default = "default_checkpoint_interval_secs")]
  pub checkpoint_interval_secs: u64,
  #[serde(default)]
  pub checkpoint_min_log_bytes: u64,
  // 0 disables the autopack worker.
  #[serde(default)]
  pub autopack_frequency_secs: u64,
  #[serde(default = "default_autopack_window_secs")]
  pub autopack_window_secs: u64,
  #[serde(default)]
  pub autopack_gc_every: u64,
}

impl ConfStorage {
  pub fn storage_cfg(&self) -> StorageCfg {
    let mut cfg = StorageCfg::new(self.name.clone(), self.path.clone());
    cfg.read_only = self.read_only;
    cfg.cache_size = self.cache_size;
    cfg.checkpoint_interval = Some(Duration::from_secs(self.checkpoint_interval_secs))
      .filter(|i| !i.is_zero());
    cfg.checkpoint_min_log_bytes = self.checkpoint_min_log_bytes;
    cfg.autopack_frequency =
      Some(Duration::from_secs(self.autopack_frequency_secs)).filter(|f| !f.is_zero());
    cfg.autopack_window = Duration::from_secs(self.autopack_window_secs);
    cfg.autopack_gc_every = self.autopack_gc_every;
    cfg
  }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Conf {
  pub interface: Ipv4Addr,
  pub port: u16,

  #[serde(default)]
  pub read_only: bool,
  #[serde(default = "default_invalidation_queue_size")]
  pub invalidation_queue_size: usize,
  // Absent or 0 disables the timeout watchdog.
  #[serde(default)]
  pub transaction_timeout_secs: Option<u64>,

  // Defaults to `interface`.
  #[serde(default)]
  pub monitor_interface: Option<Ipv4Addr>,
  // Absent disables the monitor.
  #[serde(default)]
  pub monitor_port: Option<u16>,

  pub storages: Vec<ConfStorage>,
}

impl Conf {
  pub fn server_cfg(&self) -> ServerCfg {
    ServerCfg {
      read_only: self.read_only,
      invalidation_queue_size: self.invalidation_queue_size,
      transaction_timeout: self
        .transaction_timeout_secs
        .map(Duration::from_secs)
        .filter(|t| !t.is_zero()),
    }
  }
}

const fn default_cache_size() -> usize {
  128 * 1024 * 1024
}
const fn default_checkpoint_interval_secs() -> u64 {
  120
}
const fn default_autopack_window_secs() -> u64 {
  4 * 60 * 60
}
const fn default_invalidation_queue_size() -> usize {
  100
}
