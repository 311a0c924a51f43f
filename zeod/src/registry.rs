use crate::client::ClientStub;
use crate::commit_lock::CommitLock;
use crate::invalidation::InvalidationQueue;
use crate::session::Session;
use crate::session::SessionId;
use crate::stats::StorageStats;
use crate::timeout::TimeoutWatchdog;
use chrono::DateTime;
use chrono::Utc;
use libzeod::id::Oid;
use libzeod::id::Tid;
use libzeod::Storage;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;
use tracing::info;

#[derive(Clone, Debug)]
pub struct ServerCfg {
  /// Every storage is served read-only regardless of its own setting.
  pub read_only: bool,
  pub invalidation_queue_size: usize,
  /// `None` or zero disables the timeout watchdog.
  pub transaction_timeout: Option<Duration>,
}

impl Default for ServerCfg {
  fn default() -> Self {
    Self {
      read_only: false,
      invalidation_queue_size: 100,
      transaction_timeout: None,
    }
  }
}

/// A storage as seen by the server: the engine plus everything shared by the sessions using it.
pub struct ServedStorage {
  pub(crate) name: String,
  pub(crate) storage: Storage,
  pub(crate) commit_lock: CommitLock,
  pub(crate) invq: Mutex<InvalidationQueue>,
  pub(crate) connections: Mutex<Vec<(SessionId, Arc<dyn ClientStub>)>>,
  pub(crate) stats: StorageStats,
  pub(crate) watchdog: TimeoutWatchdog,
}

impl ServedStorage {
  fn new(storage: Storage, cfg: &ServerCfg) -> Self {
    let name = storage.name().to_string();
    let watchdog = match cfg.transaction_timeout.filter(|t| !t.is_zero()) {
      Some(timeout) => TimeoutWatchdog::start(name.clone(), timeout),
      None => TimeoutWatchdog::disabled(),
    };
    Self {
      commit_lock: CommitLock::new(name.clone()),
      invq: Mutex::new(InvalidationQueue::new(cfg.invalidation_queue_size)),
      connections: Mutex::new(Vec::new()),
      stats: StorageStats::default(),
      watchdog,
      name,
      storage,
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn storage(&self) -> &Storage {
    &self.storage
  }

  pub fn stats(&self) -> &StorageStats {
    &self.stats
  }

  pub fn commit_lock(&self) -> &CommitLock {
    &self.commit_lock
  }

  pub fn get_invalidations(&self, since: Tid) -> Option<(Tid, Vec<Oid>)> {
    self.invq.lock().get_invalidations(since)
  }

  pub(crate) fn register(&self, session: SessionId, client: Arc<dyn ClientStub>) {
    self.connections.lock().push((session, client));
  }

  pub(crate) fn unregister(&self, session: SessionId) {
    self.connections.lock().retain(|(id, _)| *id != session);
  }

  /// Records a committed transaction and notifies every session except `committer`. Must be called while `committer` still holds the commit lock.
  pub(crate) fn invalidate(
    &self,
    committer: SessionId,
    broadcast_tid: Option<Tid>,
    tid: Tid,
    oids: &[Oid],
  ) {
    self.invq.lock().push(tid, oids.to_vec());
    let targets = self
      .connections
      .lock()
      .iter()
      .filter(|(id, _)| *id != committer)
      .map(|(_, client)| client.clone())
      .collect::<Vec<_>>();
    for client in targets {
      client.invalidate_transaction(broadcast_tid, oids);
    }
  }
}

pub struct StorageServer {
  cfg: ServerCfg,
  storages: BTreeMap<String, Arc<ServedStorage>>,
  next_session_id: AtomicU64,
  closing: AtomicBool,
  started: DateTime<Utc>,
}

impl StorageServer {
  /// Must be called within a tokio runtime if a transaction timeout is configured.
  pub fn new(cfg: ServerCfg, storages: Vec<Storage>) -> Arc<Self> {
    let storages = storages
      .into_iter()
      .map(|s| {
        let served = Arc::new(ServedStorage::new(s, &cfg));
        (served.name.clone(), served)
      })
      .collect();
    Arc::new(Self {
      cfg,
      storages,
      next_session_id: AtomicU64::new(1),
      closing: AtomicBool::new(false),
      started: Utc::now(),
    })
  }

  pub fn cfg(&self) -> &ServerCfg {
    &self.cfg
  }

  pub fn is_read_only(&self) -> bool {
    self.cfg.read_only
  }

  pub fn is_closing(&self) -> bool {
    self.closing.load(Ordering::Acquire)
  }

  pub fn storage(&self, name: &str) -> Option<&Arc<ServedStorage>> {
    self.storages.get(name)
  }

  pub fn storages(&self) -> impl Iterator<Item = &Arc<ServedStorage>> {
    self.storages.values()
  }

  /// Creates a session for a new client connection. `label` identifies the client in logs.
  pub fn connect(self: &Arc<Self>, client: Arc<dyn ClientStub>, label: impl Into<String>) -> Session {
    let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
    Session::new(id, label.into(), self.clone(), client)
  }

  pub fn status_report(&self) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Server started: {}", self.started.to_rfc3339());
    let _ = writeln!(out, "Read-only: {}", self.cfg.read_only);
    for storage in self.storages.values() {
      out.push('\n');
      let _ = storage.stats.report(
        &mut out,
        &storage.name,
        storage.commit_lock.waiting_len(),
        storage.storage.metrics(),
      );
    }
    out
  }

  /// Refuses new transactions, disconnects every client and closes the storages. Calling this again does nothing.
  pub async fn close(&self) {
    if self.closing.swap(true, Ordering::AcqRel) {
      return;
    };
    info!("closing server");
    for storage in self.storages.values() {
      storage.commit_lock.close();
      storage.watchdog.stop();
      let clients = storage
        .connections
        .lock()
        .iter()
        .map(|(_, client)| client.clone())
        .collect::<Vec<_>>();
      for client in clients {
        client.close();
      }
      if let Err(err) = storage.storage.close().await {
        error!(storage = %storage.name, error = %err, "failed to close storage");
      };
    }
    info!("closed server");
  }
}
