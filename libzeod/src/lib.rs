use crate::background::start_autopack_worker;
use crate::background::start_checkpoint_worker;
use crate::byte_store::file::FileByteStore;
use crate::byte_store::ByteStore;
use crate::byte_store::WriteBatch;
use crate::conflict::ConflictResolver;
use crate::id::Oid;
use crate::id::Tid;
use crate::keys::all_revisions_range;
use crate::keys::decode_revision_key;
use crate::keys::info_key;
use crate::keys::pending_key;
use crate::keys::INFO_LTID;
use crate::keys::INFO_VERSION;
use crate::lock_file::LockFile;
use crate::record::decode;
use crate::record::decode_tid;
use crate::record::PendingRecord;
use crate::record::SCHEMA_VERSION;
use ctx::Ctx;
use metrics::StorageMetrics;
use op::checkpoint::op_checkpoint;
use op::checkpoint::OpCheckpointInput;
use op::checkpoint::OpCheckpointOutput;
use op::load::op_get_serial;
use op::load::op_load;
use op::load::op_load_serial;
use op::load::OpGetSerialInput;
use op::load::OpGetSerialOutput;
use op::load::OpLoadInput;
use op::load::OpLoadOutput;
use op::load::OpLoadSerialInput;
use op::load::OpLoadSerialOutput;
use op::new_oid::op_new_oid;
use op::pack::op_pack;
use op::pack::OpPackInput;
use op::pack::OpPackOutput;
use op::store::op_store;
use op::store::OpStoreInput;
use op::store::OpStoreOutput;
use op::tpc_abort::abort_batch;
use op::tpc_abort::op_tpc_abort;
use op::tpc_abort::OpTpcAbortInput;
use op::tpc_abort::OpTpcAbortOutput;
use op::tpc_begin::op_tpc_begin;
use op::tpc_begin::OpTpcBeginInput;
use op::tpc_begin::OpTpcBeginOutput;
use op::tpc_finish::op_tpc_finish;
use op::tpc_finish::OpTpcFinishInput;
use op::tpc_finish::OpTpcFinishOutput;
use op::tpc_vote::op_tpc_vote;
use op::tpc_vote::OpTpcVoteInput;
use op::tpc_vote::OpTpcVoteOutput;
use op::undo::op_undo;
use op::undo::OpUndoInput;
use op::undo::OpUndoOutput;
use op::undo_log::op_undo_log;
use op::undo_log::OpUndoLogInput;
use op::undo_log::OpUndoLogOutput;
use op::undo_log::UndoSpecification;
use op::OpResult;
use op::OpenError;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::spawn;
use tokio::task::spawn_blocking;
use tracing::info;
use tracing::info_span;
use tracing::warn;
use tracing::Instrument;

pub mod background;
pub mod byte_store;
pub mod conflict;
pub mod ctx;
pub mod id;
pub mod keys;
pub mod lock_file;
pub mod metrics;
pub mod op;
pub mod record;

#[cfg(test)]
mod tests;

const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct StorageCfg {
  pub name: String,
  /// Environment directory. It is created if missing, but its parent must exist.
  pub path: PathBuf,
  pub read_only: bool,
  /// Write buffer size used when writing checkpoint snapshots.
  pub cache_size: usize,
  /// `None` disables the checkpoint worker.
  pub checkpoint_interval: Option<Duration>,
  /// Unforced checkpoints are skipped until the commit log has grown by this much.
  pub checkpoint_min_log_bytes: u64,
  /// `None` disables the autopack worker.
  pub autopack_frequency: Option<Duration>,
  /// Autopack keeps this much history.
  pub autopack_window: Duration,
  /// Every N-th autopack also collects garbage; 0 never does.
  pub autopack_gc_every: u64,
}

impl StorageCfg {
  pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
    Self {
      name: name.into(),
      path: path.into(),
      read_only: false,
      cache_size: 128 * 1024 * 1024,
      checkpoint_interval: Some(Duration::from_secs(120)),
      checkpoint_min_log_bytes: 0,
      autopack_frequency: None,
      autopack_window: Duration::from_secs(4 * 60 * 60),
      autopack_gc_every: 0,
    }
  }
}

pub struct StorageLoader {
  cfg: StorageCfg,
  store: Option<Arc<dyn ByteStore>>,
  resolver: Option<Arc<dyn ConflictResolver>>,
}

impl StorageLoader {
  /// Uses a `FileByteStore` under `cfg.path`, guarded by a lock file.
  pub fn new(cfg: StorageCfg) -> Self {
    Self {
      cfg,
      store: None,
      resolver: None,
    }
  }

  /// Uses `store` as is; `cfg.path` is not touched.
  pub fn with_byte_store(cfg: StorageCfg, store: Arc<dyn ByteStore>) -> Self {
    Self {
      cfg,
      store: Some(store),
      resolver: None,
    }
  }

  pub fn conflict_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
    self.resolver = Some(resolver);
    self
  }

  pub async fn load_and_start(self) -> Result<Storage, OpenError> {
    let cfg = self.cfg;
    let (store, lock_file) = match self.store {
      Some(store) => (store, None),
      None => {
        let path = cfg.path.clone();
        let cache_size = cfg.cache_size;
        spawn_blocking(move || -> Result<(Arc<dyn ByteStore>, Option<LockFile>), OpenError> {
          match fs::create_dir(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
            Err(err) => return Err(err.into()),
          };
          let lock_file = LockFile::acquire(&path)?;
          let store: Arc<dyn ByteStore> = Arc::new(FileByteStore::open(&path, cache_size)?);
          Ok((store, Some(lock_file)))
        })
        .await
        .unwrap()?
      }
    };

    match store.get(&info_key(INFO_VERSION)) {
      Some(version) if version == SCHEMA_VERSION => {}
      Some(version) => return Err(OpenError::IncompatibleVersion(version)),
      None if cfg.read_only => {}
      None => {
        let mut batch = WriteBatch::new();
        batch.put(info_key(INFO_VERSION), SCHEMA_VERSION.to_vec());
        store.commit(batch).await?;
      }
    };

    if !cfg.read_only {
      if let Some(tid) = abort_pending(store.as_ref()).await? {
        warn!(storage = %cfg.name, tid = %tid, "aborted transaction left pending by an unclean shutdown");
      };
    };

    let ltid = match store.get(&info_key(INFO_LTID)) {
      Some(raw) => decode_tid("ltid", &raw)?,
      None => Tid::ZERO,
    };
    let (start, end) = all_revisions_range();
    let last_oid = store
      .last_in_range(&start, &end)
      .and_then(|(key, _)| decode_revision_key(&key))
      .map_or(0, |(oid, _)| oid.0);

    let metrics = StorageMetrics::default();
    let ctx = Arc::new(Ctx {
      name: cfg.name.clone(),
      read_only: cfg.read_only,
      store,
      resolver: self.resolver,
      metrics: metrics.clone(),
      checkpoint_min_log_bytes: cfg.checkpoint_min_log_bytes,
      last_oid: AtomicU64::new(last_oid),
      ltid: AtomicU64::new(ltid.0),
      txn: tokio::sync::Mutex::new(None),
      pack_lock: tokio::sync::Mutex::new(()),
      closing: AtomicBool::new(false),
      lock_file: Mutex::new(lock_file),
      workers: Mutex::new(Vec::new()),
    });

    {
      let mut workers = ctx.workers.lock();
      if let Some(interval) = cfg.checkpoint_interval.filter(|i| !i.is_zero()) {
        workers.push(start_checkpoint_worker(ctx.clone(), interval));
      };
      if let Some(frequency) = cfg.autopack_frequency.filter(|f| !f.is_zero()) {
        if !cfg.read_only {
          workers.push(start_autopack_worker(
            ctx.clone(),
            frequency,
            cfg.autopack_window,
            cfg.autopack_gc_every,
          ));
        };
      };
    }

    info!(
      storage = %cfg.name,
      last_tid = %ltid,
      last_oid,
      read_only = cfg.read_only,
      "opened storage"
    );
    Ok(Storage { cfg, ctx, metrics })
  }
}

/// Deletes the revisions and markers of a transaction that was in flight when the process stopped.
async fn abort_pending(store: &dyn ByteStore) -> OpResult<Option<Tid>> {
  let Some(raw) = store.get(&pending_key()) else {
    return Ok(None);
  };
  let pending: PendingRecord = decode("pending record", &raw)?;
  store
    .commit(abort_batch(store, pending.tid, &BTreeSet::new()))
    .await?;
  Ok(Some(pending.tid))
}

/// Operations that write run on their own task, so they complete even if the returned future is dropped.
#[derive(Clone)]
pub struct Storage {
  cfg: StorageCfg,
  ctx: Arc<Ctx>,
  metrics: StorageMetrics,
}

impl Storage {
  // Provide getter to prevent mutating StorageCfg.
  pub fn cfg(&self) -> &StorageCfg {
    &self.cfg
  }

  pub fn metrics(&self) -> &StorageMetrics {
    &self.metrics
  }

  pub fn name(&self) -> &str {
    &self.cfg.name
  }

  pub fn is_read_only(&self) -> bool {
    self.cfg.read_only
  }

  pub fn last_transaction(&self) -> Tid {
    self.ctx.last_tid()
  }

  pub fn new_object_id(&self) -> OpResult<Oid> {
    op_new_oid(&self.ctx)
  }

  pub async fn load(&self, input: OpLoadInput) -> OpResult<OpLoadOutput> {
    op_load(self.ctx.clone(), input).await
  }

  pub async fn load_serial(&self, input: OpLoadSerialInput) -> OpResult<OpLoadSerialOutput> {
    op_load_serial(self.ctx.clone(), input).await
  }

  pub async fn get_serial(&self, input: OpGetSerialInput) -> OpResult<OpGetSerialOutput> {
    op_get_serial(self.ctx.clone(), input).await
  }

  pub async fn tpc_begin(&self, input: OpTpcBeginInput) -> OpResult<OpTpcBeginOutput> {
    let span = info_span!("tpc_begin op", storage = %self.cfg.name);
    spawn(op_tpc_begin(self.ctx.clone(), input).instrument(span))
      .await
      .unwrap()
  }

  pub async fn store(&self, input: OpStoreInput) -> OpResult<OpStoreOutput> {
    let span = info_span!("store op", storage = %self.cfg.name, oid = %input.oid);
    spawn(op_store(self.ctx.clone(), input).instrument(span))
      .await
      .unwrap()
  }

  pub async fn tpc_vote(&self, input: OpTpcVoteInput) -> OpResult<OpTpcVoteOutput> {
    op_tpc_vote(self.ctx.clone(), input).await
  }

  pub async fn tpc_finish(&self, input: OpTpcFinishInput) -> OpResult<OpTpcFinishOutput> {
    let span = info_span!("tpc_finish op", storage = %self.cfg.name);
    spawn(op_tpc_finish(self.ctx.clone(), input).instrument(span))
      .await
      .unwrap()
  }

  pub async fn tpc_abort(&self, input: OpTpcAbortInput) -> OpResult<OpTpcAbortOutput> {
    let span = info_span!("tpc_abort op", storage = %self.cfg.name);
    spawn(op_tpc_abort(self.ctx.clone(), input).instrument(span))
      .await
      .unwrap()
  }

  pub async fn undo(&self, input: OpUndoInput) -> OpResult<OpUndoOutput> {
    let span = info_span!("undo op", storage = %self.cfg.name, undo_tid = %input.undo_tid);
    spawn(op_undo(self.ctx.clone(), input).instrument(span))
      .await
      .unwrap()
  }

  pub async fn undo_log(&self, input: OpUndoLogInput) -> OpResult<OpUndoLogOutput> {
    op_undo_log(self.ctx.clone(), input).await
  }

  pub async fn undo_info(
    &self,
    first: u64,
    last: i64,
    spec: Option<UndoSpecification>,
  ) -> OpResult<OpUndoLogOutput> {
    op_undo_log(self.ctx.clone(), OpUndoLogInput {
      first,
      last,
      filter: spec.map(UndoSpecification::into_filter),
    })
    .await
  }

  pub async fn pack(&self, input: OpPackInput) -> OpResult<OpPackOutput> {
    let span = info_span!("pack op", storage = %self.cfg.name, gc = input.gc);
    spawn(op_pack(self.ctx.clone(), input).instrument(span))
      .await
      .unwrap()
  }

  pub async fn checkpoint(&self, input: OpCheckpointInput) -> OpResult<OpCheckpointOutput> {
    op_checkpoint(self.ctx.clone(), input).await
  }

  /// Stops the background workers, forces a final checkpoint and releases the environment. Calling this again does nothing.
  pub async fn close(&self) -> OpResult<()> {
    if self.ctx.closing.swap(true, Ordering::AcqRel) {
      return Ok(());
    };
    info!(storage = %self.cfg.name, "closing storage");
    let workers = std::mem::take(&mut *self.ctx.workers.lock());
    for worker in workers {
      worker.stop_and_join(WORKER_JOIN_TIMEOUT).await;
    }
    for _ in 0..2 {
      op_checkpoint(self.ctx.clone(), OpCheckpointInput { force: true }).await?;
    }
    self.ctx.store.close().await?;
    self.ctx.lock_file.lock().take();
    info!(storage = %self.cfg.name, "closed storage");
    Ok(())
  }
}
