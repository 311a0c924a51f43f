use crate::client::ClientStub;
use crate::client::SerialOutcome;
use crate::commit_lock::LockRequest;
use crate::error::SessionError;
use crate::error::SessionResult;
use crate::error::WireError;
use crate::registry::ServedStorage;
use crate::registry::StorageServer;
use crate::stats::StorageStats;
use chrono::TimeZone;
use chrono::Utc;
use libzeod::id::Oid;
use libzeod::id::Tid;
use libzeod::id::Transaction;
use libzeod::id::TransactionDescription;
use libzeod::op::load::OpGetSerialInput;
use libzeod::op::load::OpLoadInput;
use libzeod::op::load::OpLoadSerialInput;
use libzeod::op::pack::OpPackInput;
use libzeod::op::store::OpStoreInput;
use libzeod::op::store::StoreOutcome;
use libzeod::op::tpc_abort::OpTpcAbortInput;
use libzeod::op::tpc_begin::OpTpcBeginInput;
use libzeod::op::tpc_finish::OpTpcFinishInput;
use libzeod::op::tpc_vote::OpTpcVoteInput;
use libzeod::op::undo::OpUndoInput;
use libzeod::op::undo_log::OpUndoLogInput;
use libzeod::op::undo_log::UndoSpecification;
use libzeod::op::OpError;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;
use tracing::Instrument;


pub type SessionId = u64;

/// Client-chosen identifier of a transaction, echoed back on every two-phase commit call.
pub type TxnId = u64;

#[derive(Clone, Copy, PartialEq, Eq, Debug, strum::Display)]
pub enum TxnPhase {
  /// Stores are being buffered.
  Begun,
  /// Queued for the commit lock.
  Waiting,
  /// Holds the commit lock; the buffer is being replayed into the storage on its own task.
  Locked,
  Voted,
  /// The commit is running on its own task; it completes even if the call is dropped.
  Finishing,
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct StorageInfo {
  pub name: String,
  pub read_only: bool,
  pub last_transaction: Tid,
  pub supports_undo: bool,
  pub supports_versions: bool,
}

pub struct BufferedStore {
  pub oid: Oid,
  pub serial: Tid,
  pub data: Vec<u8>,
  pub refs: Vec<Oid>,
  pub version: String,
}

struct PendingTransaction {
  id: TxnId,
  txn: Transaction,
  requested_tid: Option<Tid>,
  buffer: Vec<BufferedStore>,
  stored: BTreeSet<Oid>,
  phase: TxnPhase,
  voting: Option<JoinHandle<SessionResult<BTreeSet<Oid>>>>,
  finishing: Option<JoinHandle<SessionResult<Tid>>>,
}

/// Server side of one client connection. Calls must not overlap; the transport awaits each one before dispatching the next, and drops the in-flight call before `disconnect` when the connection goes away.
pub struct Session {
  id: SessionId,
  label: String,
  server: Arc<StorageServer>,
  client: Arc<dyn ClientStub>,
  storage: Option<Arc<ServedStorage>>,
  read_only: bool,
  txn: Option<PendingTransaction>,
  undoing: Option<JoinHandle<SessionResult<Vec<Oid>>>>,
  verifying: bool,
  disconnected: bool,
}

impl Session {
  pub(crate) fn new(
    id: SessionId,
    label: String,
    server: Arc<StorageServer>,
    client: Arc<dyn ClientStub>,
  ) -> Self {
    Self {
      id,
      label,
      server,
      client,
      storage: None,
      read_only: false,
      txn: None,
      undoing: None,
      verifying: false,
      disconnected: false,
    }
  }

  pub fn id(&self) -> SessionId {
    self.id
  }

  pub fn label(&self) -> &str {
    &self.label
  }

  pub fn phase(&self) -> Option<TxnPhase> {
    self.txn.as_ref().map(|t| t.phase)
  }

  fn registered(&self) -> SessionResult<Arc<ServedStorage>> {
    self.storage.clone().ok_or(SessionError::NotRegistered)
  }

  fn check_tid(&mut self, id: TxnId) -> SessionResult<&mut PendingTransaction> {
    if self.read_only {
      return Err(SessionError::ReadOnly);
    };
    match self.txn.as_mut() {
      None => Err(SessionError::StorageTransaction(format!(
        "no current transaction: {id}"
      ))),
      Some(t) if t.id != id => Err(SessionError::StorageTransaction(format!(
        "invalid transaction id {id}, expected {}",
        t.id
      ))),
      Some(t) => Ok(t),
    }
  }

  pub fn register(&mut self, storage_id: &str, read_only: bool) -> SessionResult<()> {
    if self.storage.is_some() {
      return Err(SessionError::AlreadyRegistered);
    };
    if self.server.is_closing() {
      return Err(SessionError::ServerClosing);
    };
    let storage = self
      .server
      .storage(storage_id)
      .cloned()
      .ok_or_else(|| SessionError::UnknownStorage(storage_id.to_string()))?;
    if !read_only && (self.server.is_read_only() || storage.storage.is_read_only()) {
      return Err(SessionError::ReadOnly);
    };
    storage.register(self.id, self.client.clone());
    storage.stats.clients.fetch_add(1, Relaxed);
    info!(
      session = self.id,
      label = %self.label,
      storage = %storage.name,
      read_only,
      "registered"
    );
    self.read_only = read_only;
    self.storage = Some(storage);
    Ok(())
  }

  pub fn get_info(&self) -> SessionResult<StorageInfo> {
    let storage = self.registered()?;
    Ok(StorageInfo {
      name: storage.name.clone(),
      read_only: self.read_only || self.server.is_read_only() || storage.storage.is_read_only(),
      last_transaction: storage.storage.last_transaction(),
      supports_undo: true,
      supports_versions: false,
    })
  }

  pub fn last_transaction(&self) -> SessionResult<Tid> {
    Ok(self.registered()?.storage.last_transaction())
  }

  pub async fn load(&self, oid: Oid) -> SessionResult<(Vec<u8>, Tid)> {
    let storage = self.registered()?;
    let out = storage.storage.load(OpLoadInput { oid }).await?;
    storage.stats.loads.fetch_add(1, Relaxed);
    Ok((out.data, out.serial))
  }

  pub async fn load_serial(&self, oid: Oid, serial: Tid) -> SessionResult<Vec<u8>> {
    let storage = self.registered()?;
    let out = storage
      .storage
      .load_serial(OpLoadSerialInput { oid, serial })
      .await?;
    storage.stats.loads.fetch_add(1, Relaxed);
    Ok(out.data)
  }

  pub async fn get_serial(&self, oid: Oid) -> SessionResult<Tid> {
    let storage = self.registered()?;
    Ok(storage.storage.get_serial(OpGetSerialInput { oid }).await?.serial)
  }

  /// Allocates `n` new oids; anything below 1 allocates one.
  pub fn new_object_ids(&self, n: i64) -> SessionResult<Vec<Oid>> {
    let storage = self.registered()?;
    if self.read_only {
      return Err(SessionError::ReadOnly);
    };
    (0..n.max(1))
      .map(|_| storage.storage.new_object_id().map_err(SessionError::from))
      .collect()
  }

  pub fn get_invalidations(&self, since: Tid) -> SessionResult<Option<(Tid, Vec<Oid>)>> {
    Ok(self.registered()?.get_invalidations(since))
  }

  /// Checks one entry of the client's cache, sending `invalidate_verify` if it is stale.
  pub async fn zeo_verify(&mut self, oid: Oid, serial: Tid) -> SessionResult<()> {
    let storage = self.registered()?;
    if !self.verifying {
      self.verifying = true;
      storage.stats.verifying_clients.fetch_add(1, Relaxed);
    };
    match storage.storage.get_serial(OpGetSerialInput { oid }).await {
      Ok(out) if out.serial == serial => {}
      Ok(_) | Err(OpError::ObjectNotFound) => self.client.invalidate_verify(oid),
      Err(err) => return Err(err.into()),
    };
    Ok(())
  }

  pub fn end_zeo_verify(&mut self) -> SessionResult<()> {
    let storage = self.registered()?;
    if self.verifying {
      self.verifying = false;
      StorageStats::decrement(&storage.stats.verifying_clients);
    };
    self.client.end_verify();
    Ok(())
  }

  pub fn tpc_begin(
    &mut self,
    id: TxnId,
    user: String,
    description: String,
    extension: Vec<u8>,
    tid: Option<Tid>,
    status: u8,
  ) -> SessionResult<()> {
    let storage = self.registered()?;
    if self.read_only {
      return Err(SessionError::ReadOnly);
    };
    if let Some(t) = &self.txn {
      if t.id == id {
        warn!(session = self.id, id, "duplicate tpc_begin");
        return Ok(());
      };
      return Err(SessionError::MultipleBegin);
    };
    let mut txn = Transaction::new(user, description, extension);
    txn.status = status;
    self.txn = Some(PendingTransaction {
      id,
      txn,
      requested_tid: tid,
      buffer: Vec::new(),
      stored: BTreeSet::new(),
      phase: TxnPhase::Begun,
      voting: None,
      finishing: None,
    });
    storage.stats.active_txns.fetch_add(1, Relaxed);
    Ok(())
  }

  pub fn storea(&mut self, store: BufferedStore, id: TxnId) -> SessionResult<()> {
    let t = self.check_tid(id)?;
    if t.phase != TxnPhase::Begun {
      return Err(SessionError::StorageTransaction(format!(
        "cannot store in transaction {id} while {}",
        t.phase
      )));
    };
    t.buffer.push(store);
    Ok(())
  }

  /// Waits for the commit lock if necessary, then writes the buffered stores and votes. On failure the transaction is aborted.
  pub async fn tpc_vote(&mut self, id: TxnId) -> SessionResult<()> {
    let storage = self.registered()?;
    let phase = self.check_tid(id)?.phase;
    match phase {
      TxnPhase::Begun => {
        if let Err(err) = self.acquire_commit_lock(&storage).await {
          if let Some(t) = self.txn.as_mut() {
            t.phase = TxnPhase::Begun;
          };
          return Err(err);
        };
        if let Some(t) = self.txn.as_mut() {
          t.phase = TxnPhase::Locked;
          t.voting = Some(tokio::spawn(
            replay_and_vote(
              storage.clone(),
              self.client.clone(),
              t.txn.clone(),
              t.requested_tid,
              std::mem::take(&mut t.buffer),
            )
            .in_current_span(),
          ));
        };
      }
      TxnPhase::Locked => {}
      phase => {
        return Err(SessionError::StorageTransaction(format!(
          "cannot vote on transaction {id} while {phase}"
        )))
      }
    };
    match self.settle_vote().await {
      Ok(()) => Ok(()),
      Err(err) => {
        debug!(session = self.id, id, error = %err, "vote failed");
        self.abort_current(&storage).await;
        Err(err)
      }
    }
  }

  /// Returns `None` if `id` is not the current transaction.
  pub async fn tpc_finish(&mut self, id: TxnId) -> SessionResult<Option<Tid>> {
    let storage = self.registered()?;
    let session = self.id;
    let Some(t) = self.txn.as_mut().filter(|t| t.id == id) else {
      warn!(session, id, "tpc_finish for a transaction that is not current");
      return Ok(None);
    };
    match t.phase {
      TxnPhase::Voted => {
        t.phase = TxnPhase::Finishing;
        t.finishing = Some(tokio::spawn(
          commit_and_invalidate(
            storage.clone(),
            session,
            t.txn.clone(),
            t.stored.iter().copied().collect(),
          )
          .in_current_span(),
        ));
      }
      TxnPhase::Finishing => {}
      _ => return Err(SessionError::NotVoted),
    };
    match self.settle_finish(&storage).await {
      Ok(tid) => Ok(Some(tid)),
      Err(err) => {
        self.abort_current(&storage).await;
        Err(err)
      }
    }
  }

  /// Does nothing if `id` is not the current transaction.
  pub async fn tpc_abort(&mut self, id: TxnId) -> SessionResult<()> {
    let storage = self.registered()?;
    if self.txn.as_ref().map_or(true, |t| t.id != id) {
      return Ok(());
    };
    self.abort_current(&storage).await;
    Ok(())
  }

  /// Commits a transaction reverting `trans_tid` and returns the oids it touched.
  pub async fn undo(&mut self, trans_tid: Tid) -> SessionResult<Vec<Oid>> {
    let storage = self.registered()?;
    if self.read_only {
      return Err(SessionError::ReadOnly);
    };
    if self.txn.is_some() {
      return Err(SessionError::TransactionActive);
    };
    self.acquire_commit_lock(&storage).await?;
    let txn = Transaction::new(self.label.clone(), format!("undo {trans_tid}"), Vec::new());
    let task = self.undoing.insert(tokio::spawn(
      undo_and_invalidate(storage.clone(), self.id, txn, trans_tid).in_current_span(),
    ));
    let res = join(task).await;
    self.undoing = None;
    self.release_commit_lock(&storage);
    res
  }

  pub async fn undo_log(&self, first: u64, last: i64) -> SessionResult<Vec<TransactionDescription>> {
    self.undo_info(first, last, None).await
  }

  pub async fn undo_info(
    &self,
    first: u64,
    last: i64,
    spec: Option<UndoSpecification>,
  ) -> SessionResult<Vec<TransactionDescription>> {
    let storage = self.registered()?;
    let task = tokio::spawn(async move {
      match spec {
        Some(spec) => storage.storage.undo_info(first, last, Some(spec)).await,
        None => {
          storage
            .storage
            .undo_log(OpUndoLogInput {
              first,
              last,
              filter: None,
            })
            .await
        }
      }
    });
    let out = task
      .await
      .map_err(|err| SessionError::Internal(err.to_string()))??;
    Ok(out.transactions)
  }

  /// Packs the storage as of `time`, in seconds since the Unix epoch. Without `wait`, returns immediately and failures are only logged.
  pub async fn pack(&self, time: f64, wait: bool) -> SessionResult<()> {
    let storage = self.registered()?;
    if self.read_only {
      return Err(SessionError::ReadOnly);
    };
    if !time.is_finite() {
      return Err(SessionError::InvalidArgument(format!("pack time {time}")));
    };
    let secs = time.floor();
    let nanos = ((time - secs) * 1e9) as u32;
    let reference_time = Utc
      .timestamp_opt(secs as i64, nanos)
      .single()
      .ok_or_else(|| SessionError::InvalidArgument(format!("pack time {time}")))?;
    let session = self.id;
    let task = tokio::spawn(async move {
      let res = storage
        .storage
        .pack(OpPackInput {
          reference_time,
          gc: true,
        })
        .await;
      if let Err(err) = &res {
        if !wait {
          error!(storage = %storage.name, session, error = %err, "pack failed");
        };
      };
      res
    });
    if !wait {
      return Ok(());
    };
    task
      .await
      .map_err(|err| SessionError::Internal(err.to_string()))??;
    Ok(())
  }

  /// Leaves the wait queue, aborts whatever is in flight and unregisters. Calling this again does nothing.
  pub async fn disconnect(&mut self) {
    if self.disconnected {
      return;
    };
    self.disconnected = true;
    let Some(storage) = self.storage.clone() else {
      return;
    };
    if let Some(t) = &self.txn {
      info!(
        session = self.id,
        label = %self.label,
        phase = %t.phase,
        "disconnected during transaction"
      );
      self.abort_current(&storage).await;
    };
    if let Some(mut task) = self.undoing.take() {
      if let Err(err) = join(&mut task).await {
        debug!(session = self.id, error = %err, "undo failed");
      };
    };
    storage.commit_lock.cancel_wait(self.id);
    self.release_commit_lock(&storage);
    if self.verifying {
      self.verifying = false;
      StorageStats::decrement(&storage.stats.verifying_clients);
    };
    storage.unregister(self.id);
    StorageStats::decrement(&storage.stats.clients);
    info!(session = self.id, label = %self.label, "disconnected");
  }

  async fn acquire_commit_lock(&mut self, storage: &ServedStorage) -> SessionResult<()> {
    match storage.commit_lock.request(self.id) {
      LockRequest::Granted => {}
      LockRequest::Closed => return Err(SessionError::ServerClosing),
      LockRequest::Queued { granted, waiting } => {
        info!(
          storage = %storage.name,
          session = self.id,
          "Transaction blocked waiting for storage. Clients waiting: {waiting}"
        );
        if let Some(t) = self.txn.as_mut() {
          t.phase = TxnPhase::Waiting;
        };
        if granted.await.is_err() {
          return Err(SessionError::ServerClosing);
        };
      }
    };
    storage.stats.lock_acquired();
    storage.watchdog.begin(self.id, self.client.clone());
    Ok(())
  }

  fn release_commit_lock(&self, storage: &ServedStorage) {
    storage.watchdog.end(self.id);
    if storage.commit_lock.is_held_by(self.id) {
      storage.stats.lock_released();
      storage.commit_lock.release(self.id);
    };
  }

  /// Waits for the replay started by `tpc_vote`. On failure the transaction is left `Locked` for the caller to abort.
  async fn settle_vote(&mut self) -> SessionResult<()> {
    let Some(task) = self.txn.as_mut().and_then(|t| t.voting.as_mut()) else {
      return Err(SessionError::Internal("no vote in progress".into()));
    };
    let res = join(task).await;
    let Some(t) = self.txn.as_mut() else {
      return res.map(|_| ());
    };
    t.voting = None;
    t.stored = res?;
    t.phase = TxnPhase::Voted;
    Ok(())
  }

  /// Waits for a commit started by `tpc_finish`. On success the transaction is done and the commit lock released; on failure the transaction is left `Voted` for the caller to abort.
  async fn settle_finish(&mut self, storage: &ServedStorage) -> SessionResult<Tid> {
    let Some(task) = self.txn.as_mut().and_then(|t| t.finishing.as_mut()) else {
      return Err(SessionError::Internal("no commit in progress".into()));
    };
    let res = join(task).await;
    match res {
      Ok(_) => {
        self.txn = None;
        storage.stats.commits.fetch_add(1, Relaxed);
        StorageStats::decrement(&storage.stats.active_txns);
        self.release_commit_lock(storage);
      }
      Err(_) => {
        if let Some(t) = self.txn.as_mut() {
          t.finishing = None;
          t.phase = TxnPhase::Voted;
        };
      }
    };
    res
  }

  /// Aborts the current transaction in whatever phase it is and releases the commit lock. A commit already running is allowed to finish instead.
  async fn abort_current(&mut self, storage: &ServedStorage) {
    if self.phase() == Some(TxnPhase::Finishing) && self.settle_finish(storage).await.is_ok() {
      return;
    };
    if let Some(task) = self.txn.as_mut().and_then(|t| t.voting.as_mut()) {
      // The abort below must come after every write of an interrupted replay.
      let _ = join(task).await;
    };
    let Some(t) = self.txn.take() else {
      return;
    };
    match t.phase {
      TxnPhase::Begun => {}
      TxnPhase::Waiting => storage.commit_lock.cancel_wait(self.id),
      TxnPhase::Locked | TxnPhase::Voted | TxnPhase::Finishing => {
        // On failure the storage finishes the abort before its next transaction.
        if let Err(err) = storage.storage.tpc_abort(OpTpcAbortInput { txn: t.txn }).await {
          error!(session = self.id, id = t.id, error = %err, "failed to abort transaction");
        };
      }
    };
    storage.stats.aborts.fetch_add(1, Relaxed);
    StorageStats::decrement(&storage.stats.active_txns);
    self.release_commit_lock(storage);
  }
}

async fn join<T>(task: &mut JoinHandle<SessionResult<T>>) -> SessionResult<T> {
  task
    .await
    .map_err(|err| SessionError::Internal(err.to_string()))?
}

/// Commits the voted transaction and notifies the other sessions while the commit lock is still held.
async fn commit_and_invalidate(
  storage: Arc<ServedStorage>,
  session: SessionId,
  txn: Transaction,
  oids: Vec<Oid>,
) -> SessionResult<Tid> {
  let tid = storage.storage.tpc_finish(OpTpcFinishInput { txn }).await?.tid;
  if !oids.is_empty() {
    storage.invalidate(session, Some(tid), tid, &oids);
  };
  Ok(tid)
}

async fn undo_and_invalidate(
  storage: Arc<ServedStorage>,
  session: SessionId,
  txn: Transaction,
  trans_tid: Tid,
) -> SessionResult<Vec<Oid>> {
  match run_undo(&storage, txn.clone(), trans_tid).await {
    Ok((tid, oids)) => {
      if !oids.is_empty() {
        // Clients learn about undone transactions without a tid; the queue still needs the real one.
        storage.invalidate(session, None, tid, &oids);
      };
      storage.stats.commits.fetch_add(1, Relaxed);
      Ok(oids)
    }
    Err(err) => {
      if let Err(abort_err) = storage.storage.tpc_abort(OpTpcAbortInput { txn }).await {
        error!(session, error = %abort_err, "failed to abort undo");
      };
      storage.stats.aborts.fetch_add(1, Relaxed);
      Err(err)
    }
  }
}

/// Writes the buffered stores into the storage and votes, returning the oids stored. Every store is attempted and reported to the client before the first failure is returned.
async fn replay_and_vote(
  storage: Arc<ServedStorage>,
  client: Arc<dyn ClientStub>,
  txn: Transaction,
  requested_tid: Option<Tid>,
  buffer: Vec<BufferedStore>,
) -> SessionResult<BTreeSet<Oid>> {
  storage
    .storage
    .tpc_begin(OpTpcBeginInput {
      txn: txn.clone(),
      tid: requested_tid,
      status: Some(txn.status),
    })
    .await?;

  let mut stored = BTreeSet::new();
  let mut serials = Vec::with_capacity(buffer.len());
  let mut first_failure = None;
  for s in buffer {
    let oid = s.oid;
    let res = storage
      .storage
      .store(OpStoreInput {
        oid,
        serial: s.serial,
        data: s.data,
        refs: s.refs,
        version: s.version,
        txn: txn.clone(),
      })
      .await;
    match res {
      Ok(out) => {
        storage.stats.stores.fetch_add(1, Relaxed);
        if out.outcome == StoreOutcome::ResolvedSerial {
          storage.stats.conflicts.fetch_add(1, Relaxed);
          storage.stats.conflicts_resolved.fetch_add(1, Relaxed);
        };
        stored.insert(oid);
        serials.push((oid, SerialOutcome::Stored(out.outcome)));
      }
      Err(err @ (OpError::Conflict { .. } | OpError::VersionsNotSupported)) => {
        if matches!(err, OpError::Conflict { .. }) {
          storage.stats.conflicts.fetch_add(1, Relaxed);
        };
        serials.push((oid, SerialOutcome::Failed(WireError::from(&err))));
        first_failure.get_or_insert(err);
      }
      Err(err) => return Err(err.into()),
    };
  }
  client.serialnos(&serials);

  storage.storage.tpc_vote(OpTpcVoteInput { txn }).await?;
  match first_failure {
    Some(err) => Err(err.into()),
    None => Ok(stored),
  }
}

async fn run_undo(
  storage: &ServedStorage,
  txn: Transaction,
  trans_tid: Tid,
) -> SessionResult<(Tid, Vec<Oid>)> {
  storage
    .storage
    .tpc_begin(OpTpcBeginInput {
      txn: txn.clone(),
      tid: None,
      status: None,
    })
    .await?;
  let undone = storage
    .storage
    .undo(OpUndoInput {
      txn: txn.clone(),
      undo_tid: trans_tid,
    })
    .await?;
  storage
    .storage
    .tpc_vote(OpTpcVoteInput { txn: txn.clone() })
    .await?;
  let finished = storage.storage.tpc_finish(OpTpcFinishInput { txn }).await?;
  Ok((finished.tid, undone.oids))
}
