use crate::byte_store::memory::MemoryByteStore;
use crate::byte_store::ByteStore;
use crate::byte_store::WriteBatch;
use crate::conflict::Conflict;
use crate::conflict::ConflictResolver;
use crate::id::Oid;
use crate::id::Tid;
use crate::id::Transaction;
use crate::keys::revision_range;
use crate::op::checkpoint::OpCheckpointInput;
use crate::op::load::OpGetSerialInput;
use crate::op::load::OpLoadInput;
use crate::op::load::OpLoadSerialInput;
use crate::op::pack::OpPackInput;
use crate::op::store::OpStoreInput;
use crate::op::store::StoreOutcome;
use crate::op::tpc_abort::OpTpcAbortInput;
use crate::op::tpc_begin::OpTpcBeginInput;
use crate::op::tpc_finish::OpTpcFinishInput;
use crate::op::tpc_vote::OpTpcVoteInput;
use crate::op::undo::OpUndoInput;
use crate::op::undo_log::OpUndoLogInput;
use crate::op::undo_log::UndoSpecification;
use crate::op::OpError;
use crate::op::OpResult;
use crate::op::OpenError;
use crate::Storage;
use crate::StorageCfg;
use crate::StorageLoader;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::error::Error;
use std::io;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use std::time::Duration;
use tracing_test::traced_test;

/// Fails the next commit when asked to.
#[derive(Default)]
struct FlakyByteStore {
  inner: MemoryByteStore,
  fail_next_commit: AtomicBool,
}

#[async_trait]
impl ByteStore for FlakyByteStore {
  fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
    self.inner.get(key)
  }

  fn range(&self, start: &[u8], end: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
    self.inner.range(start, end)
  }

  fn last_in_range(&self, start: &[u8], end: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
    self.inner.last_in_range(start, end)
  }

  async fn commit(&self, batch: WriteBatch) -> io::Result<()> {
    if self.fail_next_commit.swap(false, Relaxed) {
      return Err(io::Error::new(io::ErrorKind::Other, "disk unavailable"));
    };
    self.inner.commit(batch).await
  }

  async fn checkpoint(&self, min_log_bytes: u64, force: bool) -> io::Result<bool> {
    self.inner.checkpoint(min_log_bytes, force).await
  }

  async fn close(&self) -> io::Result<()> {
    self.inner.close().await
  }
}

fn cfg() -> StorageCfg {
  let mut cfg = StorageCfg::new("test", "/nonexistent");
  cfg.checkpoint_interval = None;
  cfg
}

async fn open_on(store: Arc<MemoryByteStore>) -> Storage {
  StorageLoader::with_byte_store(cfg(), store)
    .load_and_start()
    .await
    .unwrap()
}

async fn open_memory() -> (Storage, Arc<MemoryByteStore>) {
  let store = Arc::new(MemoryByteStore::new());
  (open_on(store.clone()).await, store)
}

async fn begin(storage: &Storage) -> (Transaction, Tid) {
  let txn = Transaction::new("alice", "test", Vec::new());
  let tid = storage
    .tpc_begin(OpTpcBeginInput {
      txn: txn.clone(),
      tid: None,
      status: None,
    })
    .await
    .unwrap()
    .tid;
  (txn, tid)
}

async fn store(
  storage: &Storage,
  txn: &Transaction,
  oid: Oid,
  serial: Tid,
  data: &[u8],
  refs: Vec<Oid>,
) -> OpResult<StoreOutcome> {
  storage
    .store(OpStoreInput {
      oid,
      serial,
      data: data.to_vec(),
      refs,
      version: String::new(),
      txn: txn.clone(),
    })
    .await
    .map(|o| o.outcome)
}

async fn finish(storage: &Storage, txn: &Transaction) -> Tid {
  storage
    .tpc_vote(OpTpcVoteInput { txn: txn.clone() })
    .await
    .unwrap();
  storage
    .tpc_finish(OpTpcFinishInput { txn: txn.clone() })
    .await
    .unwrap()
    .tid
}

/// Commits one transaction writing `objects` and returns its tid.
async fn commit(storage: &Storage, objects: &[(Oid, Tid, &str, Vec<Oid>)]) -> Tid {
  let (txn, _) = begin(storage).await;
  for (oid, serial, data, refs) in objects {
    store(storage, &txn, *oid, *serial, data.as_bytes(), refs.clone())
      .await
      .unwrap();
  }
  finish(storage, &txn).await
}

fn file_cfg(dir: &tempfile::TempDir) -> StorageCfg {
  let mut cfg = StorageCfg::new("1", dir.path().join("env"));
  cfg.checkpoint_interval = None;
  cfg
}

async fn load(storage: &Storage, oid: Oid) -> OpResult<(Vec<u8>, Tid)> {
  storage
    .load(OpLoadInput { oid })
    .await
    .map(|o| (o.data, o.serial))
}

#[traced_test]
#[tokio::test]
async fn test_store_commit_load_round_trip() {
  let (storage, _) = open_memory().await;
  assert_eq!(storage.last_transaction(), Tid::ZERO);
  assert!(matches!(load(&storage, Oid(1)).await, Err(OpError::ObjectNotFound)));

  let (txn, tid) = begin(&storage).await;
  let outcome = store(&storage, &txn, Oid(1), Tid::ZERO, b"hello", vec![])
    .await
    .unwrap();
  assert_eq!(outcome, StoreOutcome::Serial(tid));
  // Not visible before commit.
  assert!(matches!(load(&storage, Oid(1)).await, Err(OpError::ObjectNotFound)));
  assert_eq!(finish(&storage, &txn).await, tid);

  assert_eq!(load(&storage, Oid(1)).await.unwrap(), (b"hello".to_vec(), tid));
  assert_eq!(storage.last_transaction(), tid);
  assert_eq!(storage.metrics().commit_count(), 1);
  assert_eq!(storage.metrics().store_count(), 1);
}

#[traced_test]
#[tokio::test]
async fn test_tids_are_monotonic() {
  let (storage, _) = open_memory().await;
  let mut last = Tid::ZERO;
  for i in 0..5u64 {
    let txn = Transaction::new("", "", Vec::new());
    // Supplied tids from the past must still move forward.
    let supplied = if i % 2 == 0 { Some(Tid(7)) } else { None };
    let tid = storage
      .tpc_begin(OpTpcBeginInput {
        txn: txn.clone(),
        tid: supplied,
        status: None,
      })
      .await
      .unwrap()
      .tid;
    assert!(tid > last);
    assert!(tid > storage.last_transaction());
    let committed = finish(&storage, &txn).await;
    assert_eq!(committed, tid);
    last = committed;
  }
}

#[traced_test]
#[tokio::test]
async fn test_one_transaction_at_a_time() {
  let (storage, _) = open_memory().await;
  let (txn, tid) = begin(&storage).await;

  // Same transaction again is a no-op.
  let again = storage
    .tpc_begin(OpTpcBeginInput {
      txn: txn.clone(),
      tid: None,
      status: None,
    })
    .await
    .unwrap();
  assert_eq!(again.tid, tid);

  let other = Transaction::new("bob", "", Vec::new());
  let res = storage
    .tpc_begin(OpTpcBeginInput {
      txn: other.clone(),
      tid: None,
      status: None,
    })
    .await;
  assert!(matches!(res, Err(OpError::TransactionInProgress)));
  assert!(matches!(
    store(&storage, &other, Oid(1), Tid::ZERO, b"x", vec![]).await,
    Err(OpError::NotCurrentTransaction)
  ));
  assert!(matches!(
    storage.tpc_vote(OpTpcVoteInput { txn: other.clone() }).await,
    Err(OpError::NotCurrentTransaction)
  ));
  assert!(matches!(
    storage
      .tpc_finish(OpTpcFinishInput { txn: other.clone() })
      .await,
    Err(OpError::NotCurrentTransaction)
  ));
  // Aborting someone else's transaction does nothing.
  storage
    .tpc_abort(OpTpcAbortInput { txn: other })
    .await
    .unwrap();
  finish(&storage, &txn).await;
}

#[traced_test]
#[tokio::test]
async fn test_abort_discards_and_is_idempotent() {
  let (storage, memory) = open_memory().await;
  let first = commit(&storage, &[(Oid(1), Tid::ZERO, "v1", vec![])]).await;

  let (txn, tid) = begin(&storage).await;
  store(&storage, &txn, Oid(1), first, b"v2", vec![])
    .await
    .unwrap();
  store(&storage, &txn, Oid(2), Tid::ZERO, b"new", vec![])
    .await
    .unwrap();
  for _ in 0..3 {
    storage
      .tpc_abort(OpTpcAbortInput { txn: txn.clone() })
      .await
      .unwrap();
  }
  assert_eq!(load(&storage, Oid(1)).await.unwrap(), (b"v1".to_vec(), first));
  assert!(matches!(load(&storage, Oid(2)).await, Err(OpError::ObjectNotFound)));
  let (start, end) = revision_range(Oid(2));
  assert!(memory.range(&start, &end).is_empty());
  assert!(storage.last_transaction() < tid);
  assert_eq!(storage.metrics().abort_count(), 1);

  // The storage is free again.
  let next = commit(&storage, &[(Oid(1), first, "v3", vec![])]).await;
  assert!(next > first);
}

#[traced_test]
#[tokio::test]
async fn test_conflict_without_resolver() {
  let (storage, _) = open_memory().await;
  let first = commit(&storage, &[(Oid(1), Tid::ZERO, "v1", vec![])]).await;
  let second = commit(&storage, &[(Oid(1), first, "v2", vec![])]).await;

  let (txn, _) = begin(&storage).await;
  let res = store(&storage, &txn, Oid(1), first, b"stale", vec![]).await;
  match res {
    Err(OpError::Conflict {
      oid,
      committed,
      expected,
    }) => {
      assert_eq!(oid, Oid(1));
      assert_eq!(committed, second);
      assert_eq!(expected, first);
    }
    _ => panic!("expected conflict"),
  };
  // Later stores still work but the vote reports the first conflict.
  store(&storage, &txn, Oid(2), Tid::ZERO, b"ok", vec![])
    .await
    .unwrap();
  assert!(matches!(
    storage.tpc_vote(OpTpcVoteInput { txn: txn.clone() }).await,
    Err(OpError::Conflict { oid: Oid(1), .. })
  ));
  storage
    .tpc_abort(OpTpcAbortInput { txn })
    .await
    .unwrap();
  assert_eq!(load(&storage, Oid(1)).await.unwrap(), (b"v2".to_vec(), second));
  assert_eq!(storage.metrics().conflict_count(), 1);
}

#[derive(Default)]
struct ConcatResolver {
  calls: Mutex<Vec<(Oid, Tid, Tid, Option<Vec<u8>>)>>,
}

impl ConflictResolver for ConcatResolver {
  fn resolve(&self, conflict: &Conflict<'_>) -> Result<Vec<u8>, Box<dyn Error + Send + Sync>> {
    self.calls.lock().push((
      conflict.oid,
      conflict.committed_serial,
      conflict.old_serial,
      conflict.old_data.map(|d| d.to_vec()),
    ));
    if conflict.new_data == b"unresolvable" {
      return Err("cannot merge".into());
    };
    let mut merged = conflict.committed_data.to_vec();
    merged.extend_from_slice(b"+");
    merged.extend_from_slice(conflict.new_data);
    Ok(merged)
  }
}

#[traced_test]
#[tokio::test]
async fn test_conflict_with_resolver() {
  let resolver = Arc::new(ConcatResolver::default());
  let storage = StorageLoader::with_byte_store(cfg(), Arc::new(MemoryByteStore::new()))
    .conflict_resolver(resolver.clone())
    .load_and_start()
    .await
    .unwrap();
  let first = commit(&storage, &[(Oid(1), Tid::ZERO, "a", vec![])]).await;
  let second = commit(&storage, &[(Oid(1), first, "b", vec![])]).await;

  let (txn, _) = begin(&storage).await;
  let outcome = store(&storage, &txn, Oid(1), first, b"c", vec![])
    .await
    .unwrap();
  assert_eq!(outcome, StoreOutcome::ResolvedSerial);
  let third = finish(&storage, &txn).await;
  assert_eq!(load(&storage, Oid(1)).await.unwrap(), (b"b+c".to_vec(), third));
  assert_eq!(resolver.calls.lock().clone(), vec![(
    Oid(1),
    second,
    first,
    Some(b"a".to_vec())
  )]);
  assert_eq!(storage.metrics().conflict_resolved_count(), 1);

  let (txn, _) = begin(&storage).await;
  let res = store(&storage, &txn, Oid(1), first, b"unresolvable", vec![]).await;
  assert!(matches!(res, Err(OpError::Conflict { .. })));
  // Called exactly once per conflicting store.
  assert_eq!(resolver.calls.lock().len(), 2);
  storage
    .tpc_abort(OpTpcAbortInput { txn })
    .await
    .unwrap();
}

#[traced_test]
#[tokio::test]
async fn test_versions_are_rejected() {
  let (storage, _) = open_memory().await;
  let (txn, _) = begin(&storage).await;
  let res = storage
    .store(OpStoreInput {
      oid: Oid(1),
      serial: Tid::ZERO,
      data: b"x".to_vec(),
      refs: Vec::new(),
      version: "draft".to_string(),
      txn: txn.clone(),
    })
    .await;
  assert!(matches!(res, Err(OpError::VersionsNotSupported)));
  storage
    .tpc_abort(OpTpcAbortInput { txn })
    .await
    .unwrap();
}

#[traced_test]
#[tokio::test]
async fn test_read_only_storage() {
  let memory = Arc::new(MemoryByteStore::new());
  let writer = open_on(memory.clone()).await;
  let tid = commit(&writer, &[(Oid(1), Tid::ZERO, "v", vec![])]).await;
  writer.close().await.unwrap();

  let mut ro_cfg = cfg();
  ro_cfg.read_only = true;
  let storage = StorageLoader::with_byte_store(ro_cfg, memory)
    .load_and_start()
    .await
    .unwrap();
  assert!(storage.is_read_only());
  assert_eq!(load(&storage, Oid(1)).await.unwrap(), (b"v".to_vec(), tid));
  assert!(matches!(storage.new_object_id(), Err(OpError::ReadOnly)));
  let res = storage
    .tpc_begin(OpTpcBeginInput {
      txn: Transaction::new("", "", Vec::new()),
      tid: None,
      status: None,
    })
    .await;
  assert!(matches!(res, Err(OpError::ReadOnly)));
  let res = storage
    .pack(OpPackInput {
      reference_time: Utc::now(),
      gc: true,
    })
    .await;
  assert!(matches!(res, Err(OpError::ReadOnly)));
}

#[traced_test]
#[tokio::test]
async fn test_load_serial_and_get_serial() {
  let (storage, _) = open_memory().await;
  let first = commit(&storage, &[(Oid(4), Tid::ZERO, "one", vec![])]).await;
  let second = commit(&storage, &[(Oid(4), first, "two", vec![])]).await;

  let old = storage
    .load_serial(OpLoadSerialInput {
      oid: Oid(4),
      serial: first,
    })
    .await
    .unwrap();
  assert_eq!(old.data, b"one".to_vec());
  let serial = storage
    .get_serial(OpGetSerialInput { oid: Oid(4) })
    .await
    .unwrap()
    .serial;
  assert_eq!(serial, second);
  assert!(matches!(
    storage.get_serial(OpGetSerialInput { oid: Oid(5) }).await,
    Err(OpError::ObjectNotFound)
  ));
  assert!(matches!(
    storage
      .load_serial(OpLoadSerialInput {
        oid: Oid(4),
        serial: Tid(12345),
      })
      .await,
    Err(OpError::ObjectNotFound)
  ));
}

#[traced_test]
#[tokio::test]
async fn test_new_object_ids() {
  let (storage, memory) = open_memory().await;
  assert_eq!(storage.new_object_id().unwrap(), Oid(1));
  assert_eq!(storage.new_object_id().unwrap(), Oid(2));
  commit(&storage, &[
    (Oid::ROOT, Tid::ZERO, "root", vec![Oid(41)]),
    (Oid(41), Tid::ZERO, "leaf", vec![]),
  ])
  .await;
  storage.close().await.unwrap();

  // Reopening starts after the highest stored oid.
  let storage = open_on(memory).await;
  assert_eq!(storage.new_object_id().unwrap(), Oid(42));
}

#[traced_test]
#[tokio::test]
async fn test_undo() {
  let (storage, _) = open_memory().await;
  let first = commit(&storage, &[(Oid(1), Tid::ZERO, "v1", vec![])]).await;
  let second = commit(&storage, &[
    (Oid(1), first, "v2", vec![]),
    (Oid(2), Tid::ZERO, "created", vec![]),
  ])
  .await;

  let (txn, tid) = begin(&storage).await;
  let undone = storage
    .undo(OpUndoInput {
      txn: txn.clone(),
      undo_tid: second,
    })
    .await
    .unwrap();
  let mut oids = undone.oids.clone();
  oids.sort();
  assert_eq!(oids, vec![Oid(1), Oid(2)]);
  assert_eq!(undone.tid, tid);
  let committed = finish(&storage, &txn).await;

  assert_eq!(load(&storage, Oid(1)).await.unwrap(), (b"v1".to_vec(), committed));
  assert!(matches!(load(&storage, Oid(2)).await, Err(OpError::ObjectNotFound)));

  // `first` is no longer the current revision of object 1.
  let (txn, _) = begin(&storage).await;
  let res = storage
    .undo(OpUndoInput {
      txn: txn.clone(),
      undo_tid: first,
    })
    .await;
  assert!(matches!(res, Err(OpError::UndoConflict(Oid(1)))));
  let res = storage
    .undo(OpUndoInput {
      txn: txn.clone(),
      undo_tid: Tid(12345),
    })
    .await;
  assert!(matches!(res, Err(OpError::UndoNotFound)));
  storage
    .tpc_abort(OpTpcAbortInput { txn })
    .await
    .unwrap();
  assert_eq!(storage.metrics().undo_count(), 1);
}

#[traced_test]
#[tokio::test]
async fn test_undo_log() {
  let (storage, _) = open_memory().await;
  let mut tids = Vec::new();
  for i in 0..6u64 {
    let user = if i % 2 == 0 { "alice" } else { "bob" };
    let txn = Transaction::new(user, format!("txn {i}"), Vec::new());
    storage
      .tpc_begin(OpTpcBeginInput {
        txn: txn.clone(),
        tid: None,
        status: None,
      })
      .await
      .unwrap();
    store(&storage, &txn, Oid(i + 1), Tid::ZERO, b"x", vec![])
      .await
      .unwrap();
    tids.push(finish(&storage, &txn).await);
  }

  let all = storage
    .undo_log(OpUndoLogInput {
      first: 0,
      last: -20,
      filter: None,
    })
    .await
    .unwrap()
    .transactions;
  assert_eq!(
    all.iter().map(|d| d.tid).collect::<Vec<_>>(),
    tids.iter().rev().copied().collect::<Vec<_>>()
  );

  let page = storage
    .undo_log(OpUndoLogInput {
      first: 1,
      last: -2,
      filter: None,
    })
    .await
    .unwrap()
    .transactions;
  assert_eq!(page.iter().map(|d| d.tid).collect::<Vec<_>>(), vec![
    tids[4], tids[3]
  ]);

  let bounded = storage
    .undo_log(OpUndoLogInput {
      first: 0,
      last: 2,
      filter: None,
    })
    .await
    .unwrap()
    .transactions;
  assert_eq!(bounded.len(), 2);

  let bobs = storage
    .undo_info(
      0,
      -20,
      Some(UndoSpecification {
        user: Some("bob".to_string()),
        description: None,
      }),
    )
    .await
    .unwrap()
    .transactions;
  assert_eq!(bobs.len(), 3);
  assert!(bobs.iter().all(|d| d.user == "bob"));
  assert_eq!(bobs[0].description, "txn 5");
}

#[traced_test]
#[tokio::test]
async fn test_pack_and_gc() {
  let (storage, memory) = open_memory().await;
  let t1 = commit(&storage, &[
    (Oid::ROOT, Tid::ZERO, "root1", vec![Oid(1), Oid(2)]),
    (Oid(1), Tid::ZERO, "a1", vec![]),
    (Oid(2), Tid::ZERO, "b1", vec![]),
  ])
  .await;
  // Object 2 becomes unreachable.
  let t2 = commit(&storage, &[
    (Oid::ROOT, t1, "root2", vec![Oid(1)]),
    (Oid(1), t1, "a2", vec![]),
  ])
  .await;

  let out = storage
    .pack(OpPackInput {
      reference_time: Utc::now() + chrono::Duration::days(1),
      gc: false,
    })
    .await
    .unwrap();
  assert_eq!(out.pack_tid, t2);
  assert_eq!(out.removed_revisions, 2);
  assert_eq!(out.removed_objects, 0);
  assert!(matches!(
    storage
      .load_serial(OpLoadSerialInput {
        oid: Oid(1),
        serial: t1,
      })
      .await,
    Err(OpError::ObjectNotFound)
  ));
  assert_eq!(load(&storage, Oid(2)).await.unwrap().0, b"b1".to_vec());
  // Packed transactions can no longer be undone.
  let (txn, _) = begin(&storage).await;
  assert!(matches!(
    storage
      .undo(OpUndoInput {
        txn: txn.clone(),
        undo_tid: t2,
      })
      .await,
    Err(OpError::UndoNotFound)
  ));
  storage
    .tpc_abort(OpTpcAbortInput { txn })
    .await
    .unwrap();

  let out = storage
    .pack(OpPackInput {
      reference_time: Utc::now() + chrono::Duration::days(1),
      gc: true,
    })
    .await
    .unwrap();
  assert_eq!(out.removed_objects, 1);
  assert!(matches!(load(&storage, Oid(2)).await, Err(OpError::ObjectNotFound)));
  let (start, end) = revision_range(Oid(2));
  assert!(memory.range(&start, &end).is_empty());
  assert_eq!(load(&storage, Oid(1)).await.unwrap().0, b"a2".to_vec());
  assert_eq!(load(&storage, Oid::ROOT).await.unwrap().0, b"root2".to_vec());
  assert_eq!(storage.metrics().pack_count(), 2);
}

#[traced_test]
#[tokio::test]
async fn test_pack_keeps_history_after_reference_time() {
  let (storage, _) = open_memory().await;
  let t1 = commit(&storage, &[(Oid::ROOT, Tid::ZERO, "r1", vec![])]).await;
  let t2 = commit(&storage, &[(Oid::ROOT, t1, "r2", vec![])]).await;
  let out = storage
    .pack(OpPackInput {
      reference_time: Utc::now() - chrono::Duration::days(365),
      gc: true,
    })
    .await
    .unwrap();
  assert_eq!(out.removed_revisions, 0);
  let old = storage
    .load_serial(OpLoadSerialInput {
      oid: Oid::ROOT,
      serial: t1,
    })
    .await
    .unwrap();
  assert_eq!(old.data, b"r1".to_vec());
  assert_eq!(load(&storage, Oid::ROOT).await.unwrap().1, t2);
}

#[traced_test]
#[tokio::test]
async fn test_pending_transaction_is_aborted_on_open() {
  let memory = Arc::new(MemoryByteStore::new());
  let storage = open_on(memory.clone()).await;
  let first = commit(&storage, &[(Oid(1), Tid::ZERO, "kept", vec![])]).await;
  let (txn, _) = begin(&storage).await;
  store(&storage, &txn, Oid(1), first, b"lost", vec![])
    .await
    .unwrap();
  store(&storage, &txn, Oid(9), Tid::ZERO, b"lost", vec![])
    .await
    .unwrap();
  // Simulate a crash: the first handle is abandoned mid-transaction.
  drop(storage);

  let storage = open_on(memory.clone()).await;
  assert!(logs_contain("aborted transaction left pending"));
  assert_eq!(load(&storage, Oid(1)).await.unwrap(), (b"kept".to_vec(), first));
  let (start, end) = revision_range(Oid(9));
  assert!(memory.range(&start, &end).is_empty());
  assert_eq!(storage.new_object_id().unwrap(), Oid(2));
  let next = commit(&storage, &[(Oid(1), first, "again", vec![])]).await;
  assert!(next > first);
}

#[traced_test]
#[tokio::test]
async fn test_incompatible_schema_version() {
  let memory = Arc::new(MemoryByteStore::new());
  let mut batch = crate::byte_store::WriteBatch::new();
  batch.put(crate::keys::info_key("version"), b"ZD99".to_vec());
  memory.commit(batch).await.unwrap();
  let res = StorageLoader::with_byte_store(cfg(), memory)
    .load_and_start()
    .await;
  assert!(matches!(res, Err(OpenError::IncompatibleVersion(v)) if v == b"ZD99".to_vec()));
}

#[traced_test]
#[tokio::test]
async fn test_file_storage_survives_reopen() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("env");
  let mut file_cfg = StorageCfg::new("1", &path);
  file_cfg.checkpoint_interval = None;

  let storage = StorageLoader::new(file_cfg.clone())
    .load_and_start()
    .await
    .unwrap();
  let t1 = commit(&storage, &[(Oid(3), Tid::ZERO, "persisted", vec![])]).await;

  // The environment is locked while open.
  let res = StorageLoader::new(file_cfg.clone()).load_and_start().await;
  assert!(matches!(res, Err(OpenError::Locked(_))));

  storage.close().await.unwrap();
  storage.close().await.unwrap();
  assert!(storage.metrics().checkpoint_count() >= 1);
  assert!(path.join("snapshot").exists());

  let storage = StorageLoader::new(file_cfg).load_and_start().await.unwrap();
  assert_eq!(load(&storage, Oid(3)).await.unwrap(), (b"persisted".to_vec(), t1));
  assert_eq!(storage.last_transaction(), t1);
  assert_eq!(storage.new_object_id().unwrap(), Oid(4));
  let t2 = commit(&storage, &[(Oid(3), t1, "updated", vec![])]).await;
  assert!(t2 > t1);
  storage.close().await.unwrap();
}

#[traced_test]
#[tokio::test]
async fn test_missing_parent_directory_fails() {
  let dir = tempfile::tempdir().unwrap();
  let mut file_cfg = StorageCfg::new("1", dir.path().join("missing").join("env"));
  file_cfg.checkpoint_interval = None;
  let res = StorageLoader::new(file_cfg).load_and_start().await;
  assert!(matches!(res, Err(OpenError::Io(_))));
}

#[traced_test]
#[tokio::test]
async fn test_checkpoint_respects_min_log_bytes() {
  let dir = tempfile::tempdir().unwrap();
  let mut file_cfg = StorageCfg::new("1", dir.path().join("env"));
  file_cfg.checkpoint_interval = None;
  file_cfg.checkpoint_min_log_bytes = 1 << 30;
  let storage = StorageLoader::new(file_cfg).load_and_start().await.unwrap();
  commit(&storage, &[(Oid(1), Tid::ZERO, "x", vec![])]).await;

  let out = storage
    .checkpoint(OpCheckpointInput { force: false })
    .await
    .unwrap();
  assert!(!out.checkpointed);
  let out = storage
    .checkpoint(OpCheckpointInput { force: true })
    .await
    .unwrap();
  assert!(out.checkpointed);
  storage.close().await.unwrap();
}

#[traced_test]
#[tokio::test]
async fn test_background_workers_run_and_stop() {
  let dir = tempfile::tempdir().unwrap();
  let mut file_cfg = StorageCfg::new("1", dir.path().join("env"));
  file_cfg.checkpoint_interval = Some(Duration::from_millis(20));
  file_cfg.autopack_frequency = Some(Duration::from_millis(20));
  file_cfg.autopack_window = Duration::from_secs(0);
  file_cfg.autopack_gc_every = 1;
  let storage = StorageLoader::new(file_cfg).load_and_start().await.unwrap();
  commit(&storage, &[(Oid::ROOT, Tid::ZERO, "root", vec![])]).await;

  tokio::time::sleep(Duration::from_millis(200)).await;
  assert!(storage.metrics().pack_count() >= 1);
  assert!(storage.metrics().checkpoint_count() >= 1);

  storage.close().await.unwrap();
  assert!(matches!(
    storage
      .tpc_begin(OpTpcBeginInput {
        txn: Transaction::new("", "", Vec::new()),
        tid: None,
        status: None,
      })
      .await,
    Err(OpError::Closed)
  ));
}

#[traced_test]
#[tokio::test]
async fn test_dropped_store_is_still_discarded_by_abort() {
  let dir = tempfile::tempdir().unwrap();
  let storage = StorageLoader::new(file_cfg(&dir))
    .load_and_start()
    .await
    .unwrap();
  let (txn, _) = begin(&storage).await;
  tokio::select! {
    biased;
    _ = store(&storage, &txn, Oid(7), Tid::ZERO, b"aborted", vec![]) => {}
    _ = async {} => {}
  };
  storage
    .tpc_abort(OpTpcAbortInput { txn })
    .await
    .unwrap();
  assert!(matches!(load(&storage, Oid(7)).await, Err(OpError::ObjectNotFound)));

  // A later commit moves the last tid past the aborted one.
  commit(&storage, &[(Oid(8), Tid::ZERO, "unrelated", vec![])]).await;
  assert!(matches!(load(&storage, Oid(7)).await, Err(OpError::ObjectNotFound)));
  storage.close().await.unwrap();
}

#[traced_test]
#[tokio::test]
async fn test_dropped_finish_still_commits_everything() {
  let dir = tempfile::tempdir().unwrap();
  let storage = StorageLoader::new(file_cfg(&dir))
    .load_and_start()
    .await
    .unwrap();
  let (txn, tid) = begin(&storage).await;
  store(&storage, &txn, Oid(7), Tid::ZERO, b"committed", vec![])
    .await
    .unwrap();
  storage
    .tpc_vote(OpTpcVoteInput { txn: txn.clone() })
    .await
    .unwrap();
  tokio::select! {
    biased;
    _ = storage.tpc_finish(OpTpcFinishInput { txn: txn.clone() }) => {}
    _ = async {} => {}
  };
  // What a disconnecting client does next; the commit has already taken over.
  storage
    .tpc_abort(OpTpcAbortInput { txn })
    .await
    .unwrap();
  assert_eq!(storage.last_transaction(), tid);
  assert_eq!(load(&storage, Oid(7)).await.unwrap(), (b"committed".to_vec(), tid));
  storage.close().await.unwrap();

  let storage = StorageLoader::new(file_cfg(&dir))
    .load_and_start()
    .await
    .unwrap();
  assert_eq!(storage.last_transaction(), tid);
  assert_eq!(load(&storage, Oid(7)).await.unwrap(), (b"committed".to_vec(), tid));
  let log = storage
    .undo_log(OpUndoLogInput {
      first: 0,
      last: -10,
      filter: None,
    })
    .await
    .unwrap();
  assert_eq!(log.transactions.len(), 1);
  storage.close().await.unwrap();
}

#[traced_test]
#[tokio::test]
async fn test_failed_abort_is_finished_by_next_begin() {
  let flaky = Arc::new(FlakyByteStore::default());
  let storage = StorageLoader::with_byte_store(cfg(), flaky.clone())
    .load_and_start()
    .await
    .unwrap();
  let (txn, _) = begin(&storage).await;
  store(&storage, &txn, Oid(1), Tid::ZERO, b"doomed", vec![])
    .await
    .unwrap();

  flaky.fail_next_commit.store(true, Relaxed);
  assert!(matches!(
    storage
      .tpc_abort(OpTpcAbortInput { txn: txn.clone() })
      .await,
    Err(OpError::Io(_))
  ));
  assert!(logs_contain("failed to abort transaction"));
  assert!(matches!(
    store(&storage, &txn, Oid(2), Tid::ZERO, b"more", vec![]).await,
    Err(OpError::NotCurrentTransaction)
  ));
  assert!(matches!(
    storage.tpc_vote(OpTpcVoteInput { txn }).await,
    Err(OpError::NotCurrentTransaction)
  ));

  let next = commit(&storage, &[(Oid(3), Tid::ZERO, "next", vec![])]).await;
  assert_eq!(storage.last_transaction(), next);
  assert!(matches!(load(&storage, Oid(1)).await, Err(OpError::ObjectNotFound)));
  let (start, end) = revision_range(Oid(1));
  assert!(flaky.inner.range(&start, &end).is_empty());
  assert_eq!(storage.metrics().abort_count(), 1);
}

#[traced_test]
#[tokio::test]
async fn test_begin_fails_once_tids_run_out() {
  let (storage, _) = open_memory().await;
  let txn = Transaction::new("alice", "last", Vec::new());
  let tid = storage
    .tpc_begin(OpTpcBeginInput {
      txn: txn.clone(),
      tid: Some(Tid(u64::MAX)),
      status: None,
    })
    .await
    .unwrap()
    .tid;
  assert_eq!(tid, Tid(u64::MAX));
  store(&storage, &txn, Oid(1), Tid::ZERO, b"x", vec![])
    .await
    .unwrap();
  assert_eq!(finish(&storage, &txn).await, Tid(u64::MAX));

  let res = storage
    .tpc_begin(OpTpcBeginInput {
      txn: Transaction::new("alice", "after", Vec::new()),
      tid: None,
      status: None,
    })
    .await;
  assert!(matches!(res, Err(OpError::TidsExhausted)));
}
