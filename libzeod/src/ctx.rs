use crate::background::BackgroundWorker;
use crate::byte_store::ByteStore;
use crate::conflict::ConflictResolver;
use crate::id::Oid;
use crate::id::Tid;
use crate::id::Transaction;
use crate::keys::decode_revision_key;
use crate::keys::revision_range_upto;
use crate::lock_file::LockFile;
use crate::metrics::StorageMetrics;
use crate::op::OpResult;
use crate::record::decode;
use crate::record::RevisionRecord;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

pub(crate) struct FirstConflict {
  pub oid: Oid,
  pub committed: Tid,
  pub expected: Tid,
}

/// The transaction between `tpc_begin` and `tpc_finish`/`tpc_abort`. Its revisions are already in the store under `tid`, but stay invisible to loads until `ltid` reaches `tid`.
pub(crate) struct ActiveTxn {
  pub txn: Transaction,
  pub tid: Tid,
  // Recorded before the revision is written, so every revision under `tid` is covered.
  pub oids: BTreeSet<Oid>,
  pub first_conflict: Option<FirstConflict>,
  // An abort failed part way; only another abort may touch this transaction.
  pub aborting: bool,
}

impl ActiveTxn {
  pub fn is_current(&self, txn: &Transaction) -> bool {
    !self.aborting && self.txn.is(txn)
  }
}

pub(crate) struct Ctx {
  pub name: String,
  pub read_only: bool,
  pub store: Arc<dyn ByteStore>,
  pub resolver: Option<Arc<dyn ConflictResolver>>,
  pub metrics: StorageMetrics,
  pub checkpoint_min_log_bytes: u64,
  // Highest oid handed out so far.
  pub last_oid: AtomicU64,
  // Last committed tid.
  pub ltid: AtomicU64,
  pub txn: tokio::sync::Mutex<Option<ActiveTxn>>,
  pub pack_lock: tokio::sync::Mutex<()>,
  pub closing: AtomicBool,
  pub lock_file: Mutex<Option<LockFile>>,
  pub workers: Mutex<Vec<BackgroundWorker>>,
}

impl Ctx {
  pub fn last_tid(&self) -> Tid {
    Tid(self.ltid.load(Ordering::Acquire))
  }

  pub fn is_closing(&self) -> bool {
    self.closing.load(Ordering::Acquire)
  }

  /// Newest revision of `oid` at or before `tid`, including uncreations.
  pub fn revision_at(&self, oid: Oid, tid: Tid) -> OpResult<Option<(Tid, RevisionRecord)>> {
    let (start, end) = revision_range_upto(oid, tid);
    let Some((key, raw)) = self.store.last_in_range(&start, &end) else {
      return Ok(None);
    };
    let Some((_, tid)) = decode_revision_key(&key) else {
      return Ok(None);
    };
    Ok(Some((tid, decode("revision", &raw)?)))
  }

  pub fn committed_revision(&self, oid: Oid) -> OpResult<Option<(Tid, RevisionRecord)>> {
    self.revision_at(oid, self.last_tid())
  }

  /// `Tid::ZERO` if the object does not currently exist.
  pub fn committed_serial(&self, oid: Oid) -> OpResult<Tid> {
    Ok(match self.committed_revision(oid)? {
      Some((tid, RevisionRecord { data: Some(_), .. })) => tid,
      _ => Tid::ZERO,
    })
  }
}
