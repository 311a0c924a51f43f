use super::OpError;
use super::OpResult;
use crate::byte_store::WriteBatch;
use crate::ctx::Ctx;
use crate::id::Oid;
use crate::id::Tid;
use crate::id::Transaction;
use crate::keys::marker_key;
use crate::keys::revision_key;
use crate::keys::revision_range_before;
use crate::keys::txn_key;
use crate::record::decode;
use crate::record::encode;
use crate::record::RevisionRecord;
use crate::record::TxnRecord;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use tracing::debug;

pub struct OpUndoInput {
  pub txn: Transaction,
  /// The committed transaction to revert.
  pub undo_tid: Tid,
}

pub struct OpUndoOutput {
  pub tid: Tid,
  pub oids: Vec<Oid>,
}

/// Within the active transaction, writes revisions restoring every object of `undo_tid` to its state before that transaction. Objects it created are uncreated.
pub(crate) async fn op_undo(ctx: Arc<Ctx>, req: OpUndoInput) -> OpResult<OpUndoOutput> {
  let mut state = ctx.txn.lock().await;
  let Some(active) = state.as_mut().filter(|a| a.is_current(&req.txn)) else {
    return Err(OpError::NotCurrentTransaction);
  };
  if req.undo_tid > ctx.last_tid() {
    return Err(OpError::UndoNotFound);
  };
  let Some(raw) = ctx.store.get(&txn_key(req.undo_tid)) else {
    return Err(OpError::UndoNotFound);
  };
  let record: TxnRecord = decode("transaction", &raw)?;

  let mut batch = WriteBatch::new();
  for &oid in record.oids.iter() {
    let current = ctx.committed_revision(oid)?.map(|(tid, _)| tid);
    if current != Some(req.undo_tid) || active.oids.contains(&oid) {
      return Err(OpError::UndoConflict(oid));
    };
    let (start, end) = revision_range_before(oid, req.undo_tid);
    let restored = match ctx.store.last_in_range(&start, &end) {
      Some((_, raw)) => decode::<RevisionRecord>("revision", &raw)?,
      None => RevisionRecord {
        data: None,
        refs: Vec::new(),
      },
    };
    batch.put(revision_key(oid, active.tid), encode(&restored));
    batch.put(marker_key(oid), Vec::new());
  }
  active.oids.extend(record.oids.iter().copied());
  ctx.store.commit(batch).await?;

  debug!(undone = %req.undo_tid, tid = %active.tid, objects = record.oids.len(), "undid transaction");
  ctx.metrics.0.undo_count.fetch_add(1, Relaxed);
  Ok(OpUndoOutput {
    tid: active.tid,
    oids: record.oids,
  })
}
