use super::OpResult;
use crate::byte_store::ByteStore;
use crate::byte_store::WriteBatch;
use crate::ctx::ActiveTxn;
use crate::ctx::Ctx;
use crate::id::Oid;
use crate::id::Tid;
use crate::id::Transaction;
use crate::keys::decode_marker_key;
use crate::keys::marker_key;
use crate::keys::marker_range;
use crate::keys::pending_key;
use crate::keys::revision_key;
use std::collections::BTreeSet;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use tracing::debug;
use tracing::warn;

pub struct OpTpcAbortInput {
  pub txn: Transaction,
}

pub struct OpTpcAbortOutput {}

/// Deletes the pending record plus every revision under `tid` that `oids` or an `o` marker points at.
pub(crate) fn abort_batch(store: &dyn ByteStore, tid: Tid, oids: &BTreeSet<Oid>) -> WriteBatch {
  let mut batch = WriteBatch::new();
  let mut seen = BTreeSet::new();
  let (start, end) = marker_range();
  let marked = store
    .range(&start, &end)
    .into_iter()
    .filter_map(|(key, _)| decode_marker_key(&key));
  for oid in oids.iter().copied().chain(marked) {
    if seen.insert(oid) {
      batch.delete(revision_key(oid, tid));
      batch.delete(marker_key(oid));
    };
  }
  batch.delete(pending_key());
  batch
}

/// Discards the active transaction. If the write fails, the transaction stays active but marked, and the next `tpc_begin` retries.
pub(crate) async fn discard_active(ctx: &Ctx, state: &mut Option<ActiveTxn>) -> OpResult<()> {
  let Some(active) = state.as_mut() else {
    return Ok(());
  };
  let batch = abort_batch(ctx.store.as_ref(), active.tid, &active.oids);
  if let Err(err) = ctx.store.commit(batch).await {
    warn!(tid = %active.tid, error = %err, "failed to abort transaction");
    active.aborting = true;
    return Err(err.into());
  };
  debug!(tid = %active.tid, objects = active.oids.len(), "aborted transaction");
  *state = None;
  ctx.metrics.0.abort_count.fetch_add(1, Relaxed);
  Ok(())
}

/// Does nothing if `txn` is not the active transaction.
pub(crate) async fn op_tpc_abort(
  ctx: Arc<Ctx>,
  req: OpTpcAbortInput,
) -> OpResult<OpTpcAbortOutput> {
  let mut state = ctx.txn.lock().await;
  if !state.as_ref().map_or(false, |a| a.txn.is(&req.txn)) {
    return Ok(OpTpcAbortOutput {});
  };
  discard_active(&ctx, &mut state).await?;
  Ok(OpTpcAbortOutput {})
}
