use super::OpError;
use super::OpResult;
use crate::byte_store::WriteBatch;
use crate::ctx::Ctx;
use crate::id::Tid;
use crate::id::Transaction;
use crate::keys::info_key;
use crate::keys::marker_key;
use crate::keys::pending_key;
use crate::keys::txn_key;
use crate::keys::INFO_LTID;
use crate::record::encode;
use crate::record::TxnRecord;
use std::sync::atomic::Ordering;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use tracing::debug;

pub struct OpTpcFinishInput {
  pub txn: Transaction,
}

pub struct OpTpcFinishOutput {
  pub tid: Tid,
}

pub(crate) async fn op_tpc_finish(
  ctx: Arc<Ctx>,
  req: OpTpcFinishInput,
) -> OpResult<OpTpcFinishOutput> {
  let mut state = ctx.txn.lock().await;
  let Some(active) = state.as_ref().filter(|a| a.is_current(&req.txn)) else {
    return Err(OpError::NotCurrentTransaction);
  };
  if let Some(c) = &active.first_conflict {
    return Err(OpError::Conflict {
      oid: c.oid,
      committed: c.committed,
      expected: c.expected,
    });
  };

  let tid = active.tid;
  // Everything that makes the transaction visible goes into one batch; a crash before it lands leaves a pending record for recovery to abort.
  let mut batch = WriteBatch::new();
  batch.put(info_key(INFO_LTID), tid.to_bytes().to_vec());
  batch.put(
    txn_key(tid),
    encode(&TxnRecord {
      user: active.txn.user.clone(),
      description: active.txn.description.clone(),
      extension: active.txn.extension.clone(),
      status: active.txn.status,
      oids: active.oids.iter().copied().collect(),
    }),
  );
  for &oid in active.oids.iter() {
    batch.delete(marker_key(oid));
  }
  batch.delete(pending_key());
  ctx.store.commit(batch).await?;
  ctx.ltid.store(tid.0, Ordering::Release);

  let objects = active.oids.len();
  *state = None;
  debug!(tid = %tid, objects, "committed transaction");
  ctx.metrics.0.commit_count.fetch_add(1, Relaxed);
  Ok(OpTpcFinishOutput { tid })
}
