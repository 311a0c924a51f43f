use super::OpError;
use super::tpc_abort::discard_active;
use super::OpResult;
use crate::byte_store::WriteBatch;
use crate::ctx::ActiveTxn;
use crate::ctx::Ctx;
use crate::id::Tid;
use crate::id::Transaction;
use crate::keys::pending_key;
use crate::record::encode;
use crate::record::PendingRecord;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

pub struct OpTpcBeginInput {
  pub txn: Transaction,
  /// Requested tid; it is still moved past the last committed tid if necessary.
  pub tid: Option<Tid>,
  pub status: Option<u8>,
}

pub struct OpTpcBeginOutput {
  pub tid: Tid,
}

pub(crate) async fn op_tpc_begin(
  ctx: Arc<Ctx>,
  req: OpTpcBeginInput,
) -> OpResult<OpTpcBeginOutput> {
  if ctx.read_only {
    return Err(OpError::ReadOnly);
  };
  let mut state = ctx.txn.lock().await;
  if state.as_ref().map_or(false, |a| a.aborting) {
    discard_active(&ctx, &mut state).await?;
  };
  if let Some(active) = state.as_ref() {
    if active.txn.is(&req.txn) {
      return Ok(OpTpcBeginOutput { tid: active.tid });
    };
    return Err(OpError::TransactionInProgress);
  };
  if ctx.is_closing() {
    return Err(OpError::Closed);
  };

  let tid = req
    .tid
    .unwrap_or_else(Tid::now)
    .later_than(ctx.last_tid())
    .ok_or(OpError::TidsExhausted)?;
  let mut txn = req.txn;
  if let Some(status) = req.status {
    txn.status = status;
  };

  let mut batch = WriteBatch::new();
  batch.put(pending_key(), encode(&PendingRecord { tid }));
  ctx.store.commit(batch).await?;

  debug!(tid = %tid, serial_no = txn.serial_no, "began transaction");
  *state = Some(ActiveTxn {
    txn,
    tid,
    oids: BTreeSet::new(),
    first_conflict: None,
    aborting: false,
  });
  Ok(OpTpcBeginOutput { tid })
}
