use super::OpError;
use super::OpResult;
use crate::ctx::Ctx;
use crate::id::Transaction;
use std::sync::Arc;

pub struct OpTpcVoteInput {
  pub txn: Transaction,
}

pub struct OpTpcVoteOutput {}

/// Fails with the transaction's first unresolved conflict, if any.
pub(crate) async fn op_tpc_vote(ctx: Arc<Ctx>, req: OpTpcVoteInput) -> OpResult<OpTpcVoteOutput> {
  let state = ctx.txn.lock().await;
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
  Ok(OpTpcVoteOutput {})
}
