use super::OpResult;
use crate::ctx::Ctx;
use crate::id::TransactionDescription;
use crate::keys::decode_txn_key;
use crate::keys::txn_key;
use crate::keys::TXN_PREFIX;
use crate::record::decode;
use crate::record::TxnRecord;
use serde::Deserialize;
use serde::Serialize;
use std::sync::Arc;

pub type UndoFilter = Box<dyn Fn(&TransactionDescription) -> bool + Send + Sync>;

/// Exact-match filter on transaction metadata. Absent fields match anything.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UndoSpecification {
  pub user: Option<String>,
  pub description: Option<String>,
}

impl UndoSpecification {
  pub fn matches(&self, desc: &TransactionDescription) -> bool {
    self.user.as_ref().map_or(true, |u| *u == desc.user)
      && self
        .description
        .as_ref()
        .map_or(true, |d| *d == desc.description)
  }

  pub fn into_filter(self) -> UndoFilter {
    Box::new(move |desc| self.matches(desc))
  }
}

pub struct OpUndoLogInput {
  /// Number of matching transactions to skip, newest first.
  pub first: u64,
  /// If negative, at most `-last` transactions are returned; otherwise only matches with an index below `last` are considered.
  pub last: i64,
  pub filter: Option<UndoFilter>,
}

pub struct OpUndoLogOutput {
  pub transactions: Vec<TransactionDescription>,
}

pub(crate) async fn op_undo_log(ctx: Arc<Ctx>, req: OpUndoLogInput) -> OpResult<OpUndoLogOutput> {
  let limit = if req.last < 0 {
    req.first.saturating_add(req.last.unsigned_abs())
  } else {
    req.last as u64
  };
  let mut end = txn_key(ctx.last_tid());
  end.push(0);
  let records = ctx.store.range(&[TXN_PREFIX], &end);

  let mut transactions = Vec::new();
  let mut index = 0;
  for (key, raw) in records.into_iter().rev() {
    if index >= limit {
      break;
    };
    let Some(tid) = decode_txn_key(&key) else {
      continue;
    };
    let record: TxnRecord = decode("transaction", &raw)?;
    let desc = TransactionDescription {
      tid,
      user: record.user,
      description: record.description,
      extension: record.extension,
      status: record.status,
    };
    if req.filter.as_ref().map_or(true, |f| f(&desc)) {
      if index >= req.first {
        transactions.push(desc);
      };
      index += 1;
    };
  }
  Ok(OpUndoLogOutput { transactions })
}
