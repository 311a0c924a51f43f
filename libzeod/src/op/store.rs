use super::OpError;
use super::OpResult;
use crate::byte_store::WriteBatch;
use crate::conflict::Conflict;
use crate::ctx::Ctx;
use crate::ctx::FirstConflict;
use crate::id::Oid;
use crate::id::Tid;
use crate::id::Transaction;
use crate::keys::marker_key;
use crate::keys::revision_key;
use crate::record::decode;
use crate::record::encode;
use crate::record::RevisionRecord;
use serde::Deserialize;
use serde::Serialize;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use tracing::debug;
use tracing::trace;

pub struct OpStoreInput {
  pub oid: Oid,
  /// Serial of the revision the new data is based on; `Tid::ZERO` for new objects.
  pub serial: Tid,
  pub data: Vec<u8>,
  /// Oids referenced by `data`, used by garbage collection.
  pub refs: Vec<Oid>,
  /// Must be empty.
  pub version: String,
  pub txn: Transaction,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum StoreOutcome {
  /// Stored as-is; the new serial will be this tid.
  Serial(Tid),
  /// A conflict was resolved; the client must invalidate its copy rather than adopt its own data.
  ResolvedSerial,
}

pub struct OpStoreOutput {
  pub outcome: StoreOutcome,
}

fn old_data(ctx: &Ctx, oid: Oid, serial: Tid) -> OpResult<Option<Vec<u8>>> {
  if serial == Tid::ZERO {
    return Ok(None);
  };
  let Some(raw) = ctx.store.get(&revision_key(oid, serial)) else {
    return Ok(None);
  };
  Ok(decode::<RevisionRecord>("revision", &raw)?.data)
}

pub(crate) async fn op_store(ctx: Arc<Ctx>, req: OpStoreInput) -> OpResult<OpStoreOutput> {
  if !req.version.is_empty() {
    return Err(OpError::VersionsNotSupported);
  };
  let mut state = ctx.txn.lock().await;
  let Some(active) = state.as_mut().filter(|a| a.is_current(&req.txn)) else {
    return Err(OpError::NotCurrentTransaction);
  };
  if ctx.is_closing() {
    return Err(OpError::Closed);
  };

  let oid = req.oid;
  let committed = ctx.committed_revision(oid)?;
  let committed_serial = match &committed {
    Some((tid, RevisionRecord { data: Some(_), .. })) => *tid,
    _ => Tid::ZERO,
  };

  let (data, outcome) = if committed_serial == req.serial {
    (req.data, StoreOutcome::Serial(active.tid))
  } else {
    ctx.metrics.0.conflict_count.fetch_add(1, Relaxed);
    let resolved = match (&ctx.resolver, &committed) {
      (Some(resolver), Some((_, RevisionRecord { data: Some(committed_data), .. }))) => {
        let old = old_data(&ctx, oid, req.serial)?;
        match resolver.resolve(&Conflict {
          oid,
          committed_serial,
          old_serial: req.serial,
          new_data: &req.data,
          committed_data,
          old_data: old.as_deref(),
        }) {
          Ok(data) => Some(data),
          Err(err) => {
            debug!(oid = %oid, error = %err, "conflict resolution failed");
            None
          }
        }
      }
      _ => None,
    };
    let Some(data) = resolved else {
      if active.first_conflict.is_none() {
        active.first_conflict = Some(FirstConflict {
          oid,
          committed: committed_serial,
          expected: req.serial,
        });
      };
      return Err(OpError::Conflict {
        oid,
        committed: committed_serial,
        expected: req.serial,
      });
    };
    ctx.metrics.0.conflict_resolved_count.fetch_add(1, Relaxed);
    (data, StoreOutcome::ResolvedSerial)
  };

  let len = data.len() as u64;
  let mut batch = WriteBatch::new();
  batch.put(
    revision_key(oid, active.tid),
    encode(&RevisionRecord {
      data: Some(data),
      refs: req.refs,
    }),
  );
  batch.put(marker_key(oid), Vec::new());
  active.oids.insert(oid);
  ctx.store.commit(batch).await?;

  trace!(oid = %oid, tid = %active.tid, len, "stored object");
  ctx.metrics.0.store_count.fetch_add(1, Relaxed);
  ctx.metrics.0.store_bytes.fetch_add(len, Relaxed);
  Ok(OpStoreOutput { outcome })
}
