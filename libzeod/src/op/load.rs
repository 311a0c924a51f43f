use super::OpError;
use super::OpResult;
use crate::ctx::Ctx;
use crate::id::Oid;
use crate::id::Tid;
use crate::keys::revision_key;
use crate::record::decode;
use crate::record::RevisionRecord;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use tracing::trace;

pub struct OpLoadInput {
  pub oid: Oid,
}

pub struct OpLoadOutput {
  pub data: Vec<u8>,
  pub serial: Tid,
}

pub(crate) async fn op_load(ctx: Arc<Ctx>, req: OpLoadInput) -> OpResult<OpLoadOutput> {
  let Some((serial, RevisionRecord { data: Some(data), .. })) = ctx.committed_revision(req.oid)? else {
    return Err(OpError::ObjectNotFound);
  };
  trace!(oid = %req.oid, serial = %serial, len = data.len(), "loaded object");
  ctx.metrics.0.load_count.fetch_add(1, Relaxed);
  ctx
    .metrics
    .0
    .load_bytes
    .fetch_add(data.len() as u64, Relaxed);
  Ok(OpLoadOutput { data, serial })
}

pub struct OpLoadSerialInput {
  pub oid: Oid,
  pub serial: Tid,
}

pub struct OpLoadSerialOutput {
  pub data: Vec<u8>,
}

/// Loads the exact revision written by transaction `serial`, if it has not been packed away.
pub(crate) async fn op_load_serial(
  ctx: Arc<Ctx>,
  req: OpLoadSerialInput,
) -> OpResult<OpLoadSerialOutput> {
  if req.serial > ctx.last_tid() {
    return Err(OpError::ObjectNotFound);
  };
  let Some(raw) = ctx.store.get(&revision_key(req.oid, req.serial)) else {
    return Err(OpError::ObjectNotFound);
  };
  let RevisionRecord { data: Some(data), .. } = decode("revision", &raw)? else {
    return Err(OpError::ObjectNotFound);
  };
  ctx.metrics.0.load_count.fetch_add(1, Relaxed);
  Ok(OpLoadSerialOutput { data })
}

pub struct OpGetSerialInput {
  pub oid: Oid,
}

pub struct OpGetSerialOutput {
  pub serial: Tid,
}

pub(crate) async fn op_get_serial(
  ctx: Arc<Ctx>,
  req: OpGetSerialInput,
) -> OpResult<OpGetSerialOutput> {
  match ctx.committed_serial(req.oid)? {
    Tid::ZERO => Err(OpError::ObjectNotFound),
    serial => Ok(OpGetSerialOutput { serial }),
  }
}
