use super::OpError;
use super::OpResult;
use crate::ctx::Ctx;
use crate::id::Oid;
use std::sync::atomic::Ordering::Relaxed;

pub(crate) fn op_new_oid(ctx: &Ctx) -> OpResult<Oid> {
  if ctx.read_only {
    return Err(OpError::ReadOnly);
  };
  Ok(Oid(ctx.last_oid.fetch_add(1, Relaxed) + 1))
}
