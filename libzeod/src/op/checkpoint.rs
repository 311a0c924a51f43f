use super::OpResult;
use crate::ctx::Ctx;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use tracing::debug;

pub struct OpCheckpointInput {
  /// Ignore the minimum log size and the closing state.
  pub force: bool,
}

pub struct OpCheckpointOutput {
  pub checkpointed: bool,
}

pub(crate) async fn op_checkpoint(
  ctx: Arc<Ctx>,
  req: OpCheckpointInput,
) -> OpResult<OpCheckpointOutput> {
  if ctx.is_closing() && !req.force {
    return Ok(OpCheckpointOutput {
      checkpointed: false,
    });
  };
  let checkpointed = ctx
    .store
    .checkpoint(ctx.checkpoint_min_log_bytes, req.force)
    .await?;
  if checkpointed {
    debug!(storage = %ctx.name, "checkpointed");
    ctx.metrics.0.checkpoint_count.fetch_add(1, Relaxed);
  };
  Ok(OpCheckpointOutput { checkpointed })
}
