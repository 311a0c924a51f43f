use crate::ctx::Ctx;
use crate::op::checkpoint::op_checkpoint;
use crate::op::checkpoint::OpCheckpointInput;
use crate::op::pack::op_pack;
use crate::op::pack::OpPackInput;
use crate::op::OpError;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep_until;
use tokio::time::timeout;
use tokio::time::Instant;
use tracing::error;
use tracing::info;
use tracing::warn;

pub(crate) struct BackgroundWorker {
  name: &'static str,
  stop: watch::Sender<bool>,
  handle: JoinHandle<()>,
}

impl BackgroundWorker {
  pub async fn stop_and_join(self, bound: Duration) {
    let _ = self.stop.send(true);
    match timeout(bound, self.handle).await {
      Ok(Ok(())) => {}
      Ok(Err(err)) => error!(worker = self.name, error = %err, "worker panicked"),
      Err(_) => warn!(worker = self.name, "worker did not stop in time"),
    };
  }
}

/// Runs `work` every `interval` until stopped. The schedule is kept relative to when the worker started, so slow runs skip ticks instead of drifting.
fn spawn_worker<F, Fut>(
  name: &'static str,
  storage: String,
  interval: Duration,
  mut work: F,
) -> BackgroundWorker
where
  F: FnMut(u64) -> Fut + Send + 'static,
  Fut: Future<Output = ()> + Send + 'static,
{
  let (stop, mut stopped) = watch::channel(false);
  let handle = tokio::spawn(async move {
    info!(worker = name, storage = %storage, "worker started");
    let mut next_check = Instant::now() + interval;
    let mut runs = 0;
    loop {
      let stop_requested = tokio::select! {
        _ = sleep_until(next_check) => false,
        res = stopped.changed() => res.is_err() || *stopped.borrow(),
      };
      if stop_requested {
        break;
      };
      runs += 1;
      work(runs).await;
      let now = Instant::now();
      next_check += interval;
      while next_check <= now {
        next_check += interval;
      }
    }
    info!(worker = name, storage = %storage, runs, "worker finished");
  });
  BackgroundWorker { name, stop, handle }
}

pub(crate) fn start_checkpoint_worker(ctx: Arc<Ctx>, interval: Duration) -> BackgroundWorker {
  spawn_worker("checkpoint", ctx.name.clone(), interval, move |_| {
    let ctx = ctx.clone();
    async move {
      if let Err(err) = op_checkpoint(ctx.clone(), OpCheckpointInput { force: false }).await {
        error!(storage = %ctx.name, error = %err, "checkpoint failed");
      };
    }
  })
}

/// Every `gc_every`-th run also collects garbage; 0 never does.
pub(crate) fn start_autopack_worker(
  ctx: Arc<Ctx>,
  frequency: Duration,
  window: Duration,
  gc_every: u64,
) -> BackgroundWorker {
  let window = chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero());
  spawn_worker("autopack", ctx.name.clone(), frequency, move |run| {
    let ctx = ctx.clone();
    async move {
      let input = OpPackInput {
        reference_time: Utc::now() - window,
        gc: gc_every != 0 && run % gc_every == 0,
      };
      match op_pack(ctx.clone(), input).await {
        Ok(_) => {}
        Err(OpError::Closed) => {}
        Err(err) => error!(storage = %ctx.name, error = %err, "autopack failed"),
      };
    }
  })
}
