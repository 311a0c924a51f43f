use crate::client::ClientStub;
use crate::session::SessionId;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::sync::Notify;
use tokio::time::sleep_until;
use tokio::time::Instant;
use tracing::error;

struct Armed {
  session: SessionId,
  client: Arc<dyn ClientStub>,
  deadline: Instant,
}

struct Inner {
  storage: String,
  timeout: Duration,
  armed: Mutex<Option<Armed>>,
  changed: Notify,
  stop: watch::Sender<bool>,
}

/// Closes the connection of a client that holds the commit lock for longer than the configured timeout.
pub struct TimeoutWatchdog(Option<Arc<Inner>>);

impl TimeoutWatchdog {
  pub fn disabled() -> Self {
    Self(None)
  }

  /// Must be called within a tokio runtime.
  pub fn start(storage: impl Into<String>, timeout: Duration) -> Self {
    let (stop, stopped) = watch::channel(false);
    let inner = Arc::new(Inner {
      storage: storage.into(),
      timeout,
      armed: Mutex::new(None),
      changed: Notify::new(),
      stop,
    });
    tokio::spawn(watch_loop(inner.clone(), stopped));
    Self(Some(inner))
  }

  pub fn is_enabled(&self) -> bool {
    self.0.is_some()
  }

  pub fn begin(&self, session: SessionId, client: Arc<dyn ClientStub>) {
    let Some(inner) = &self.0 else {
      return;
    };
    *inner.armed.lock() = Some(Armed {
      session,
      client,
      deadline: Instant::now() + inner.timeout,
    });
    inner.changed.notify_one();
  }

  pub fn end(&self, session: SessionId) {
    let Some(inner) = &self.0 else {
      return;
    };
    let mut armed = inner.armed.lock();
    if armed.as_ref().map_or(false, |a| a.session == session) {
      *armed = None;
      drop(armed);
      inner.changed.notify_one();
    };
  }

  pub fn stop(&self) {
    if let Some(inner) = &self.0 {
      inner.armed.lock().take();
      let _ = inner.stop.send(true);
    };
  }
}

impl Drop for TimeoutWatchdog {
  fn drop(&mut self) {
    self.stop();
  }
}

async fn watch_loop(inner: Arc<Inner>, mut stopped: watch::Receiver<bool>) {
  loop {
    let deadline = inner.armed.lock().as_ref().map(|a| a.deadline);
    let expired = async {
      match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
      }
    };
    tokio::select! {
      _ = inner.changed.notified() => continue,
      _ = expired => {}
      res = stopped.changed() => {
        if res.is_err() || *stopped.borrow() {
          break;
        };
        continue;
      }
    };
    let timed_out = {
      let mut armed = inner.armed.lock();
      match armed.as_ref() {
        Some(a) if a.deadline <= Instant::now() => armed.take(),
        _ => None,
      }
    };
    if let Some(a) = timed_out {
      error!(
        storage = %inner.storage,
        session = a.session,
        "transaction timeout after {} seconds",
        inner.timeout.as_secs_f64()
      );
      a.client.close();
    };
  }
}
