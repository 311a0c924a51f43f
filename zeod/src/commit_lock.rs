use crate::session::SessionId;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::oneshot;
use tracing::info;

pub enum LockRequest {
  Granted,
  /// Resolves once the lock has been handed over. An error means the lock was closed first.
  Queued {
    granted: oneshot::Receiver<()>,
    waiting: usize,
  },
  Closed,
}

#[derive(Default)]
struct State {
  holder: Option<SessionId>,
  waiting: VecDeque<(SessionId, oneshot::Sender<()>)>,
  closed: bool,
}

/// Per-storage commit lock. Queued sessions are granted the lock strictly in arrival order, one at a time.
pub struct CommitLock {
  storage: String,
  state: Mutex<State>,
}

impl CommitLock {
  pub fn new(storage: impl Into<String>) -> Self {
    Self {
      storage: storage.into(),
      state: Mutex::new(State::default()),
    }
  }

  pub fn request(&self, session: SessionId) -> LockRequest {
    let mut state = self.state.lock();
    if state.closed {
      return LockRequest::Closed;
    };
    if state.holder.is_none() {
      state.holder = Some(session);
      return LockRequest::Granted;
    };
    let (tx, rx) = oneshot::channel();
    state.waiting.push_back((session, tx));
    LockRequest::Queued {
      granted: rx,
      waiting: state.waiting.len(),
    }
  }

  /// Releases the lock if `session` holds it and hands it to the first queued session that is still waiting.
  pub fn release(&self, session: SessionId) {
    let mut state = self.state.lock();
    if state.holder != Some(session) {
      return;
    };
    state.holder = None;
    while let Some((next, tx)) = state.waiting.pop_front() {
      // A failed send means the waiter gave up; its future was dropped.
      if tx.send(()).is_ok() {
        state.holder = Some(next);
        info!(
          storage = %self.storage,
          session = next,
          "Blocked transaction restarted. Clients waiting: {}",
          state.waiting.len()
        );
        break;
      };
    }
  }

  /// Removes `session` from the queue. If the lock was already handed to it, releases it.
  pub fn cancel_wait(&self, session: SessionId) {
    let handed_over = {
      let mut state = self.state.lock();
      state.waiting.retain(|(id, _)| *id != session);
      state.holder == Some(session)
    };
    if handed_over {
      self.release(session);
    };
  }

  pub fn is_held_by(&self, session: SessionId) -> bool {
    self.state.lock().holder == Some(session)
  }

  pub fn is_held(&self) -> bool {
    self.state.lock().holder.is_some()
  }

  pub fn waiting_len(&self) -> usize {
    self.state.lock().waiting.len()
  }

  /// Fails every queued request and all future ones.
  pub fn close(&self) {
    let mut state = self.state.lock();
    state.closed = true;
    state.waiting.clear();
  }
}
