use chrono::DateTime;
use chrono::TimeZone;
use chrono::Utc;
use libzeod::metrics::StorageMetrics;
use std::fmt::Write;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::Relaxed;

/// Per-storage server counters. Gauges go up and down; everything else only counts successful calls.
#[rustfmt::skip]
#[derive(Default)]
pub struct StorageStats {
  pub(crate) clients: AtomicU64,
  pub(crate) verifying_clients: AtomicU64,
  pub(crate) active_txns: AtomicU64,
  pub(crate) lock_acquired_at_ms: AtomicI64, // 0 while the commit lock is free.

  pub(crate) commits: AtomicU64,
  pub(crate) aborts: AtomicU64,
  pub(crate) loads: AtomicU64,
  pub(crate) stores: AtomicU64,
  pub(crate) conflicts: AtomicU64,
  pub(crate) conflicts_resolved: AtomicU64,
}

#[rustfmt::skip]
impl StorageStats {
  pub fn clients(&self) -> u64 { self.clients.load(Relaxed) }
  pub fn verifying_clients(&self) -> u64 { self.verifying_clients.load(Relaxed) }
  pub fn active_txns(&self) -> u64 { self.active_txns.load(Relaxed) }

  pub fn commits(&self) -> u64 { self.commits.load(Relaxed) }
  pub fn aborts(&self) -> u64 { self.aborts.load(Relaxed) }
  pub fn loads(&self) -> u64 { self.loads.load(Relaxed) }
  pub fn stores(&self) -> u64 { self.stores.load(Relaxed) }
  pub fn conflicts(&self) -> u64 { self.conflicts.load(Relaxed) }
  pub fn conflicts_resolved(&self) -> u64 { self.conflicts_resolved.load(Relaxed) }
}

impl StorageStats {
  pub(crate) fn lock_acquired(&self) {
    self
      .lock_acquired_at_ms
      .store(Utc::now().timestamp_millis(), Relaxed);
  }

  pub(crate) fn lock_released(&self) {
    self.lock_acquired_at_ms.store(0, Relaxed);
  }

  pub fn lock_acquired_at(&self) -> Option<DateTime<Utc>> {
    match self.lock_acquired_at_ms.load(Relaxed) {
      0 => None,
      ms => Utc.timestamp_millis_opt(ms).single(),
    }
  }

  pub(crate) fn decrement(gauge: &AtomicU64) {
    let _ = gauge.fetch_update(Relaxed, Relaxed, |v| v.checked_sub(1));
  }

  pub fn report(
    &self,
    out: &mut String,
    name: &str,
    waiting: usize,
    engine: &StorageMetrics,
  ) -> std::fmt::Result {
    writeln!(out, "Storage: {name}")?;
    writeln!(out, "Clients: {}", self.clients())?;
    writeln!(out, "Clients verifying: {}", self.verifying_clients())?;
    writeln!(out, "Active transactions: {}", self.active_txns())?;
    writeln!(out, "Commit lock wait queue: {waiting}")?;
    match self.lock_acquired_at() {
      Some(at) => writeln!(
        out,
        "Commit lock held for: {} seconds",
        (Utc::now() - at).num_seconds()
      )?,
      None => writeln!(out, "Commit lock held for: -")?,
    };
    writeln!(out, "Commits: {}", self.commits())?;
    writeln!(out, "Aborts: {}", self.aborts())?;
    writeln!(out, "Loads: {}", self.loads())?;
    writeln!(out, "Stores: {}", self.stores())?;
    writeln!(out, "Conflicts: {}", self.conflicts())?;
    writeln!(out, "Conflicts resolved: {}", self.conflicts_resolved())?;
    writeln!(out, "Engine loaded bytes: {}", engine.load_bytes())?;
    writeln!(out, "Engine stored bytes: {}", engine.store_bytes())?;
    writeln!(out, "Engine undos: {}", engine.undo_count())?;
    writeln!(out, "Engine packs: {}", engine.pack_count())?;
    writeln!(
      out,
      "Engine packed revisions: {}",
      engine.pack_removed_revisions()
    )?;
    writeln!(out, "Engine checkpoints: {}", engine.checkpoint_count())?;
    Ok(())
  }
}
