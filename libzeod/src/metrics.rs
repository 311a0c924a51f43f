use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;

#[rustfmt::skip]
#[derive(Default)]
pub(crate) struct Inner {
  // For all `*_count` metrics, only successful calls are considered.
  pub(crate) load_count: AtomicU64,
  pub(crate) load_bytes: AtomicU64,

  pub(crate) store_count: AtomicU64,
  pub(crate) store_bytes: AtomicU64,
  pub(crate) conflict_count: AtomicU64, // Includes conflicts that were then resolved.
  pub(crate) conflict_resolved_count: AtomicU64,

  pub(crate) commit_count: AtomicU64,
  pub(crate) abort_count: AtomicU64,
  pub(crate) undo_count: AtomicU64,

  pub(crate) pack_count: AtomicU64,
  pub(crate) pack_removed_revisions: AtomicU64,
  pub(crate) pack_removed_objects: AtomicU64, // Only by garbage collection.

  pub(crate) checkpoint_count: AtomicU64,
}

#[derive(Clone, Default)]
pub struct StorageMetrics(pub(crate) Arc<Inner>);

#[rustfmt::skip]
impl StorageMetrics {
  pub fn load_count(&self) -> u64 { self.0.load_count.load(Relaxed) }
  pub fn load_bytes(&self) -> u64 { self.0.load_bytes.load(Relaxed) }

  pub fn store_count(&self) -> u64 { self.0.store_count.load(Relaxed) }
  pub fn store_bytes(&self) -> u64 { self.0.store_bytes.load(Relaxed) }
  pub fn conflict_count(&self) -> u64 { self.0.conflict_count.load(Relaxed) }
  pub fn conflict_resolved_count(&self) -> u64 { self.0.conflict_resolved_count.load(Relaxed) }

  pub fn commit_count(&self) -> u64 { self.0.commit_count.load(Relaxed) }
  pub fn abort_count(&self) -> u64 { self.0.abort_count.load(Relaxed) }
  pub fn undo_count(&self) -> u64 { self.0.undo_count.load(Relaxed) }

  pub fn pack_count(&self) -> u64 { self.0.pack_count.load(Relaxed) }
  pub fn pack_removed_revisions(&self) -> u64 { self.0.pack_removed_revisions.load(Relaxed) }
  pub fn pack_removed_objects(&self) -> u64 { self.0.pack_removed_objects.load(Relaxed) }

  pub fn checkpoint_count(&self) -> u64 { self.0.checkpoint_count.load(Relaxed) }
}
