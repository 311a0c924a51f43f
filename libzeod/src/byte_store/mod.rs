pub mod file;
pub mod memory;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io;
use std::ops::Bound;

// WARNING: Do not reorder variant struct fields, as rmp_serde doesn't store field names.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchOp {
  #[serde(rename = "0")]
  Put { key: Vec<u8>, value: Vec<u8> },
  #[serde(rename = "1")]
  Delete { key: Vec<u8> },
}

/// Ordered puts and deletes applied atomically by `ByteStore::commit`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteBatch {
  ops: Vec<BatchOp>,
}

impl WriteBatch {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
    self.ops.push(BatchOp::Put { key, value });
  }

  pub fn delete(&mut self, key: Vec<u8>) {
    self.ops.push(BatchOp::Delete { key });
  }

  pub fn ops(&self) -> &[BatchOp] {
    &self.ops
  }

  pub fn len(&self) -> usize {
    self.ops.len()
  }

  pub fn is_empty(&self) -> bool {
    self.ops.is_empty()
  }

  pub(crate) fn apply_to(self, map: &mut BTreeMap<Vec<u8>, Vec<u8>>) {
    for op in self.ops {
      match op {
        BatchOp::Put { key, value } => {
          map.insert(key, value);
        }
        BatchOp::Delete { key } => {
          map.remove(&key);
        }
      };
    }
  }
}

pub(crate) fn map_range<'a>(
  map: &'a BTreeMap<Vec<u8>, Vec<u8>>,
  start: &'a [u8],
  end: &'a [u8],
) -> impl DoubleEndedIterator<Item = (&'a Vec<u8>, &'a Vec<u8>)> + 'a {
  // BTreeMap::range panics on an inverted range.
  let end = if end < start { start } else { end };
  map.range::<[u8], _>((Bound::Included(start), Bound::Excluded(end)))
}

/// Ordered byte-keyed store beneath the engine. Reads are served from memory; writes are atomic batches.
#[async_trait]
pub trait ByteStore: Send + Sync {
  fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

  /// Entries with `start <= key < end`, in key order.
  fn range(&self, start: &[u8], end: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)>;

  /// The entry with the greatest key in `start <= key < end`.
  fn last_in_range(&self, start: &[u8], end: &[u8]) -> Option<(Vec<u8>, Vec<u8>)>;

  /// Once this returns `Ok`, the batch is durable and visible to reads.
  async fn commit(&self, batch: WriteBatch) -> io::Result<()>;

  /// Returns whether a checkpoint was actually taken. Unforced checkpoints are skipped if fewer than `min_log_bytes` have been logged since the last one.
  async fn checkpoint(&self, min_log_bytes: u64, force: bool) -> io::Result<bool>;

  async fn close(&self) -> io::Result<()>;
}
