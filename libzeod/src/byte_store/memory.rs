use super::map_range;
use super::ByteStore;
use super::WriteBatch;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::io;

/// Volatile store; nothing survives the process.
#[derive(Default)]
pub struct MemoryByteStore {
  map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryByteStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    self.map.read().len()
  }

  pub fn is_empty(&self) -> bool {
    self.map.read().is_empty()
  }
}

#[async_trait]
impl ByteStore for MemoryByteStore {
  fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
    self.map.read().get(key).cloned()
  }

  fn range(&self, start: &[u8], end: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
    map_range(&self.map.read(), start, end)
      .map(|(k, v)| (k.clone(), v.clone()))
      .collect()
  }

  fn last_in_range(&self, start: &[u8], end: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
    map_range(&self.map.read(), start, end)
      .next_back()
      .map(|(k, v)| (k.clone(), v.clone()))
  }

  async fn commit(&self, batch: WriteBatch) -> io::Result<()> {
    batch.apply_to(&mut self.map.write());
    Ok(())
  }

  async fn checkpoint(&self, _min_log_bytes: u64, _force: bool) -> io::Result<bool> {
    Ok(false)
  }

  async fn close(&self) -> io::Result<()> {
    Ok(())
  }
}
