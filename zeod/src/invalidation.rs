use libzeod::id::Oid;
use libzeod::id::Tid;
use std::collections::BTreeSet;
use std::collections::VecDeque;

/// The most recent committed transactions of a storage and the oids they changed, oldest first.
pub struct InvalidationQueue {
  capacity: usize,
  entries: VecDeque<(Tid, Vec<Oid>)>,
}

impl InvalidationQueue {
  pub fn new(capacity: usize) -> Self {
    Self {
      capacity,
      entries: VecDeque::with_capacity(capacity),
    }
  }

  pub fn push(&mut self, tid: Tid, oids: Vec<Oid>) {
    if self.capacity == 0 {
      return;
    };
    if self.entries.len() == self.capacity {
      self.entries.pop_front();
    };
    self.entries.push_back((tid, oids));
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Returns the latest tid and every oid changed after `since`, or `None` if the queue no longer covers `since` and the client must verify its whole cache.
  pub fn get_invalidations(&self, since: Tid) -> Option<(Tid, Vec<Oid>)> {
    let (oldest, _) = self.entries.front()?;
    if since < *oldest {
      return None;
    };
    let (latest, _) = self.entries.back()?;
    let oids = self
      .entries
      .iter()
      .rev()
      .take_while(|(tid, _)| *tid > since)
      .flat_map(|(_, oids)| oids.iter().copied())
      .collect::<BTreeSet<_>>();
    Some((*latest, oids.into_iter().collect()))
  }
}
