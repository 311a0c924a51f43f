use super::OpError;
use super::OpResult;
use crate::byte_store::WriteBatch;
use crate::ctx::Ctx;
use crate::id::Oid;
use crate::id::Tid;
use crate::keys::all_revisions_range;
use crate::keys::decode_revision_key;
use crate::keys::revision_key;
use crate::keys::txn_key;
use crate::keys::TXN_PREFIX;
use crate::record::decode;
use crate::record::RevisionRecord;
use chrono::DateTime;
use chrono::Utc;
use itertools::Itertools;
use std::cmp::min;
use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use tracing::info;

pub struct OpPackInput {
  /// History before this point is discarded.
  pub reference_time: DateTime<Utc>,
  /// Also remove objects unreachable from the root object.
  pub gc: bool,
}

pub struct OpPackOutput {
  pub pack_tid: Tid,
  pub removed_revisions: u64,
  pub removed_objects: u64,
}

struct ObjectHistory {
  // Committed revisions that survive the history trim.
  live_tids: Vec<Tid>,
  newest: Tid,
  // `None` if the newest revision is an uncreation.
  refs: Option<Vec<Oid>>,
}

pub(crate) async fn op_pack(ctx: Arc<Ctx>, req: OpPackInput) -> OpResult<OpPackOutput> {
  if ctx.read_only {
    return Err(OpError::ReadOnly);
  };
  let _pack = ctx.pack_lock.lock().await;
  // Commits wait for the pack; loads never take this lock.
  let state = ctx.txn.lock().await;
  if ctx.is_closing() {
    return Err(OpError::Closed);
  };

  let ltid = ctx.last_tid();
  let pack_tid = min(Tid::from_datetime(req.reference_time), ltid);
  info!(storage = %ctx.name, pack_tid = %pack_tid, gc = req.gc, "pack started");

  let mut batch = WriteBatch::new();
  let mut removed_revisions = 0;
  let mut histories = BTreeMap::<Oid, ObjectHistory>::new();
  let (start, end) = all_revisions_range();
  let revisions = ctx.store.range(&start, &end);
  for (oid, group) in &revisions
    .iter()
    .filter_map(|(key, raw)| decode_revision_key(key).map(|(oid, tid)| (oid, tid, raw)))
    .filter(|(_, tid, _)| *tid <= ltid)
    .group_by(|(oid, _, _)| *oid)
  {
    if ctx.is_closing() {
      return Err(OpError::Closed);
    };
    let revs = group
      .map(|(_, tid, raw)| Ok((tid, decode::<RevisionRecord>("revision", raw)?)))
      .collect::<OpResult<Vec<_>>>()?;
    // The newest revision at or before the pack time is what a load at that time sees; older ones are unreachable.
    let keep = revs.iter().rposition(|(tid, _)| *tid <= pack_tid);
    let mut live_tids = Vec::new();
    for (i, (tid, rec)) in revs.iter().enumerate() {
      let superseded = keep.map_or(false, |k| i < k || (i == k && rec.data.is_none()));
      if superseded {
        batch.delete(revision_key(oid, *tid));
        removed_revisions += 1;
      } else {
        live_tids.push(*tid);
      };
    }
    let Some((newest, newest_rec)) = revs.last() else {
      continue;
    };
    histories.insert(oid, ObjectHistory {
      live_tids,
      newest: *newest,
      refs: newest_rec.data.as_ref().map(|_| newest_rec.refs.clone()),
    });
  }

  let mut removed_objects = 0;
  if req.gc {
    let mut todo = vec![Oid::ROOT];
    // Objects written by the in-flight transaction, and whatever they point to, must survive.
    if let Some(active) = state.as_ref() {
      for &oid in active.oids.iter() {
        todo.push(oid);
        if let Some(raw) = ctx.store.get(&revision_key(oid, active.tid)) {
          todo.extend(decode::<RevisionRecord>("revision", &raw)?.refs);
        };
      }
    };
    let mut reachable = HashSet::new();
    while let Some(oid) = todo.pop() {
      if !reachable.insert(oid) {
        continue;
      };
      if let Some(refs) = histories.get(&oid).and_then(|h| h.refs.as_ref()) {
        todo.extend(refs.iter().copied());
      };
    }
    for (oid, history) in histories.iter() {
      if reachable.contains(oid) || history.newest > pack_tid {
        continue;
      };
      for &tid in history.live_tids.iter() {
        batch.delete(revision_key(*oid, tid));
        removed_revisions += 1;
      }
      removed_objects += 1;
    }
  };

  let mut txn_end = txn_key(pack_tid);
  txn_end.push(0);
  for (key, _) in ctx.store.range(&[TXN_PREFIX], &txn_end) {
    batch.delete(key);
  }

  if ctx.is_closing() {
    return Err(OpError::Closed);
  };
  ctx.store.commit(batch).await?;
  drop(state);

  ctx.metrics.0.pack_count.fetch_add(1, Relaxed);
  ctx
    .metrics
    .0
    .pack_removed_revisions
    .fetch_add(removed_revisions, Relaxed);
  ctx
    .metrics
    .0
    .pack_removed_objects
    .fetch_add(removed_objects, Relaxed);
  info!(
    storage = %ctx.name,
    removed_revisions,
    removed_objects,
    "pack finished"
  );
  Ok(OpPackOutput {
    pack_tid,
    removed_revisions,
    removed_objects,
  })
}
