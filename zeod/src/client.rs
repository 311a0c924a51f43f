use crate::error::WireError;
use libzeod::id::Oid;
use libzeod::id::Tid;
use libzeod::op::store::StoreOutcome;
use serde::Deserialize;
use serde::Serialize;

/// Result of replaying one buffered store during a vote.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum SerialOutcome {
  Stored(StoreOutcome),
  Failed(WireError),
}

/// Server-to-client notifications. Implementations must not block; a transport queues the message and returns.
pub trait ClientStub: Send + Sync {
  /// `tid` is `None` for transactions created by undo.
  fn invalidate_transaction(&self, tid: Option<Tid>, oids: &[Oid]);

  fn serialnos(&self, serials: &[(Oid, SerialOutcome)]);

  fn invalidate_verify(&self, oid: Oid);

  fn end_verify(&self);

  /// Drops the connection. The transport is expected to disconnect the session afterwards.
  fn close(&self);
}
