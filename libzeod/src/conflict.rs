use crate::id::Oid;
use crate::id::Tid;
use std::error::Error;

/// A store whose expected serial no longer matches the committed one.
pub struct Conflict<'a> {
  pub oid: Oid,
  pub committed_serial: Tid,
  /// The serial the client based its new state on.
  pub old_serial: Tid,
  pub new_data: &'a [u8],
  pub committed_data: &'a [u8],
  /// `None` if that revision is no longer available (e.g. packed away).
  pub old_data: Option<&'a [u8]>,
}

/// Application-level merge of conflicting writes. Called at most once per conflicting store.
pub trait ConflictResolver: Send + Sync {
  fn resolve(&self, conflict: &Conflict<'_>) -> Result<Vec<u8>, Box<dyn Error + Send + Sync>>;
}
