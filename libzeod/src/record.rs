use crate::id::Oid;
use crate::id::Tid;
use crate::op::OpError;
use crate::op::OpResult;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;

pub(crate) const SCHEMA_VERSION: &[u8] = b"ZD01";

// WARNING: Do not reorder struct fields, as rmp_serde doesn't store field names.

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionRecord {
  /// `None` means the object was uncreated by an undo.
  pub data: Option<Vec<u8>>,
  pub refs: Vec<Oid>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnRecord {
  pub user: String,
  pub description: String,
  pub extension: Vec<u8>,
  pub status: u8,
  pub oids: Vec<Oid>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRecord {
  pub tid: Tid,
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Vec<u8> {
  let mut raw = Vec::new();
  value
    .serialize(&mut rmp_serde::Serializer::new(&mut raw))
    .unwrap();
  raw
}

pub(crate) fn decode<T: DeserializeOwned>(what: &str, raw: &[u8]) -> OpResult<T> {
  rmp_serde::from_slice(raw).map_err(|err| OpError::Corrupt(format!("{what}: {err}")))
}

pub(crate) fn decode_tid(what: &str, raw: &[u8]) -> OpResult<Tid> {
  let raw: [u8; 8] = raw
    .try_into()
    .map_err(|_| OpError::Corrupt(format!("{what}: expected 8 bytes, got {}", raw.len())))?;
  Ok(Tid::from_bytes(raw))
}
