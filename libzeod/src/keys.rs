//! Layout of records inside the byte store. All integers are big-endian so that byte order matches numeric order.

use crate::id::Oid;
use crate::id::Tid;

pub const INFO_PREFIX: u8 = b'i';
pub const MARKER_PREFIX: u8 = b'o';
pub const PENDING_PREFIX: u8 = b'p';
pub const REVISION_PREFIX: u8 = b'r';
pub const TXN_PREFIX: u8 = b't';

pub const INFO_VERSION: &str = "version";
pub const INFO_LTID: &str = "ltid";

pub fn info_key(name: &str) -> Vec<u8> {
  let mut key = Vec::with_capacity(1 + name.len());
  key.push(INFO_PREFIX);
  key.extend_from_slice(name.as_bytes());
  key
}

pub fn pending_key() -> Vec<u8> {
  vec![PENDING_PREFIX]
}

pub fn marker_key(oid: Oid) -> Vec<u8> {
  let mut key = Vec::with_capacity(9);
  key.push(MARKER_PREFIX);
  key.extend_from_slice(&oid.to_bytes());
  key
}

pub fn marker_range() -> (Vec<u8>, Vec<u8>) {
  (vec![MARKER_PREFIX], vec![MARKER_PREFIX + 1])
}

pub fn decode_marker_key(key: &[u8]) -> Option<Oid> {
  match key {
    [MARKER_PREFIX, rest @ ..] => Some(Oid::from_bytes(rest.try_into().ok()?)),
    _ => None,
  }
}

pub fn revision_key(oid: Oid, tid: Tid) -> Vec<u8> {
  let mut key = Vec::with_capacity(17);
  key.push(REVISION_PREFIX);
  key.extend_from_slice(&oid.to_bytes());
  key.extend_from_slice(&tid.to_bytes());
  key
}

/// Every revision of `oid`.
pub fn revision_range(oid: Oid) -> (Vec<u8>, Vec<u8>) {
  let start = revision_key(oid, Tid::ZERO);
  let mut end = revision_key(oid, Tid(u64::MAX));
  end.push(0);
  (start, end)
}

/// Revisions of `oid` with a tid at or before `tid`.
pub fn revision_range_upto(oid: Oid, tid: Tid) -> (Vec<u8>, Vec<u8>) {
  let start = revision_key(oid, Tid::ZERO);
  let mut end = revision_key(oid, tid);
  end.push(0);
  (start, end)
}

/// Revisions of `oid` with a tid strictly before `tid`.
pub fn revision_range_before(oid: Oid, tid: Tid) -> (Vec<u8>, Vec<u8>) {
  (revision_key(oid, Tid::ZERO), revision_key(oid, tid))
}

pub fn all_revisions_range() -> (Vec<u8>, Vec<u8>) {
  (vec![REVISION_PREFIX], vec![REVISION_PREFIX + 1])
}

pub fn decode_revision_key(key: &[u8]) -> Option<(Oid, Tid)> {
  match key {
    [REVISION_PREFIX, rest @ ..] if rest.len() == 16 => Some((
      Oid::from_bytes(rest[..8].try_into().ok()?),
      Tid::from_bytes(rest[8..].try_into().ok()?),
    )),
    _ => None,
  }
}

pub fn txn_key(tid: Tid) -> Vec<u8> {
  let mut key = Vec::with_capacity(9);
  key.push(TXN_PREFIX);
  key.extend_from_slice(&tid.to_bytes());
  key
}

pub fn txn_range() -> (Vec<u8>, Vec<u8>) {
  (vec![TXN_PREFIX], vec![TXN_PREFIX + 1])
}

pub fn decode_txn_key(key: &[u8]) -> Option<Tid> {
  match key {
    [TXN_PREFIX, rest @ ..] => Some(Tid::from_bytes(rest.try_into().ok()?)),
    _ => None,
  }
}
