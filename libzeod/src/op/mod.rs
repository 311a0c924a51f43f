use crate::id::Oid;
use crate::id::Tid;
use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::io;
use std::path::PathBuf;

pub mod checkpoint;
pub mod load;
pub mod new_oid;
pub mod pack;
pub mod store;
pub mod tpc_abort;
pub mod tpc_begin;
pub mod tpc_finish;
pub mod tpc_vote;
pub mod undo;
pub mod undo_log;

pub type OpResult<T> = Result<T, OpError>;

#[derive(Debug)]
pub enum OpError {
  Closed,
  Conflict {
    oid: Oid,
    committed: Tid,
    expected: Tid,
  },
  Corrupt(String),
  Io(io::Error),
  NotCurrentTransaction,
  ObjectNotFound,
  ReadOnly,
  TidsExhausted,
  TransactionInProgress,
  UndoConflict(Oid),
  UndoNotFound,
  VersionsNotSupported,
}

impl Display for OpError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      OpError::Closed => write!(f, "storage is closed"),
      OpError::Conflict {
        oid,
        committed,
        expected,
      } => write!(
        f,
        "conflict on object {oid}: committed serial is {committed}, expected {expected}"
      ),
      OpError::Corrupt(msg) => write!(f, "corrupt record: {msg}"),
      OpError::Io(err) => write!(f, "I/O error: {err}"),
      OpError::NotCurrentTransaction => write!(f, "transaction is not the current transaction"),
      OpError::ObjectNotFound => write!(f, "object does not exist"),
      OpError::ReadOnly => write!(f, "storage is read-only"),
      OpError::TidsExhausted => write!(f, "no transaction id is left after the last committed one"),
      OpError::TransactionInProgress => write!(f, "another transaction is in progress"),
      OpError::UndoConflict(oid) => write!(f, "object {oid} has been modified since"),
      OpError::UndoNotFound => write!(f, "transaction does not exist or has been packed"),
      OpError::VersionsNotSupported => write!(f, "versions are not supported"),
    }
  }
}

impl Error for OpError {
  fn source(&self) -> Option<&(dyn Error + 'static)> {
    match self {
      OpError::Io(err) => Some(err),
      _ => None,
    }
  }
}

impl From<io::Error> for OpError {
  fn from(err: io::Error) -> Self {
    OpError::Io(err)
  }
}

#[derive(Debug)]
pub enum OpenError {
  Corrupt(String),
  IncompatibleVersion(Vec<u8>),
  Io(io::Error),
  Locked(PathBuf),
}

impl Display for OpenError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      OpenError::Corrupt(msg) => write!(f, "corrupt record: {msg}"),
      OpenError::IncompatibleVersion(found) => write!(
        f,
        "incompatible schema version {}",
        String::from_utf8_lossy(found)
      ),
      OpenError::Io(err) => write!(f, "I/O error: {err}"),
      OpenError::Locked(path) => write!(f, "{} is locked by another process", path.display()),
    }
  }
}

impl Error for OpenError {}

impl From<io::Error> for OpenError {
  fn from(err: io::Error) -> Self {
    OpenError::Io(err)
  }
}

impl From<OpError> for OpenError {
  fn from(err: OpError) -> Self {
    match err {
      OpError::Io(err) => OpenError::Io(err),
      OpError::Corrupt(msg) => OpenError::Corrupt(msg),
      other => OpenError::Corrupt(other.to_string()),
    }
  }
}
