use libzeod::op::OpError;
use serde::Deserialize;
use serde::Serialize;
use std::error::Error;
use std::fmt;
use std::fmt::Display;

#[derive(Debug)]
pub enum SessionError {
  AlreadyRegistered,
  /// A background task running the call panicked or was cancelled.
  Internal(String),
  InvalidArgument(String),
  MultipleBegin,
  NotRegistered,
  NotVoted,
  Op(OpError),
  ReadOnly,
  ServerClosing,
  StorageTransaction(String),
  TransactionActive,
  UnknownStorage(String),
}

impl Display for SessionError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      SessionError::AlreadyRegistered => write!(f, "session is already registered with a storage"),
      SessionError::Internal(msg) => write!(f, "internal error: {msg}"),
      SessionError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
      SessionError::MultipleBegin => {
        write!(f, "multiple simultaneous tpc_begin requests from one client")
      }
      SessionError::NotRegistered => write!(f, "session is not registered with a storage"),
      SessionError::NotVoted => write!(f, "transaction has not been voted"),
      SessionError::Op(err) => write!(f, "{err}"),
      SessionError::ReadOnly => write!(f, "storage is read-only"),
      SessionError::ServerClosing => write!(f, "server is closing"),
      SessionError::StorageTransaction(msg) => write!(f, "{msg}"),
      SessionError::TransactionActive => {
        write!(f, "operation is not allowed during a transaction")
      }
      SessionError::UnknownStorage(name) => write!(f, "no storage named {name:?}"),
    }
  }
}

impl Error for SessionError {
  fn source(&self) -> Option<&(dyn Error + 'static)> {
    match self {
      SessionError::Op(err) => Some(err),
      _ => None,
    }
  }
}

impl From<OpError> for SessionError {
  fn from(value: OpError) -> Self {
    match value {
      OpError::ReadOnly => SessionError::ReadOnly,
      err => SessionError::Op(err),
    }
  }
}

pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize, strum::Display)]
pub enum WireErrorKind {
  /// The client called something out of order or with bad arguments.
  Protocol,
  Conflict,
  ReadOnly,
  /// The server or storage is shutting down.
  Resource,
  Internal,
}

/// Error sent to clients. Only the kind and the message survive the trip.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct WireError {
  pub kind: WireErrorKind,
  pub message: String,
}

impl Display for WireError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}: {}", self.kind, self.message)
  }
}

impl Error for WireError {}

impl From<&SessionError> for WireError {
  fn from(value: &SessionError) -> Self {
    let kind = match value {
      SessionError::AlreadyRegistered
      | SessionError::InvalidArgument(_)
      | SessionError::MultipleBegin
      | SessionError::NotRegistered
      | SessionError::NotVoted
      | SessionError::StorageTransaction(_)
      | SessionError::TransactionActive
      | SessionError::UnknownStorage(_) => WireErrorKind::Protocol,
      SessionError::ReadOnly => WireErrorKind::ReadOnly,
      SessionError::ServerClosing => WireErrorKind::Resource,
      SessionError::Internal(_) => WireErrorKind::Internal,
      SessionError::Op(err) => return WireError::from(err),
    };
    WireError {
      kind,
      message: value.to_string(),
    }
  }
}

impl From<SessionError> for WireError {
  fn from(value: SessionError) -> Self {
    WireError::from(&value)
  }
}

impl From<&OpError> for WireError {
  fn from(value: &OpError) -> Self {
    let kind = match value {
      OpError::Conflict { .. } | OpError::UndoConflict(_) => WireErrorKind::Conflict,
      OpError::ReadOnly => WireErrorKind::ReadOnly,
      OpError::Closed => WireErrorKind::Resource,
      OpError::NotCurrentTransaction
      | OpError::ObjectNotFound
      | OpError::TransactionInProgress
      | OpError::UndoNotFound
      | OpError::VersionsNotSupported => WireErrorKind::Protocol,
      OpError::Corrupt(_) | OpError::Io(_) | OpError::TidsExhausted => WireErrorKind::Internal,
    };
    WireError {
      kind,
      message: value.to_string(),
    }
  }
}
