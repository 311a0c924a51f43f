use crate::client::SerialOutcome;
use crate::error::WireError;
use crate::session::StorageInfo;
use crate::session::TxnId;
use bytes::Bytes;
use libzeod::id::Oid;
use libzeod::id::Tid;
use libzeod::id::TransactionDescription;
use libzeod::op::undo_log::UndoSpecification;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;
use tokio_util::codec::LengthDelimitedCodec;

/// Frames larger than this are rejected and the connection is dropped.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// `[u32 BE length][payload]` frames.
pub fn codec() -> LengthDelimitedCodec {
  LengthDelimitedCodec::builder()
    .length_field_length(4)
    .max_frame_length(MAX_FRAME_LEN)
    .new_codec()
}

// WARNING: Do not reorder variant fields, as rmp_serde doesn't store field names.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub enum Request {
  Register {
    storage: String,
    read_only: bool,
  },
  GetInfo,
  LastTransaction,
  Load {
    oid: Oid,
  },
  LoadSerial {
    oid: Oid,
    serial: Tid,
  },
  GetSerial {
    oid: Oid,
  },
  NewOids {
    n: i64,
  },
  GetInvalidations {
    tid: Tid,
  },
  ZeoVerify {
    oid: Oid,
    serial: Tid,
  },
  EndZeoVerify,
  TpcBegin {
    id: TxnId,
    user: String,
    description: String,
    extension: Vec<u8>,
    tid: Option<Tid>,
    status: u8,
  },
  Storea {
    oid: Oid,
    serial: Tid,
    data: Vec<u8>,
    refs: Vec<Oid>,
    version: String,
    id: TxnId,
  },
  TpcVote {
    id: TxnId,
  },
  TpcFinish {
    id: TxnId,
  },
  TpcAbort {
    id: TxnId,
  },
  Undo {
    tid: Tid,
  },
  UndoLog {
    first: u64,
    last: i64,
  },
  UndoInfo {
    first: u64,
    last: i64,
    spec: Option<UndoSpecification>,
  },
  /// `time` is in seconds since the Unix epoch.
  Pack {
    time: f64,
    wait: bool,
  },
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub enum Reply {
  Ok,
  Info(StorageInfo),
  Tid(Tid),
  MaybeTid(Option<Tid>),
  Load { data: Vec<u8>, serial: Tid },
  Data(Vec<u8>),
  Oids(Vec<Oid>),
  Invalidations(Option<(Tid, Vec<Oid>)>),
  Transactions(Vec<TransactionDescription>),
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct ClientMessage {
  pub msgid: u64,
  pub request: Request,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub enum ServerMessage {
  Reply {
    msgid: u64,
    result: Result<Reply, WireError>,
  },
  InvalidateTransaction {
    tid: Option<Tid>,
    oids: Vec<Oid>,
  },
  SerialNos(Vec<(Oid, SerialOutcome)>),
  InvalidateVerify(Oid),
  EndVerify,
}

pub fn encode<T: Serialize>(msg: &T) -> Bytes {
  let mut raw = Vec::new();
  msg
    .serialize(&mut rmp_serde::Serializer::new(&mut raw))
    .unwrap();
  raw.into()
}

pub fn decode<T: DeserializeOwned>(raw: &[u8]) -> Result<T, rmp_serde::decode::Error> {
  rmp_serde::from_slice(raw)
}
