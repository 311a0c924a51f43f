use crate::client::ClientStub;
use crate::client::SerialOutcome;
use crate::error::WireError;
use crate::registry::StorageServer;
use crate::session::BufferedStore;
use crate::session::Session;
use crate::wire::codec;
use crate::wire::decode;
use crate::wire::encode;
use crate::wire::ClientMessage;
use crate::wire::Reply;
use crate::wire::Request;
use crate::wire::ServerMessage;
use futures::SinkExt;
use futures::StreamExt;
use libzeod::id::Oid;
use libzeod::id::Tid;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio_util::codec::FramedRead;
use tokio_util::codec::FramedWrite;
use tracing::debug;
use tracing::info;
use tracing::warn;

/// Notifications and replies are queued here and written by the connection's writer task.
struct ConnectionClient {
  out: mpsc::UnboundedSender<ServerMessage>,
  closed: watch::Sender<bool>,
}

impl ConnectionClient {
  fn send(&self, msg: ServerMessage) {
    // Fails only once the writer has stopped, at which point the connection is going away anyway.
    let _ = self.out.send(msg);
  }
}

impl ClientStub for ConnectionClient {
  fn invalidate_transaction(&self, tid: Option<Tid>, oids: &[Oid]) {
    self.send(ServerMessage::InvalidateTransaction {
      tid,
      oids: oids.to_vec(),
    });
  }

  fn serialnos(&self, serials: &[(Oid, SerialOutcome)]) {
    self.send(ServerMessage::SerialNos(serials.to_vec()));
  }

  fn invalidate_verify(&self, oid: Oid) {
    self.send(ServerMessage::InvalidateVerify(oid));
  }

  fn end_verify(&self) {
    self.send(ServerMessage::EndVerify);
  }

  fn close(&self) {
    self.closed.send_replace(true);
  }
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
  while !*closed.borrow() {
    if closed.changed().await.is_err() {
      return;
    };
  }
}

async fn handle_request(session: &mut Session, request: Request) -> Result<Reply, WireError> {
  let reply = match request {
    Request::Register { storage, read_only } => {
      session.register(&storage, read_only).map(|_| Reply::Ok)
    }
    Request::GetInfo => session.get_info().map(Reply::Info),
    Request::LastTransaction => session.last_transaction().map(Reply::Tid),
    Request::Load { oid } => session
      .load(oid)
      .await
      .map(|(data, serial)| Reply::Load { data, serial }),
    Request::LoadSerial { oid, serial } => session.load_serial(oid, serial).await.map(Reply::Data),
    Request::GetSerial { oid } => session.get_serial(oid).await.map(Reply::Tid),
    Request::NewOids { n } => session.new_object_ids(n).map(Reply::Oids),
    Request::GetInvalidations { tid } => session.get_invalidations(tid).map(Reply::Invalidations),
    Request::ZeoVerify { oid, serial } => session.zeo_verify(oid, serial).await.map(|_| Reply::Ok),
    Request::EndZeoVerify => session.end_zeo_verify().map(|_| Reply::Ok),
    Request::TpcBegin {
      id,
      user,
      description,
      extension,
      tid,
      status,
    } => session
      .tpc_begin(id, user, description, extension, tid, status)
      .map(|_| Reply::Ok),
    Request::Storea {
      oid,
      serial,
      data,
      refs,
      version,
      id,
    } => session
      .storea(
        BufferedStore {
          oid,
          serial,
          data,
          refs,
          version,
        },
        id,
      )
      .map(|_| Reply::Ok),
    Request::TpcVote { id } => session.tpc_vote(id).await.map(|_| Reply::Ok),
    Request::TpcFinish { id } => session.tpc_finish(id).await.map(Reply::MaybeTid),
    Request::TpcAbort { id } => session.tpc_abort(id).await.map(|_| Reply::Ok),
    Request::Undo { tid } => session.undo(tid).await.map(Reply::Oids),
    Request::UndoLog { first, last } => session
      .undo_log(first, last)
      .await
      .map(Reply::Transactions),
    Request::UndoInfo { first, last, spec } => session
      .undo_info(first, last, spec)
      .await
      .map(Reply::Transactions),
    Request::Pack { time, wait } => session.pack(time, wait).await.map(|_| Reply::Ok),
  };
  reply.map_err(WireError::from)
}

async fn handle_connection(socket: TcpStream, peer: SocketAddr, server: Arc<StorageServer>) {
  if let Err(err) = socket.set_nodelay(true) {
    debug!(peer = %peer, error = %err, "failed to set TCP_NODELAY");
  };
  let (read_half, write_half) = socket.into_split();
  let (out_tx, mut out_rx) = mpsc::unbounded_channel();
  let (closed_tx, mut closed) = watch::channel(false);
  let client = Arc::new(ConnectionClient {
    out: out_tx,
    closed: closed_tx,
  });

  let writer = tokio::spawn({
    let mut closed = client.closed.subscribe();
    async move {
      let mut frames = FramedWrite::new(write_half, codec());
      loop {
        let msg = tokio::select! {
          msg = out_rx.recv() => msg,
          _ = wait_closed(&mut closed) => None,
        };
        let Some(msg) = msg else {
          break;
        };
        if let Err(err) = frames.send(encode(&msg)).await {
          debug!(peer = %peer, error = %err, "write failed");
          break;
        };
      }
    }
  });

  let (req_tx, mut req_rx) = mpsc::unbounded_channel::<ClientMessage>();
  let reader = tokio::spawn({
    let client = client.clone();
    async move {
      let mut frames = FramedRead::new(read_half, codec());
      while let Some(frame) = frames.next().await {
        let msg = match frame {
          Ok(raw) => decode::<ClientMessage>(&raw).map_err(|err| err.to_string()),
          Err(err) => Err(err.to_string()),
        };
        match msg {
          Ok(msg) => {
            if req_tx.send(msg).is_err() {
              break;
            };
          }
          Err(err) => {
            debug!(peer = %peer, error = %err, "bad frame");
            break;
          }
        };
      }
      client.close();
    }
  });

  let mut session = server.connect(client.clone(), peer.to_string());
  debug!(peer = %peer, session = session.id(), "connection opened");
  loop {
    let msg = tokio::select! {
      msg = req_rx.recv() => msg,
      _ = wait_closed(&mut closed) => None,
    };
    let Some(msg) = msg else {
      break;
    };
    // Dropping the call future is how an in-flight call is cancelled.
    let result = tokio::select! {
      result = handle_request(&mut session, msg.request) => result,
      _ = wait_closed(&mut closed) => break,
    };
    client.send(ServerMessage::Reply {
      msgid: msg.msgid,
      result,
    });
  }

  session.disconnect().await;
  client.close();
  reader.abort();
  let _ = writer.await;
  debug!(peer = %peer, "connection closed");
}

/// Accepts connections until the server starts closing.
pub async fn start_zeo_server_loop(listener: TcpListener, server: Arc<StorageServer>) {
  if let Ok(addr) = listener.local_addr() {
    info!(interface = addr.ip().to_string(), port = addr.port(), "starting server");
  };
  loop {
    let (socket, peer) = match listener.accept().await {
      Ok(conn) => conn,
      Err(err) => {
        warn!(error = %err, "failed to accept connection");
        continue;
      }
    };
    if server.is_closing() {
      break;
    };
    tokio::spawn(handle_connection(socket, peer, server.clone()));
  }
}
