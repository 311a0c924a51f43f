use super::map_range;
use super::ByteStore;
use super::WriteBatch;
use async_trait::async_trait;
use parking_lot::Mutex;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::BufWriter;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::spawn_blocking;
use tracing::debug;
use tracing::info;
use tracing::warn;

pub const LOG_FILE_NAME: &str = "commit.log";
pub const SNAPSHOT_FILE_NAME: &str = "snapshot";
const SNAPSHOT_TMP_FILE_NAME: &str = "snapshot.tmp";

struct CommitLog {
  file: File,
  // Length of the valid prefix; anything after this is a failed partial write.
  len: u64,
  closed: bool,
}

struct Inner {
  dir: PathBuf,
  map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
  log: Mutex<CommitLog>,
  snapshot_write_buffer: usize,
}

/// Keeps every entry in memory. Each commit is appended to `commit.log` as a `[u32 BE len][msgpack batch]` frame and fsynced; checkpoints write the whole map to `snapshot` and truncate the log.
#[derive(Clone)]
pub struct FileByteStore(Arc<Inner>);

fn invalid_data(what: &str, err: impl std::fmt::Display) -> io::Error {
  io::Error::new(io::ErrorKind::InvalidData, format!("{what}: {err}"))
}

/// Applies every intact frame and returns the length of the intact prefix and the number of frames in it.
fn replay_log(raw: &[u8], map: &mut BTreeMap<Vec<u8>, Vec<u8>>) -> (usize, usize) {
  let mut pos = 0;
  let mut frames = 0;
  while raw.len() - pos >= 4 {
    let mut len_raw = [0u8; 4];
    len_raw.copy_from_slice(&raw[pos..pos + 4]);
    let start = pos + 4;
    let Some(end) = start
      .checked_add(u32::from_be_bytes(len_raw) as usize)
      .filter(|end| *end <= raw.len())
    else {
      break;
    };
    let Ok(batch) = rmp_serde::from_slice::<WriteBatch>(&raw[start..end]) else {
      break;
    };
    batch.apply_to(map);
    pos = end;
    frames += 1;
  }
  (pos, frames)
}

impl FileByteStore {
  /// Loads the latest snapshot and replays the commit log on top of it. This blocks on file I/O.
  pub fn open(dir: &Path, snapshot_write_buffer: usize) -> io::Result<Self> {
    let mut map: BTreeMap<Vec<u8>, Vec<u8>> = match fs::read(dir.join(SNAPSHOT_FILE_NAME)) {
      Ok(raw) => rmp_serde::from_slice(&raw).map_err(|err| invalid_data("snapshot", err))?,
      Err(err) if err.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
      Err(err) => return Err(err),
    };

    let mut file = OpenOptions::new()
      .read(true)
      .append(true)
      .create(true)
      .open(dir.join(LOG_FILE_NAME))?;
    let mut raw = Vec::new();
    file.read_to_end(&mut raw)?;
    let (valid_len, frames) = replay_log(&raw, &mut map);
    if valid_len < raw.len() {
      warn!(
        valid_bytes = valid_len,
        discarded_bytes = raw.len() - valid_len,
        "discarding torn commit log tail"
      );
      file.set_len(valid_len as u64)?;
      file.sync_data()?;
    };
    info!(
      dir = %dir.display(),
      entries = map.len(),
      replayed_frames = frames,
      "opened byte store"
    );

    Ok(Self(Arc::new(Inner {
      dir: dir.to_path_buf(),
      map: RwLock::new(map),
      log: Mutex::new(CommitLog {
        file,
        len: valid_len as u64,
        closed: false,
      }),
      snapshot_write_buffer: snapshot_write_buffer.max(4096),
    })))
  }

  /// Bytes appended to the commit log since the last checkpoint.
  pub fn log_len(&self) -> u64 {
    self.0.log.lock().len
  }
}

impl Inner {
  fn commit(&self, batch: WriteBatch) -> io::Result<()> {
    let mut log = self.log.lock();
    if log.closed {
      return Err(io::Error::new(io::ErrorKind::Other, "byte store is closed"));
    };
    let mut payload = Vec::new();
    batch
      .serialize(&mut rmp_serde::Serializer::new(&mut payload))
      .unwrap();
    let len = u32::try_from(payload.len())
      .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "write batch is too large"))?;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    let written = log
      .file
      .write_all(&frame)
      .and_then(|_| log.file.sync_data());
    if let Err(err) = written {
      // Later frames must not land after a partial one.
      let _ = log.file.set_len(log.len);
      return Err(err);
    };
    log.len += frame.len() as u64;
    // Applied while still holding the log lock so that memory order matches log order.
    batch.apply_to(&mut self.map.write());
    Ok(())
  }

  fn checkpoint(&self, min_log_bytes: u64, force: bool) -> io::Result<bool> {
    let mut log = self.log.lock();
    if log.closed {
      return Ok(false);
    };
    if !force && (log.len == 0 || log.len < min_log_bytes) {
      return Ok(false);
    };
    let tmp_path = self.dir.join(SNAPSHOT_TMP_FILE_NAME);
    {
      let mut out = BufWriter::with_capacity(self.snapshot_write_buffer, File::create(&tmp_path)?);
      self
        .map
        .read()
        .serialize(&mut rmp_serde::Serializer::new(&mut out))
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
      out.flush()?;
      out.get_ref().sync_all()?;
    };
    fs::rename(&tmp_path, self.dir.join(SNAPSHOT_FILE_NAME))?;
    File::open(&self.dir)?.sync_all()?;
    log.file.set_len(0)?;
    log.file.sync_data()?;
    debug!(log_bytes = log.len, "checkpointed byte store");
    log.len = 0;
    Ok(true)
  }

  fn close(&self) -> io::Result<()> {
    let mut log = self.log.lock();
    if log.closed {
      return Ok(());
    };
    log.closed = true;
    log.file.sync_all()
  }
}

#[async_trait]
impl ByteStore for FileByteStore {
  fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
    self.0.map.read().get(key).cloned()
  }

  fn range(&self, start: &[u8], end: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
    map_range(&self.0.map.read(), start, end)
      .map(|(k, v)| (k.clone(), v.clone()))
      .collect()
  }

  fn last_in_range(&self, start: &[u8], end: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
    map_range(&self.0.map.read(), start, end)
      .next_back()
      .map(|(k, v)| (k.clone(), v.clone()))
  }

  async fn commit(&self, batch: WriteBatch) -> io::Result<()> {
    spawn_blocking({
      let inner = self.0.clone();
      move || inner.commit(batch)
    })
    .await
    .unwrap()
  }

  async fn checkpoint(&self, min_log_bytes: u64, force: bool) -> io::Result<bool> {
    spawn_blocking({
      let inner = self.0.clone();
      move || inner.checkpoint(min_log_bytes, force)
    })
    .await
    .unwrap()
  }

  async fn close(&self) -> io::Result<()> {
    spawn_blocking({
      let inner = self.0.clone();
      move || inner.close()
    })
    .await
    .unwrap()
  }
}
