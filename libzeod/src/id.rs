use chrono::DateTime;
use chrono::Datelike;
use chrono::TimeZone;
use chrono::Timelike;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::fmt::Display;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::Relaxed;

/// 2^32 / 60: the low word of a tid counts fractions of a minute in these units.
const SECONDS_SCALE: f64 = 4294967296.0 / 60.0;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default, Serialize, Deserialize)]
pub struct Oid(pub u64);

impl Oid {
  pub const ROOT: Oid = Oid(0);

  pub fn to_bytes(self) -> [u8; 8] {
    self.0.to_be_bytes()
  }

  pub fn from_bytes(raw: [u8; 8]) -> Self {
    Self(u64::from_be_bytes(raw))
  }
}

impl Display for Oid {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "0x{:016x}", self.0)
  }
}

/// Transaction id. Ordering follows commit order.
///
/// The upper 32 bits hold the minutes elapsed since 1900-01-01 00:00 UTC, computed on a calendar where every month has 31 days; the lower 32 bits hold the seconds within that minute scaled by 2^32/60.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default, Serialize, Deserialize)]
pub struct Tid(pub u64);

impl Tid {
  /// Never written.
  pub const ZERO: Tid = Tid(0);

  pub fn now() -> Self {
    Self::from_datetime(Utc::now())
  }

  pub fn from_datetime(dt: DateTime<Utc>) -> Self {
    let year = i64::from(dt.year());
    if year < 1900 {
      return Self::ZERO;
    };
    let minutes = ((((year - 1900) * 12 + i64::from(dt.month0())) * 31 + i64::from(dt.day0())) * 24
      + i64::from(dt.hour()))
      * 60
      + i64::from(dt.minute());
    let Ok(minutes) = u32::try_from(minutes) else {
      return Tid(u64::MAX);
    };
    let seconds = f64::from(dt.second()) + f64::from(dt.nanosecond() % 1_000_000_000) / 1e9;
    let low = (seconds * SECONDS_SCALE).min(f64::from(u32::MAX)) as u32;
    Tid((u64::from(minutes) << 32) | u64::from(low))
  }

  /// Returns `None` for tids that do not map to a real calendar date (e.g. day 31 of a 30-day month).
  pub fn to_datetime(self) -> Option<DateTime<Utc>> {
    let mut minutes = self.0 >> 32;
    let minute = minutes % 60;
    minutes /= 60;
    let hour = minutes % 24;
    minutes /= 24;
    let day = minutes % 31 + 1;
    minutes /= 31;
    let month = minutes % 12 + 1;
    let year = minutes / 12 + 1900;
    let seconds = (self.0 & 0xffff_ffff) as f64 / SECONDS_SCALE;
    let whole = seconds.floor();
    let nanos = ((seconds - whole) * 1e9) as u32;
    Utc
      .with_ymd_and_hms(
        i32::try_from(year).ok()?,
        month as u32,
        day as u32,
        hour as u32,
        minute as u32,
        (whole as u32).min(59),
      )
      .single()
      .map(|dt| dt + chrono::Duration::nanoseconds(i64::from(nanos)))
  }

  /// Returns `self` if it sorts after `prev`, otherwise the smallest tid after `prev`. `None` if no tid sorts after `prev`.
  pub fn later_than(self, prev: Tid) -> Option<Tid> {
    if self > prev {
      Some(self)
    } else {
      prev.0.checked_add(1).map(Tid)
    }
  }

  pub fn to_bytes(self) -> [u8; 8] {
    self.0.to_be_bytes()
  }

  pub fn from_bytes(raw: [u8; 8]) -> Self {
    Self(u64::from_be_bytes(raw))
  }
}

impl Display for Tid {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "0x{:016x}", self.0)
  }
}

static NEXT_TRANSACTION_SERIAL_NO: AtomicU64 = AtomicU64::new(1);

/// Engine-level transaction. Two values refer to the same transaction iff their `serial_no` is equal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
  pub serial_no: u64,
  pub user: String,
  pub description: String,
  pub extension: Vec<u8>,
  pub status: u8,
}

impl Transaction {
  pub fn new(user: impl Into<String>, description: impl Into<String>, extension: Vec<u8>) -> Self {
    Self {
      serial_no: NEXT_TRANSACTION_SERIAL_NO.fetch_add(1, Relaxed),
      user: user.into(),
      description: description.into(),
      extension,
      status: b' ',
    }
  }

  pub fn is(&self, other: &Transaction) -> bool {
    self.serial_no == other.serial_no
  }
}

/// Metadata of a committed transaction, as returned by the undo log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionDescription {
  pub tid: Tid,
  pub user: String,
  pub description: String,
  pub extension: Vec<u8>,
  pub status: u8,
}
