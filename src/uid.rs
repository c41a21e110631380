//! 12-byte time-sortable log identifiers.
//!
//! A `LogId` is the correlation token written at the head of every oplog
//! record and the offset a follower resumes the oplog stream from. Byte
//! layout: 4-byte big-endian unix seconds, 5-byte process discriminator
//! (3 random bytes plus the pid), 3-byte big-endian counter. Within one
//! process, byte-lexicographic order equals generation order even under
//! concurrent callers.

use rand::RngCore;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

pub const LOG_ID_SIZE: usize = 12;

/// Packed (seconds << 24 | counter) of the most recently issued id. The
/// CAS loop below never moves it backwards, which is what makes ids
/// monotonic even when the wall clock rewinds.
static CLOCK: AtomicU64 = AtomicU64::new(0);

const COUNTER_BITS: u32 = 24;
const COUNTER_MASK: u64 = (1 << COUNTER_BITS) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogId([u8; LOG_ID_SIZE]);

impl LogId {
  /// Issues the next id. Collision-free for the process lifetime and
  /// strictly increasing under byte comparison.
  pub fn generate() -> LogId {
    let now = unix_seconds();
    let mut packed;
    loop {
      let prev = CLOCK.load(Ordering::SeqCst);
      let prev_seconds = (prev >> COUNTER_BITS) as u32;
      packed = if now > prev_seconds {
        u64::from(now) << COUNTER_BITS
      } else {
        // Same second, or a rewound clock: keep counting. A counter
        // overflow carries into the seconds field, which stays monotonic.
        prev + 1
      };
      if CLOCK
        .compare_exchange(prev, packed, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
      {
        break;
      }
    }

    let seconds = (packed >> COUNTER_BITS) as u32;
    let counter = (packed & COUNTER_MASK) as u32;

    let mut bytes = [0u8; LOG_ID_SIZE];
    bytes[..4].copy_from_slice(&seconds.to_be_bytes());
    bytes[4..9].copy_from_slice(discriminator());
    bytes[9..].copy_from_slice(&counter.to_be_bytes()[1..]);
    LogId(bytes)
  }

  pub fn as_bytes(&self) -> &[u8; LOG_ID_SIZE] {
    &self.0
  }

  /// Reconstructs an id from its wire form. `None` unless exactly 12 bytes.
  pub fn from_bytes(bytes: &[u8]) -> Option<LogId> {
    let bytes: [u8; LOG_ID_SIZE] = bytes.try_into().ok()?;
    Some(LogId(bytes))
  }

  pub fn seconds(&self) -> u32 {
    let mut prefix = [0u8; 4];
    prefix.copy_from_slice(&self.0[..4]);
    u32::from_be_bytes(prefix)
  }
}

impl fmt::Display for LogId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for byte in &self.0 {
      write!(f, "{byte:02x}")?;
    }
    Ok(())
  }
}

fn unix_seconds() -> u32 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .as_secs() as u32
}

/// Random-plus-pid middle section, fixed for the process lifetime. Keeps
/// ids from two processes on the same host from colliding.
fn discriminator() -> &'static [u8; 5] {
  static DISCRIMINATOR: OnceLock<[u8; 5]> = OnceLock::new();
  DISCRIMINATOR.get_or_init(|| {
    let mut bytes = [0u8; 5];
    rand::thread_rng().fill_bytes(&mut bytes[..3]);
    let pid = std::process::id() as u16;
    bytes[3..].copy_from_slice(&pid.to_be_bytes());
    bytes
  })
}

#[cfg(test)]
mod tests {
  use super::{LogId, LOG_ID_SIZE};
  use std::collections::HashSet;
  use std::thread;

  #[test]
  fn sequential_ids_increase_in_byte_order() {
    let mut previous = LogId::generate();
    for _ in 0..10_000 {
      let next = LogId::generate();
      assert!(next > previous, "{next} !> {previous}");
      assert!(next.as_bytes() > previous.as_bytes());
      previous = next;
    }
  }

  #[test]
  fn concurrent_ids_are_unique() {
    let handles: Vec<_> = (0..8)
      .map(|_| {
        thread::spawn(|| (0..2_000).map(|_| LogId::generate()).collect::<Vec<_>>())
      })
      .collect();

    let mut seen = HashSet::new();
    for handle in handles {
      for id in handle.join().expect("join id thread") {
        assert!(seen.insert(id), "duplicate id {id}");
      }
    }
    assert_eq!(seen.len(), 16_000);
  }

  #[test]
  fn wire_roundtrip() {
    let id = LogId::generate();
    let parsed = LogId::from_bytes(id.as_bytes()).expect("parse id bytes");
    assert_eq!(parsed, id);

    assert!(LogId::from_bytes(&[0u8; LOG_ID_SIZE - 1]).is_none());
    assert!(LogId::from_bytes(&[0u8; LOG_ID_SIZE + 1]).is_none());
  }

  #[test]
  fn display_is_fixed_width_hex() {
    let id = LogId::generate();
    let text = id.to_string();
    assert_eq!(text.len(), 24);
    assert!(text.bytes().all(|b| b.is_ascii_hexdigit()));
  }
}
