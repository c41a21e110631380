//! In-memory storage engine with TTL support and binary snapshots.

use super::{KvPair, ScanOptions, Storage};
use crate::error::{Result, SkiffError};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::time::{SystemTime, UNIX_EPOCH};

const SNAPSHOT_MAGIC: &[u8; 4] = b"SKS1";
const SNAPSHOT_RECORD_TAG: u8 = 1;
const SNAPSHOT_END_TAG: u8 = 0;
const SNAPSHOT_FIELD_MAX_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone)]
struct Entry {
  value: Vec<u8>,
  /// Absolute expiry in unix milliseconds; `None` never expires.
  expires_at_millis: Option<u64>,
}

impl Entry {
  fn is_expired(&self, now_millis: u64) -> bool {
    self
      .expires_at_millis
      .is_some_and(|expires_at| expires_at <= now_millis)
  }
}

#[derive(Default)]
pub struct MemoryStorage {
  map: RwLock<HashMap<Vec<u8>, Entry>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }
}

impl Storage for MemoryStorage {
  fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
    let now = now_millis();
    let map = self.map.read();
    Ok(match map.get(key) {
      Some(entry) if !entry.is_expired(now) => Some(entry.value.clone()),
      _ => None,
    })
  }

  fn set(&self, key: &[u8], value: &[u8], ttl_millis: u64) -> Result<()> {
    let expires_at_millis = match ttl_millis {
      0 => None,
      ttl => Some(now_millis().saturating_add(ttl)),
    };
    self.map.write().insert(
      key.to_vec(),
      Entry {
        value: value.to_vec(),
        expires_at_millis,
      },
    );
    Ok(())
  }

  fn del(&self, keys: &[Vec<u8>]) -> Result<()> {
    let mut map = self.map.write();
    for key in keys {
      map.remove(key);
    }
    Ok(())
  }

  fn scan(&self, options: &ScanOptions) -> Result<Vec<KvPair>> {
    let now = now_millis();
    let map = self.map.read();
    let mut pairs: Vec<KvPair> = map
      .iter()
      .filter(|(key, entry)| {
        !entry.is_expired(now) && glob_match(options.pattern.as_bytes(), key)
      })
      .map(|(key, entry)| KvPair {
        key: key.clone(),
        value: options.include_values.then(|| entry.value.clone()),
      })
      .collect();
    pairs.sort_by(|left, right| left.key.cmp(&right.key));
    if options.limit > 0 && pairs.len() > options.limit {
      pairs.truncate(options.limit);
    }
    Ok(pairs)
  }

  fn ttl(&self, key: &[u8]) -> Result<Option<u64>> {
    let now = now_millis();
    let map = self.map.read();
    Ok(match map.get(key) {
      Some(entry) if !entry.is_expired(now) => match entry.expires_at_millis {
        Some(expires_at) => Some(expires_at - now),
        None => Some(0),
      },
      _ => None,
    })
  }

  fn snapshot(&self, sink: &mut dyn Write) -> Result<()> {
    // Point-in-time copy so a slow sink never holds the map lock.
    let now = now_millis();
    let entries: Vec<(Vec<u8>, Entry)> = {
      let map = self.map.read();
      map
        .iter()
        .filter(|(_, entry)| !entry.is_expired(now))
        .map(|(key, entry)| (key.clone(), entry.clone()))
        .collect()
    };

    sink.write_all(SNAPSHOT_MAGIC)?;
    let mut hasher = crc32fast::Hasher::new();
    let mut record = Vec::new();
    for (key, entry) in entries {
      record.clear();
      record.push(SNAPSHOT_RECORD_TAG);
      record.write_u32::<BigEndian>(key.len() as u32)?;
      record.extend_from_slice(&key);
      record.write_u32::<BigEndian>(entry.value.len() as u32)?;
      record.extend_from_slice(&entry.value);
      record.write_u64::<BigEndian>(entry.expires_at_millis.unwrap_or(0))?;
      hasher.update(&record);
      sink.write_all(&record)?;
    }

    let end = [SNAPSHOT_END_TAG];
    hasher.update(&end);
    sink.write_all(&end)?;

    let mut trailer = [0u8; 4];
    BigEndian::write_u32(&mut trailer, hasher.finalize());
    sink.write_all(&trailer)?;
    Ok(())
  }

  fn load_snapshot(&self, source: &mut dyn Read) -> Result<()> {
    let mut magic = [0u8; 4];
    source.read_exact(&mut magic)?;
    if &magic != SNAPSHOT_MAGIC {
      return Err(corrupt("invalid magic"));
    }

    let mut hasher = crc32fast::Hasher::new();
    let mut loaded = HashMap::new();
    loop {
      let mut tag = [0u8; 1];
      source.read_exact(&mut tag)?;
      hasher.update(&tag);
      if tag[0] == SNAPSHOT_END_TAG {
        break;
      }
      if tag[0] != SNAPSHOT_RECORD_TAG {
        return Err(corrupt("unknown record tag"));
      }

      let key = read_field(source, &mut hasher)?;
      let value = read_field(source, &mut hasher)?;
      let mut expiry = [0u8; 8];
      source.read_exact(&mut expiry)?;
      hasher.update(&expiry);
      let expires_at = BigEndian::read_u64(&expiry);

      loaded.insert(
        key,
        Entry {
          value,
          expires_at_millis: (expires_at != 0).then_some(expires_at),
        },
      );
    }

    let mut trailer = [0u8; 4];
    source.read_exact(&mut trailer)?;
    let stored = BigEndian::read_u32(&trailer);
    let computed = hasher.finalize();
    if stored != computed {
      return Err(corrupt(&format!(
        "checksum mismatch: stored {stored:08x}, computed {computed:08x}"
      )));
    }

    *self.map.write() = loaded;
    Ok(())
  }

  fn close(&self) -> Result<()> {
    Ok(())
  }
}

fn read_field(source: &mut dyn Read, hasher: &mut crc32fast::Hasher) -> Result<Vec<u8>> {
  let mut len_bytes = [0u8; 4];
  source.read_exact(&mut len_bytes)?;
  hasher.update(&len_bytes);
  let len = BigEndian::read_u32(&len_bytes) as usize;
  if len > SNAPSHOT_FIELD_MAX_BYTES {
    return Err(corrupt("field length out of range"));
  }
  let mut field = vec![0u8; len];
  source.read_exact(&mut field)?;
  hasher.update(&field);
  Ok(field)
}

fn corrupt(reason: &str) -> SkiffError {
  SkiffError::Runtime(format!("snapshot {reason}"))
}

fn now_millis() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .as_millis() as u64
}

/// Glob matching with `*` and `?`, iterative with single-star backtracking.
fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
  let (mut p, mut t) = (0usize, 0usize);
  let (mut star_p, mut star_t) = (usize::MAX, 0usize);
  while t < text.len() {
    if p < pattern.len() && (pattern[p] == b'?' || pattern[p] == text[t]) {
      p += 1;
      t += 1;
    } else if p < pattern.len() && pattern[p] == b'*' {
      star_p = p;
      star_t = t;
      p += 1;
    } else if star_p != usize::MAX {
      p = star_p + 1;
      star_t += 1;
      t = star_t;
    } else {
      return false;
    }
  }
  while p < pattern.len() && pattern[p] == b'*' {
    p += 1;
  }
  p == pattern.len()
}
