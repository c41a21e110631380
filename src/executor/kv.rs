//! Key-value command execution.

use super::Outcome;
use crate::error::{Result, SkiffError};
use crate::resp;
use crate::storage::{ScanOptions, Storage};

/// Condition flag on SET.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SetMode {
  Always,
  /// Store only when the key is absent.
  IfAbsent,
  /// Store only when the key is present.
  IfPresent,
}

pub fn get(storage: &dyn Storage, args: &[Vec<u8>]) -> Result<Outcome> {
  if args.len() != 2 {
    return Err(SkiffError::Arity);
  }
  Ok(match storage.get(&args[1]) {
    Ok(Some(value)) => Outcome::output(resp::bulk(&value)),
    Ok(None) => Outcome::output(resp::null()),
    // Storage faults surface as an error reply so the connection stays
    // open; absence was already handled above.
    Err(error) => Outcome::output(resp::error(&error.to_string())),
  })
}

pub fn set(storage: &dyn Storage, args: &[Vec<u8>]) -> Result<Outcome> {
  if !(3..=6).contains(&args.len()) {
    return Err(SkiffError::Arity);
  }

  let key = &args[1];
  let value = &args[2];
  let mut ttl_millis = 0u64;
  let mut mode = SetMode::Always;

  let mut rest = args[3..].iter();
  while let Some(flag) = rest.next() {
    match flag.to_ascii_uppercase().as_slice() {
      b"EX" => {
        let seconds = parse_expiry(rest.next())?;
        ttl_millis = seconds.checked_mul(1000).ok_or(SkiffError::Syntax)?;
      }
      b"PX" => ttl_millis = parse_expiry(rest.next())?,
      b"NX" => mode = SetMode::IfAbsent,
      b"XX" => mode = SetMode::IfPresent,
      _ => return Err(SkiffError::Syntax),
    }
  }

  store(storage, key, value, ttl_millis, mode)
}

pub fn setnx(storage: &dyn Storage, args: &[Vec<u8>]) -> Result<Outcome> {
  if args.len() != 3 {
    return Err(SkiffError::Arity);
  }
  store(storage, &args[1], &args[2], 0, SetMode::IfAbsent)
}

fn store(
  storage: &dyn Storage,
  key: &[u8],
  value: &[u8],
  ttl_millis: u64,
  mode: SetMode,
) -> Result<Outcome> {
  let blocked = match mode {
    SetMode::Always => false,
    SetMode::IfAbsent => storage.get(key)?.is_some(),
    SetMode::IfPresent => storage.get(key)?.is_none(),
  };
  if blocked {
    return Ok(Outcome::output(resp::null()));
  }
  storage
    .set(key, value, ttl_millis)
    .map_err(|error| SkiffError::Runtime(error.to_string()))?;
  Ok(Outcome::output(resp::ok()))
}

fn parse_expiry(value: Option<&Vec<u8>>) -> Result<u64> {
  let digits = value.ok_or(SkiffError::Syntax)?;
  std::str::from_utf8(digits)
    .ok()
    .and_then(|text| text.parse::<u64>().ok())
    .ok_or(SkiffError::Syntax)
}

pub fn del(storage: &dyn Storage, args: &[Vec<u8>]) -> Result<Outcome> {
  if args.len() < 2 {
    return Err(SkiffError::Arity);
  }
  storage
    .del(&args[1..])
    .map_err(|error| SkiffError::Runtime(error.to_string()))?;
  // Count attempted, not count existing.
  Ok(Outcome::output(resp::integer((args.len() - 1) as i64)))
}

pub fn keys(storage: &dyn Storage, args: &[Vec<u8>]) -> Result<Outcome> {
  if args.len() != 2 {
    return Err(SkiffError::Arity);
  }
  scan_keys(storage, &args[1], 0)
}

pub fn scan(storage: &dyn Storage, args: &[Vec<u8>]) -> Result<Outcome> {
  let limit = match args.len() {
    2 => 0,
    4 if args[2].eq_ignore_ascii_case(b"COUNT") => {
      let parsed = parse_expiry(Some(&args[3]))?;
      usize::try_from(parsed).map_err(|_| SkiffError::Syntax)?
    }
    2..=4 => return Err(SkiffError::Syntax),
    _ => return Err(SkiffError::Arity),
  };
  scan_keys(storage, &args[1], limit)
}

fn scan_keys(storage: &dyn Storage, pattern: &[u8], limit: usize) -> Result<Outcome> {
  let options = ScanOptions {
    pattern: String::from_utf8_lossy(pattern).to_string(),
    limit,
    include_values: false,
  };
  let pairs = storage.scan(&options)?;
  let keys: Vec<Vec<u8>> = pairs.into_iter().map(|pair| pair.key).collect();
  Ok(Outcome::output(resp::array(&keys)))
}

pub fn ttl(storage: &dyn Storage, args: &[Vec<u8>]) -> Result<Outcome> {
  if args.len() != 2 {
    return Err(SkiffError::Arity);
  }
  let code = match storage.ttl(&args[1])? {
    None => -2,
    Some(0) => -1,
    Some(millis) => (millis / 1000) as i64,
  };
  Ok(Outcome::output(resp::integer(code)))
}

pub fn exists(storage: &dyn Storage, args: &[Vec<u8>]) -> Result<Outcome> {
  if args.len() < 2 {
    return Err(SkiffError::Arity);
  }
  let mut count = 0i64;
  for key in &args[1..] {
    if storage.get(key)?.is_some() {
      count += 1;
    }
  }
  Ok(Outcome::output(resp::integer(count)))
}

pub fn incr(storage: &dyn Storage, args: &[Vec<u8>]) -> Result<Outcome> {
  if args.len() != 2 {
    return Err(SkiffError::Arity);
  }
  let key = &args[1];
  let next = match storage.get(key)? {
    None => 1,
    Some(current) => {
      let parsed = std::str::from_utf8(&current)
        .ok()
        .and_then(|text| text.parse::<i64>().ok())
        .ok_or_else(|| {
          SkiffError::Runtime("value is not an integer or out of range".to_string())
        })?;
      parsed + 1
    }
  };
  storage
    .set(key, next.to_string().as_bytes(), 0)
    .map_err(|error| SkiffError::Runtime(error.to_string()))?;
  Ok(Outcome::output(resp::integer(next)))
}
