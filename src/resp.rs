//! RESP reply encoding and the framed oplog record codec.
//!
//! The oplog stores each mutation as a RESP array of `n + 1` bulk strings:
//! the 12-byte [`LogId`] followed by the command's arguments. The same
//! bytes travel over the replication stream, so a follower can replay a
//! record by stripping the id and executing the rest. [`decode_record`]
//! implements the partial-read contract the tailing reader depends on: an
//! incomplete buffer is reported as `Ok(None)`, never as an error.

use crate::error::{Result, SkiffError};
use crate::uid::LogId;

const CRLF: &[u8] = b"\r\n";

/// Upper bounds on decoded records. Anything past these is treated as
/// corruption rather than a frame we have not finished reading.
const MAX_RECORD_ELEMENTS: usize = 1024 * 1024;
const MAX_BULK_BYTES: usize = 512 * 1024 * 1024;

pub fn simple(text: &str) -> Vec<u8> {
  format!("+{text}\r\n").into_bytes()
}

pub fn ok() -> Vec<u8> {
  simple("OK")
}

pub fn error(message: &str) -> Vec<u8> {
  format!("-{message}\r\n").into_bytes()
}

pub fn integer(value: i64) -> Vec<u8> {
  format!(":{value}\r\n").into_bytes()
}

pub fn null() -> Vec<u8> {
  b"$-1\r\n".to_vec()
}

pub fn bulk(data: &[u8]) -> Vec<u8> {
  let mut out = format!("${}\r\n", data.len()).into_bytes();
  out.extend_from_slice(data);
  out.extend_from_slice(CRLF);
  out
}

/// Array of bulk strings, the shape `KEYS`/`SCAN` answer with.
pub fn array(items: &[Vec<u8>]) -> Vec<u8> {
  let mut out = format!("*{}\r\n", items.len()).into_bytes();
  for item in items {
    out.extend_from_slice(&bulk(item));
  }
  out
}

/// One decoded oplog record: the correlation id and the command it logged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
  pub id: LogId,
  pub args: Vec<Vec<u8>>,
}

/// Encodes `(id, args)` as one framed record.
pub fn encode_record(id: LogId, args: &[Vec<u8>]) -> Vec<u8> {
  let mut out = format!("*{}\r\n", args.len() + 1).into_bytes();
  out.extend_from_slice(&bulk(id.as_bytes()));
  for arg in args {
    out.extend_from_slice(&bulk(arg));
  }
  out
}

/// Decodes the first record in `buf`.
///
/// Returns `Ok(Some((record, consumed)))` when a full record is present,
/// `Ok(None)` when the buffer ends mid-record (read more and retry), and
/// `InvalidLogFormat` when the bytes cannot be a record at all.
pub fn decode_record(buf: &[u8]) -> Result<Option<(LogRecord, usize)>> {
  if buf.is_empty() {
    return Ok(None);
  }
  if buf[0] != b'*' {
    return Err(malformed("record must start with '*'"));
  }

  let Some((line, mut pos)) = read_line(buf, 1) else {
    return Ok(None);
  };
  let count = parse_length(line)?;
  if count < 1 {
    return Err(malformed("record array is empty"));
  }
  if count > MAX_RECORD_ELEMENTS {
    return Err(malformed("record array is implausibly long"));
  }

  let mut elements = Vec::with_capacity(count);
  for _ in 0..count {
    match read_bulk(buf, pos)? {
      Some((element, next)) => {
        elements.push(element);
        pos = next;
      }
      None => return Ok(None),
    }
  }

  let id = LogId::from_bytes(&elements[0])
    .ok_or_else(|| malformed("record id must be exactly 12 bytes"))?;
  elements.remove(0);

  Ok(Some((LogRecord { id, args: elements }, pos)))
}

fn read_bulk(buf: &[u8], pos: usize) -> Result<Option<(Vec<u8>, usize)>> {
  if pos >= buf.len() {
    return Ok(None);
  }
  if buf[pos] != b'$' {
    return Err(malformed("bulk element must start with '$'"));
  }
  let Some((line, data_start)) = read_line(buf, pos + 1) else {
    return Ok(None);
  };
  let len = parse_length(line)?;
  if len > MAX_BULK_BYTES {
    return Err(malformed("bulk element is implausibly long"));
  }
  let data_end = data_start + len;
  if buf.len() < data_end + CRLF.len() {
    return Ok(None);
  }
  if &buf[data_end..data_end + CRLF.len()] != CRLF {
    return Err(malformed("bulk element is not CRLF terminated"));
  }
  Ok(Some((buf[data_start..data_end].to_vec(), data_end + CRLF.len())))
}

/// Reads one CRLF-terminated line starting at `pos`; returns the line body
/// and the position just past the terminator, or `None` if the terminator
/// has not arrived yet.
fn read_line(buf: &[u8], pos: usize) -> Option<(&[u8], usize)> {
  let relative = buf[pos..].windows(CRLF.len()).position(|w| w == CRLF)?;
  let end = pos + relative;
  Some((&buf[pos..end], end + CRLF.len()))
}

fn parse_length(digits: &[u8]) -> Result<usize> {
  if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
    return Err(malformed("invalid length header"));
  }
  let text = std::str::from_utf8(digits).map_err(|_| malformed("invalid length header"))?;
  text
    .parse::<usize>()
    .map_err(|_| malformed("length header overflow"))
}

fn malformed(reason: &str) -> SkiffError {
  SkiffError::InvalidLogFormat(reason.to_string())
}
