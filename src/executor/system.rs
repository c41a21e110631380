//! System command execution. No storage access here; side effects are
//! carried upward as [`Action`]s.

use super::{Action, Outcome};
use crate::error::{Result, SkiffError};
use crate::resp;

pub fn ping(args: &[Vec<u8>]) -> Result<Outcome> {
  match args.len() {
    1 => Ok(Outcome::output(resp::simple("PONG"))),
    2 => Ok(Outcome::output(resp::bulk(&args[1]))),
    _ => Err(SkiffError::Arity),
  }
}

pub fn echo(args: &[Vec<u8>]) -> Result<Outcome> {
  if args.len() != 2 {
    return Err(SkiffError::Arity);
  }
  Ok(Outcome::output(resp::bulk(&args[1])))
}

pub fn quit() -> Result<Outcome> {
  Ok(Outcome::with_action(resp::ok(), Action::Close))
}

pub fn shutdown() -> Result<Outcome> {
  Ok(Outcome::with_action(resp::ok(), Action::Shutdown))
}

/// Validates `SLAVEOF host port` (or `SLAVEOF NO ONE`) and carries the
/// target upward; opening the leader connection is the orchestrator's job.
pub fn slave_of(args: &[Vec<u8>]) -> Result<Outcome> {
  if args.len() != 3 {
    return Err(SkiffError::Arity);
  }

  if args[1].eq_ignore_ascii_case(b"NO") && args[2].eq_ignore_ascii_case(b"ONE") {
    return Ok(Outcome::with_action(resp::ok(), Action::Unfollow));
  }

  let host = std::str::from_utf8(&args[1])
    .map_err(|_| SkiffError::Syntax)?
    .to_string();
  let port = std::str::from_utf8(&args[2])
    .ok()
    .and_then(|text| text.parse::<u16>().ok())
    .ok_or(SkiffError::Syntax)?;

  Ok(Outcome::with_action(resp::ok(), Action::SlaveOf { host, port }))
}
