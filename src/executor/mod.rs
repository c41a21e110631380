//! Command classification and execution.
//!
//! Command names resolve once into the closed [`Command`] enum; from there
//! the match in [`exec`] is exhaustive, so adding a command without wiring
//! its execution is a compile error. Unrecognized names become
//! [`Command::Unknown`] and classify as `System`, which keeps
//! unknown-command handling in execution rather than classification.

mod kv;
mod system;

use crate::error::{Result, SkiffError};
use crate::storage::Storage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
  System,
  Read,
  Write,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
  Ping,
  Echo,
  Quit,
  Shutdown,
  SlaveOf,
  Get,
  Keys,
  Scan,
  Ttl,
  Exists,
  Set,
  SetNx,
  Del,
  Incr,
  Unknown(String),
}

impl Command {
  /// Case-insensitive resolution of a wire command name.
  pub fn parse(name: &[u8]) -> Command {
    let name = String::from_utf8_lossy(name).to_string();
    match name.to_ascii_uppercase().as_str() {
      "PING" => Command::Ping,
      "ECHO" => Command::Echo,
      "QUIT" => Command::Quit,
      "SHUTDOWN" => Command::Shutdown,
      "SLAVEOF" => Command::SlaveOf,
      "GET" => Command::Get,
      "KEYS" => Command::Keys,
      "SCAN" => Command::Scan,
      "TTL" => Command::Ttl,
      "EXISTS" => Command::Exists,
      "SET" => Command::Set,
      "SETNX" => Command::SetNx,
      "DEL" => Command::Del,
      "INCR" => Command::Incr,
      _ => Command::Unknown(name),
    }
  }

  pub fn kind(&self) -> Kind {
    match self {
      Command::Ping
      | Command::Echo
      | Command::Quit
      | Command::Shutdown
      | Command::SlaveOf
      | Command::Unknown(_) => Kind::System,
      Command::Get | Command::Keys | Command::Scan | Command::Ttl | Command::Exists => {
        Kind::Read
      }
      Command::Set | Command::SetNx | Command::Del | Command::Incr => Kind::Write,
    }
  }

  pub fn is_write(&self) -> bool {
    self.kind() == Kind::Write
  }
}

/// Protocol-independent side effect carried alongside a reply. The
/// front-end (or the orchestrator, for role changes) translates these;
/// the executor itself never touches a connection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Action {
  #[default]
  None,
  /// Close this client connection.
  Close,
  /// Shut the whole server down.
  Shutdown,
  /// Start replicating from the given leader.
  SlaveOf { host: String, port: u16 },
  /// Stop replicating and resume leader duty.
  Unfollow,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
  /// Protocol-encoded reply bytes.
  pub output: Vec<u8>,
  pub action: Action,
}

impl Outcome {
  pub(crate) fn output(output: Vec<u8>) -> Outcome {
    Outcome {
      output,
      action: Action::None,
    }
  }

  pub(crate) fn with_action(output: Vec<u8>, action: Action) -> Outcome {
    Outcome { output, action }
  }
}

/// Runs one command against `storage`. `args[0]` is the command name,
/// the rest are its parameters; arity is validated before any storage
/// access.
pub fn exec(command: &Command, storage: &dyn Storage, args: &[Vec<u8>]) -> Result<Outcome> {
  match command {
    Command::Ping => system::ping(args),
    Command::Echo => system::echo(args),
    Command::Quit => system::quit(),
    Command::Shutdown => system::shutdown(),
    Command::SlaveOf => system::slave_of(args),
    Command::Get => kv::get(storage, args),
    Command::Keys => kv::keys(storage, args),
    Command::Scan => kv::scan(storage, args),
    Command::Ttl => kv::ttl(storage, args),
    Command::Exists => kv::exists(storage, args),
    Command::Set => kv::set(storage, args),
    Command::SetNx => kv::setnx(storage, args),
    Command::Del => kv::del(storage, args),
    Command::Incr => kv::incr(storage, args),
    Command::Unknown(name) => Err(SkiffError::UnknownCommand(name.clone())),
  }
}

#[cfg(test)]
mod tests {
  use super::{Command, Kind};

  #[test]
  fn classification_is_case_insensitive() {
    assert_eq!(Command::parse(b"get"), Command::Get);
    assert_eq!(Command::parse(b"GeT"), Command::Get);
    assert_eq!(Command::parse(b"SET").kind(), Kind::Write);
    assert_eq!(Command::parse(b"keys").kind(), Kind::Read);
    assert_eq!(Command::parse(b"slaveof").kind(), Kind::System);
  }

  #[test]
  fn unrecognized_names_classify_as_system() {
    let command = Command::parse(b"FLUSHALL");
    assert_eq!(command, Command::Unknown("FLUSHALL".to_string()));
    assert_eq!(command.kind(), Kind::System);
    assert!(!command.is_write());
  }
}
