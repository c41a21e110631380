//! Leader node identity.

use std::fmt;

/// The node a follower replicates from. A database holds one of these
/// exactly while it is in the following role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
  host: String,
  port: u16,
}

impl Node {
  pub fn new(host: impl Into<String>, port: u16) -> Node {
    Node {
      host: host.into(),
      port,
    }
  }

  pub fn host(&self) -> &str {
    &self.host
  }

  pub fn port(&self) -> u16 {
    self.port
  }

  pub fn address(&self) -> String {
    format!("{}:{}", self.host, self.port)
  }
}

impl fmt::Display for Node {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.address())
  }
}
