//! Storage contract consumed by the executor and the replication path.
//!
//! The concrete on-disk engine lives outside this crate; everything here
//! talks to it through [`Storage`]. [`MemoryStorage`] is the bundled
//! engine used by tests and by deployments that can afford to rebuild
//! state from a leader.

mod memory;

pub use memory::MemoryStorage;

use crate::error::Result;
use std::io::{Read, Write};

/// Options for a pattern scan.
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
  /// Glob pattern matched against keys (`*` and `?` wildcards).
  pub pattern: String,
  /// Maximum pairs to return; `0` means unbounded.
  pub limit: usize,
  /// Whether values are materialized in the result.
  pub include_values: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
  pub key: Vec<u8>,
  /// `None` unless the scan requested values.
  pub value: Option<Vec<u8>>,
}

/// The narrow capability set the core depends on.
///
/// Absence is data, not an error: `get` answers `None` for a missing key
/// and `ttl` answers `None` for a missing key / `Some(0)` for a key with
/// no expiry. Engines are expected to provide per-key atomicity; nothing
/// here spans keys.
pub trait Storage: Send + Sync {
  fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

  /// Upserts `key`. `ttl_millis == 0` means the key never expires.
  fn set(&self, key: &[u8], value: &[u8], ttl_millis: u64) -> Result<()>;

  fn del(&self, keys: &[Vec<u8>]) -> Result<()>;

  fn scan(&self, options: &ScanOptions) -> Result<Vec<KvPair>>;

  /// Remaining lifetime in milliseconds, `Some(0)` for no expiry, `None`
  /// for an absent key.
  fn ttl(&self, key: &[u8]) -> Result<Option<u64>>;

  /// Writes a point-in-time export of the full keyspace to `sink`.
  fn snapshot(&self, sink: &mut dyn Write) -> Result<()>;

  /// Replaces the keyspace with a previously exported snapshot.
  fn load_snapshot(&self, source: &mut dyn Read) -> Result<()>;

  fn close(&self) -> Result<()>;
}
