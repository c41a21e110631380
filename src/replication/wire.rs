//! Wire messages and frame codec for the replication stream.
//!
//! Both streams speak length-prefixed protobuf over TCP: a u32 big-endian
//! byte count followed by one encoded message. The follower opens a
//! connection, sends a single [`ReplicaRequest`], and the leader answers
//! with a sequence of [`StreamChunk`] frames. A snapshot stream ends with
//! one empty-payload chunk before the leader closes the connection; the
//! oplog stream is unbounded and only ends by cancellation or disconnect.

use crate::error::{Result, SkiffError};
use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;
pub const SNAPSHOT_CHUNK_BYTES: usize = 1024 * 1024;

#[derive(Clone, PartialEq, Message)]
pub struct SnapshotRequest {}

#[derive(Clone, PartialEq, Message)]
pub struct OplogRequest {
  /// 12-byte resume offset; empty means "from the beginning".
  #[prost(bytes = "vec", tag = "1")]
  pub offset: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ReplicaRequest {
  #[prost(oneof = "replica_request::Body", tags = "1, 2")]
  pub body: Option<replica_request::Body>,
}

pub mod replica_request {
  #[derive(Clone, PartialEq, prost::Oneof)]
  pub enum Body {
    #[prost(message, tag = "1")]
    Snapshot(super::SnapshotRequest),
    #[prost(message, tag = "2")]
    Oplog(super::OplogRequest),
  }
}

#[derive(Clone, PartialEq, Message)]
pub struct StreamChunk {
  #[prost(bytes = "vec", tag = "1")]
  pub payload: Vec<u8>,
}

pub async fn write_frame<M, W>(stream: &mut W, message: &M) -> Result<()>
where
  M: Message,
  W: AsyncWrite + Unpin,
{
  let len = message.encoded_len();
  if len > MAX_FRAME_BYTES {
    return Err(SkiffError::Runtime(format!("frame too large: {len} bytes")));
  }
  let mut buf = Vec::with_capacity(4 + len);
  buf.extend_from_slice(&(len as u32).to_be_bytes());
  message
    .encode(&mut buf)
    .map_err(|error| SkiffError::Runtime(format!("encode frame: {error}")))?;
  stream.write_all(&buf).await?;
  Ok(())
}

/// Reads one frame; `None` on a clean end-of-stream at a frame boundary.
pub async fn read_frame<M, R>(stream: &mut R) -> Result<Option<M>>
where
  M: Message + Default,
  R: AsyncRead + Unpin,
{
  let mut len_bytes = [0u8; 4];
  match stream.read_exact(&mut len_bytes).await {
    Ok(_) => {}
    Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
    Err(error) => return Err(error.into()),
  }

  let len = u32::from_be_bytes(len_bytes) as usize;
  if len > MAX_FRAME_BYTES {
    return Err(SkiffError::Runtime(format!("frame too large: {len} bytes")));
  }

  let mut payload = vec![0u8; len];
  stream.read_exact(&mut payload).await?;
  let message =
    M::decode(payload.as_slice()).map_err(|error| SkiffError::Runtime(format!("decode frame: {error}")))?;
  Ok(Some(message))
}
