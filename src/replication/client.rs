//! Follower-side bootstrap and replay.
//!
//! Entering the following role is a three-step handshake: pick the resume
//! offset *first*, pull a full snapshot into local storage, then tail the
//! leader's oplog from that offset. Choosing the offset before the
//! snapshot request means any write the leader accepts while the snapshot
//! is in flight lands at or after the offset and is replayed. Replaying a
//! write the snapshot already contains is harmless (log order makes the
//! last writer win); losing one is not.

use super::wire::{self, replica_request, OplogRequest, ReplicaRequest, SnapshotRequest, StreamChunk};
use crate::db::{Database, Node};
use crate::error::{ReplicationPhase, Result, SkiffError};
use crate::resp;
use crate::uid::LogId;
use std::io::{Seek, SeekFrom, Write};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info};

pub(crate) async fn follow(
  db: Arc<Database>,
  node: Node,
  cancel: watch::Receiver<bool>,
) -> Result<()> {
  let offset = LogId::generate();
  info!(%node, %offset, "fetching snapshot");
  fetch_and_load_snapshot(&db, &node, cancel.clone()).await?;

  info!(%node, "fetching oplog");
  replay_oplog(&db, &node, offset, cancel).await
}

async fn fetch_and_load_snapshot(
  db: &Arc<Database>,
  node: &Node,
  mut cancel: watch::Receiver<bool>,
) -> Result<()> {
  let phase = ReplicationPhase::SnapshotStream;
  let mut stream = connect(node, phase).await?;
  let request = ReplicaRequest {
    body: Some(replica_request::Body::Snapshot(SnapshotRequest {})),
  };
  wire::write_frame(&mut stream, &request)
    .await
    .map_err(|error| error.in_phase(phase))?;

  // Spool to a local file first so storage is never half-replaced by a
  // stream that dies midway.
  let mut spool = tempfile::NamedTempFile::new_in(db.dir())
    .map_err(|error| SkiffError::from(error).in_phase(phase))?;
  let mut complete = false;
  while !complete {
    let chunk = tokio::select! {
      _ = cancel.changed() => return Err(SkiffError::Cancelled.in_phase(phase)),
      chunk = wire::read_frame::<StreamChunk, _>(&mut stream) => {
        chunk.map_err(|error| error.in_phase(phase))?
      }
    };
    match chunk {
      Some(chunk) if chunk.payload.is_empty() => complete = true,
      Some(chunk) => spool
        .write_all(&chunk.payload)
        .map_err(|error| SkiffError::from(error).in_phase(phase))?,
      None => {
        return Err(
          SkiffError::Runtime("snapshot stream ended before completion".to_string())
            .in_phase(phase),
        )
      }
    }
  }

  let phase = ReplicationPhase::SnapshotLoad;
  spool
    .flush()
    .map_err(|error| SkiffError::from(error).in_phase(phase))?;
  let mut file = spool
    .reopen()
    .map_err(|error| SkiffError::from(error).in_phase(phase))?;
  file
    .seek(SeekFrom::Start(0))
    .map_err(|error| SkiffError::from(error).in_phase(phase))?;

  let storage = db.storage_handle();
  let load = tokio::task::spawn_blocking(move || storage.load_snapshot(&mut file));
  match load.await {
    Ok(result) => result.map_err(|error| error.in_phase(phase))?,
    Err(join_error) => {
      return Err(SkiffError::Runtime(format!("snapshot load task: {join_error}")).in_phase(phase))
    }
  }
  info!("snapshot loaded");
  Ok(())
}

async fn replay_oplog(
  db: &Arc<Database>,
  node: &Node,
  offset: LogId,
  mut cancel: watch::Receiver<bool>,
) -> Result<()> {
  let phase = ReplicationPhase::OplogFetch;
  let mut stream = connect(node, phase).await?;
  let request = ReplicaRequest {
    body: Some(replica_request::Body::Oplog(OplogRequest {
      offset: offset.as_bytes().to_vec(),
    })),
  };
  wire::write_frame(&mut stream, &request)
    .await
    .map_err(|error| error.in_phase(phase))?;

  let mut pending: Vec<u8> = Vec::new();
  loop {
    let chunk = tokio::select! {
      _ = cancel.changed() => return Ok(()),
      chunk = wire::read_frame::<StreamChunk, _>(&mut stream) => {
        chunk.map_err(|error| error.in_phase(ReplicationPhase::OplogFetch))?
      }
    };
    let Some(chunk) = chunk else {
      // The oplog stream is unbounded; the leader hanging up is a failure.
      return Err(
        SkiffError::Runtime("oplog stream ended unexpectedly".to_string())
          .in_phase(ReplicationPhase::OplogFetch),
      );
    };

    pending.extend_from_slice(&chunk.payload);
    let mut last_applied = None;
    loop {
      match resp::decode_record(&pending)
        .map_err(|error| error.in_phase(ReplicationPhase::OplogDecode))?
      {
        Some((record, consumed)) => {
          pending.drain(..consumed);
          debug!(id = %record.id, "replaying record");
          db.iexec(&record.args)
            .map_err(|error| error.in_phase(ReplicationPhase::Replay))?;
          last_applied = Some(record.id);
        }
        None => break,
      }
    }

    if let Some(id) = last_applied {
      // Progress bookkeeping only; a failure here must not kill the link.
      if let Err(error) = db.follow_cursor().mark_applied(id) {
        debug!(%error, "follow cursor update failed");
      }
    }
  }
}

async fn connect(node: &Node, phase: ReplicationPhase) -> Result<TcpStream> {
  TcpStream::connect(node.address())
    .await
    .map_err(|error| SkiffError::from(error).in_phase(phase))
}
