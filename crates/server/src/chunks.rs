//! Background chunk generation.
//!
//! Requests for chunks the world has not generated yet are queued here so the
//! reactor never waits on terrain generation. Replies go back through the
//! host's [`SessionHandle`].

use crate::accounts::AccountStore;
use crate::session::SessionHandle;
use crate::world::{WorldError, WorldGate};
use blockhost_core::{ChunkPos, LockFacility};
use blockhost_net::{Chunk, ChunkUnchanged, ConnectionId, Message};
use std::io;
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// One outstanding chunk request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkJob {
    /// Requesting connection.
    pub conn: ConnectionId,
    /// Chunk wanted.
    pub position: ChunkPos,
    /// Timestamp of the requester's copy.
    pub timestamp: u32,
}

/// Reply for a chunk the world already holds.
pub fn loaded_reply(chunk: &Chunk, timestamp: u32) -> Message {
    if chunk.timestamp <= timestamp {
        ChunkUnchanged {
            position: chunk.position,
        }
        .into()
    } else {
        chunk.clone().into()
    }
}

/// Reply for `position`, generating the chunk first if needed.
pub fn chunk_reply<W: WorldGate + ?Sized>(
    world: &mut W,
    position: ChunkPos,
    timestamp: u32,
) -> Result<Message, WorldError> {
    if let Some(chunk) = world.chunk(position) {
        return Ok(loaded_reply(chunk, timestamp));
    }
    let chunk = world.generate_chunk(position)?;
    Ok(loaded_reply(&chunk, timestamp))
}

/// Worker thread that answers [`ChunkJob`]s.
#[derive(Debug)]
pub struct ChunkWorker {
    jobs: Option<Sender<ChunkJob>>,
    thread: Option<JoinHandle<()>>,
}

impl ChunkWorker {
    /// Start the worker.
    pub fn spawn<W: WorldGate>(
        facility: Arc<LockFacility<W, AccountStore>>,
        replies: SessionHandle,
    ) -> io::Result<Self> {
        let (jobs, queue) = mpsc::channel::<ChunkJob>();
        let thread = thread::Builder::new()
            .name("chunk-worker".to_owned())
            .spawn(move || {
                for job in queue {
                    let reply = {
                        let world = facility.world();
                        let mut world = world.borrow_mut();
                        chunk_reply(&mut *world, job.position, job.timestamp)
                    };
                    match reply {
                        Ok(msg) => {
                            if let Err(err) = replies.send(job.conn, &msg) {
                                debug!(conn = %job.conn, %err, "chunk reply dropped");
                            }
                        }
                        Err(err) => warn!(conn = %job.conn, %err, "chunk request failed"),
                    }
                }
                debug!("chunk worker stopped");
            })?;
        Ok(Self {
            jobs: Some(jobs),
            thread: Some(thread),
        })
    }

    /// Queue a job. Returns false once the worker is gone.
    pub fn submit(&self, job: ChunkJob) -> bool {
        self.jobs.as_ref().is_some_and(|jobs| jobs.send(job).is_ok())
    }
}

impl Drop for ChunkWorker {
    fn drop(&mut self) {
        self.jobs.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("chunk worker panicked");
            }
        }
    }
}
