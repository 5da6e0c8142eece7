//! Writer actor: an isolated Tokio task that owns the write half.
//!
//! Segments are encoded by their senders and handed over whole, so the
//! actor only has to write one buffer at a time. That is what keeps two
//! segments' bytes from interleaving on the wire.

use bytes::Bytes;
use speedwire_transport::{ConnectionId, TransportError, Writable};
use tokio::sync::{mpsc, oneshot};

use crate::SessionError;

/// Commands sent to the writer actor through its channel.
enum WriterCommand {
    /// Write one encoded segment.
    Write {
        data: Bytes,
        reply: oneshot::Sender<Result<(), TransportError>>,
    },

    /// Flush what is queued, close the stream and stop.
    Close { reply: oneshot::Sender<()> },
}

/// Handle to a running writer actor. Cheap to clone.
#[derive(Clone)]
pub(crate) struct WriterHandle {
    sender: mpsc::Sender<WriterCommand>,
}

impl WriterHandle {
    /// Queues `data` and waits until it has been written.
    pub async fn write(&self, data: Bytes) -> Result<(), SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(WriterCommand::Write {
                data,
                reply: reply_tx,
            })
            .await
            .map_err(|_| SessionError::Closed)?;
        reply_rx.await.map_err(|_| SessionError::Closed)??;
        Ok(())
    }

    /// Asks the actor to close the stream once earlier writes are done.
    pub async fn close(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .sender
            .send(WriterCommand::Close { reply: reply_tx })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }
}

/// The internal actor state. Runs inside a Tokio task.
struct WriterActor<W> {
    id: ConnectionId,
    writer: W,
    receiver: mpsc::Receiver<WriterCommand>,
}

impl<W: Writable> WriterActor<W> {
    async fn run(mut self) {
        tracing::debug!(session = %self.id, "writer started");

        while let Some(cmd) = self.receiver.recv().await {
            match cmd {
                WriterCommand::Write { data, reply } => {
                    let result = self.writer.write(&data).await;
                    if let Err(e) = &result {
                        tracing::warn!(session = %self.id, error = %e, "segment write failed");
                    }
                    let _ = reply.send(result);
                }
                WriterCommand::Close { reply } => {
                    if let Err(e) = self.writer.close().await {
                        tracing::debug!(session = %self.id, error = %e, "stream close failed");
                    }
                    let _ = reply.send(());
                    break;
                }
            }
        }

        tracing::debug!(session = %self.id, "writer stopped");
    }
}

/// Spawns a writer actor task and returns a handle to it.
///
/// `queue_depth` bounds the command channel: when it fills up, writers
/// wait (backpressure).
pub(crate) fn spawn_writer<W>(id: ConnectionId, writer: W, queue_depth: usize) -> WriterHandle
where
    W: Writable + 'static,
{
    let (sender, receiver) = mpsc::channel(queue_depth.max(1));
    let actor = WriterActor {
        id,
        writer,
        receiver,
    };
    tokio::spawn(actor.run());
    WriterHandle { sender }
}
