//! Worker message channel and its reader/writer adapters
//!
//! A worker talks to its host over a pair of bounded frame queues. Each frame
//! is one encoded message; the host side is a [`HostPort`], the worker side a
//! [`WorkerEndpoint`] split into a [`WorkerReader`] and a [`WorkerWriter`].

use denops_worker_api::{Message, MessageError, WorkerInitMessage};
use serde_json::Value;
use tokio::sync::mpsc;

/// Default number of frames buffered in each direction
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// The peer end of the channel is gone
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Worker channel closed")]
pub struct ChannelClosed;

/// Errors from the host-side helpers
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error(transparent)]
    Closed(#[from] ChannelClosed),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error("Failed to encode init message: {0}")]
    Init(#[from] rmp_serde::encode::Error),
}

/// Create a connected host/worker channel pair
pub fn worker_channel(capacity: usize) -> (HostPort, WorkerEndpoint) {
    let (to_worker, from_host) = mpsc::channel(capacity);
    let (to_host, from_worker) = mpsc::channel(capacity);

    let port = HostPort {
        tx: Some(to_worker),
        rx: from_worker,
    };
    let endpoint = WorkerEndpoint {
        reader: WorkerReader { rx: from_host },
        writer: WorkerWriter { tx: to_host },
    };
    (port, endpoint)
}

/// Worker side of the channel
pub struct WorkerEndpoint {
    pub reader: WorkerReader,
    pub writer: WorkerWriter,
}

impl WorkerEndpoint {
    pub fn split(self) -> (WorkerReader, WorkerWriter) {
        (self.reader, self.writer)
    }
}

/// Inbound half seen by the worker
pub struct WorkerReader {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl WorkerReader {
    /// Next frame, or `None` once the host closed its side
    pub async fn read_frame(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// Stop accepting frames; buffered frames can still be read
    pub fn close(&mut self) {
        self.rx.close();
    }
}

/// Outbound half seen by the worker
#[derive(Clone)]
pub struct WorkerWriter {
    tx: mpsc::Sender<Vec<u8>>,
}

impl WorkerWriter {
    pub async fn write_frame(&self, frame: Vec<u8>) -> Result<(), ChannelClosed> {
        self.tx.send(frame).await.map_err(|_| ChannelClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Host side of the channel
pub struct HostPort {
    tx: Option<mpsc::Sender<Vec<u8>>>,
    rx: mpsc::Receiver<Vec<u8>>,
}

impl HostPort {
    /// Send a raw frame to the worker
    pub async fn post_frame(&self, frame: Vec<u8>) -> Result<(), ChannelClosed> {
        match &self.tx {
            Some(tx) => tx.send(frame).await.map_err(|_| ChannelClosed),
            None => Err(ChannelClosed),
        }
    }

    /// Send the startup handshake
    pub async fn post_init(&self, init: &WorkerInitMessage) -> Result<(), PortError> {
        self.post_frame(init.encode()?).await?;
        Ok(())
    }

    pub async fn post_message(&self, message: &Message) -> Result<(), PortError> {
        self.post_frame(message.encode()?).await?;
        Ok(())
    }

    /// Answer a worker request
    pub async fn respond(&self, msgid: u32, result: Value) -> Result<(), PortError> {
        self.post_message(&Message::ok(msgid, result)).await
    }

    /// Answer a worker request with an error
    pub async fn respond_error(&self, msgid: u32, error: Value) -> Result<(), PortError> {
        self.post_message(&Message::err(msgid, error)).await
    }

    /// Next message from the worker, or `None` once the worker is gone
    pub async fn recv_message(&mut self) -> Option<Result<Message, MessageError>> {
        let frame = self.rx.recv().await?;
        Some(Message::decode(&frame))
    }

    /// Close the host-to-worker direction; the worker's session drains
    pub fn close(&mut self) {
        self.tx = None;
    }
}
