//! Bridges producers (async tasks or blocking encoders) to a streaming
//! HTTP response body through a bounded channel.

use bytes::Bytes;
use futures::{Stream, stream};
use std::io::{self, Write};
use tokio::sync::mpsc;

/// Chunks buffered between producer and response before back-pressure.
pub const CHANNEL_DEPTH: usize = 16;

pub type BodySender = mpsc::Sender<io::Result<Bytes>>;
pub type BodyReceiver = mpsc::Receiver<io::Result<Bytes>>;

pub fn body_channel() -> (BodySender, BodyReceiver) {
    mpsc::channel(CHANNEL_DEPTH)
}

/// Turn the receiving half into a body stream.
pub fn receiver_stream(rx: BodyReceiver) -> impl Stream<Item = io::Result<Bytes>> + Send {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|chunk| (chunk, rx)) })
}

/// Blocking [`Write`] that forwards every write as one chunk.
///
/// Must only be used off the async runtime (e.g. in `spawn_blocking`).
/// Once the receiver is gone, writes fail with `BrokenPipe`.
pub struct ChannelSink {
    tx: BodySender,
}

impl ChannelSink {
    pub fn new(tx: BodySender) -> Self {
        Self { tx }
    }

    /// Forward a producer failure to the response so it is aborted.
    pub fn fail(&self, err: io::Error) {
        let _ = self.tx.blocking_send(Err(err));
    }
}

impl Write for ChannelSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .blocking_send(Ok(Bytes::copy_from_slice(buf)))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "response receiver dropped"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
