//! One writer, many sinks.
//!
//! Every sink gets its own bounded queue and pump task. A sink that falls
//! behind loses chunks instead of slowing the process or the other sinks.

use bytes::Bytes;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tether_core::{Error, Result};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace};

/// Chunks buffered per sink before new chunks are dropped for it.
pub const SINK_QUEUE_CHUNKS: usize = 256;

#[derive(Default)]
struct State {
    sinks: Vec<mpsc::Sender<Bytes>>,
    closed: bool,
}

/// Copies everything written to it into every attached sink.
#[derive(Clone, Default)]
pub struct FanoutWriter {
    state: Arc<Mutex<State>>,
}

impl FanoutWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attaches `sink`. It receives only bytes written from now on and is
    /// shut down when the writer closes.
    ///
    /// Returns false if the writer is already closed; the sink is shut down
    /// right away in that case.
    pub fn add_sink<W>(&self, sink: W) -> bool
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let mut state = self.state();
        if state.closed {
            drop(state);
            tokio::spawn(async move {
                let mut sink = sink;
                let _ = sink.shutdown().await;
            });
            return false;
        }

        let (tx, rx) = mpsc::channel(SINK_QUEUE_CHUNKS);
        state.sinks.push(tx);
        tokio::spawn(pump(rx, sink));
        true
    }

    pub fn write(&self, data: &[u8]) -> Result<()> {
        let mut state = self.state();
        if state.closed {
            return Err(Error::WriteAfterClose);
        }
        if data.is_empty() {
            return Ok(());
        }

        let chunk = Bytes::copy_from_slice(data);
        state.sinks.retain(|sink| match sink.try_send(chunk.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                trace!(len = chunk.len(), "sink queue full, dropping chunk");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
        Ok(())
    }

    /// Stops accepting writes and sinks. Queued chunks still drain.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state();
        if state.closed {
            return Err(Error::DoubleClose);
        }
        state.closed = true;
        state.sinks.clear();
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    pub fn sink_count(&self) -> usize {
        self.state().sinks.len()
    }
}

async fn pump<W>(mut queue: mpsc::Receiver<Bytes>, mut sink: W)
where
    W: AsyncWrite + Unpin,
{
    while let Some(chunk) = queue.recv().await {
        if let Err(e) = sink.write_all(&chunk).await {
            debug!(error = %e, "dropping failed output sink");
            return;
        }
        if queue.is_empty() {
            let _ = sink.flush().await;
        }
    }
    let _ = sink.shutdown().await;
}

impl AsyncWrite for FanoutWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Poll::Ready(
            FanoutWriter::write(&self, buf)
                .map(|()| buf.len())
                .map_err(std::io::Error::other),
        )
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match FanoutWriter::close(&self) {
            Ok(()) | Err(Error::DoubleClose) => Poll::Ready(Ok(())),
            Err(e) => Poll::Ready(Err(std::io::Error::other(e))),
        }
    }
}
