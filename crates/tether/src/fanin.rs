//! Many writers, one sink.
//!
//! A [`FaninWriter`] feeds a process's stdin. Observers may attach input
//! sources before the process exists; their writes park until
//! [`FaninWriter::add_sink`] supplies the real destination, then go out in
//! the order they were issued.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use tether_core::{BoxedReader, Error, Result};
use tether_link::LinkWriter;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, watch};
use tracing::debug;

const SOURCE_CHUNK: usize = 8 * 1024;

/// Destination for multiplexed input.
#[async_trait]
pub trait InputSink: Send {
    async fn write_all(&mut self, data: &[u8]) -> Result<()>;

    /// Signals end of input. The sink is dropped right after.
    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
impl<S: InputSink + ?Sized> InputSink for Box<S> {
    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        (**self).write_all(data).await
    }

    async fn close(&mut self) -> Result<()> {
        (**self).close().await
    }
}

/// Adapts any [`AsyncWrite`] into an [`InputSink`].
pub struct WriteSink<W>(pub W);

#[async_trait]
impl<W> InputSink for WriteSink<W>
where
    W: AsyncWrite + Send + Unpin,
{
    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.0.write_all(data).await?;
        self.0.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.0.shutdown().await?;
        Ok(())
    }
}

#[async_trait]
impl InputSink for LinkWriter {
    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.write(data).await
    }

    async fn close(&mut self) -> Result<()> {
        LinkWriter::close(self).await
    }
}

#[derive(Default)]
struct State {
    sink: Option<Box<dyn InputSink>>,
    closed: bool,
}

struct Shared {
    // FIFO: waiters are served in the order they asked for the lock
    state: Mutex<State>,
    incoming: std::sync::Mutex<Option<Box<dyn InputSink>>>,
    sink_added: watch::Sender<bool>,
    sink_taken: AtomicBool,
}

/// Combines any number of byte sources into exactly one sink.
#[derive(Clone)]
pub struct FaninWriter {
    shared: Arc<Shared>,
}

impl Default for FaninWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl FaninWriter {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                incoming: std::sync::Mutex::new(None),
                sink_added: watch::Sender::new(false),
                sink_taken: AtomicBool::new(false),
            }),
        }
    }

    /// Sets the destination. Fails with [`Error::SinkAlreadySet`] on every
    /// call after the first.
    pub fn add_sink(&self, sink: impl InputSink + 'static) -> Result<()> {
        if self.shared.sink_taken.swap(true, Ordering::SeqCst) {
            return Err(Error::SinkAlreadySet);
        }

        *self
            .shared
            .incoming
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Box::new(sink));
        self.shared.sink_added.send_replace(true);
        Ok(())
    }

    /// Writes `data` to the sink, waiting for one to be set if needed.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        if state.closed {
            return Err(Error::WriteAfterClose);
        }
        self.install_sink(&mut state).await;

        match state.sink.as_mut() {
            Some(sink) => sink.write_all(data).await,
            None => Err(Error::WriteAfterClose),
        }
    }

    /// Closes the sink, waiting for one to be set if needed. A second close
    /// fails with [`Error::DoubleClose`].
    pub async fn close(&self) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        if state.closed {
            return Err(Error::DoubleClose);
        }
        self.install_sink(&mut state).await;

        state.closed = true;
        match state.sink.take() {
            Some(mut sink) => sink.close().await,
            None => Ok(()),
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.shared.state.lock().await.closed
    }

    /// Copies `source` into this writer on a background task and closes the
    /// writer once `source` is exhausted.
    pub fn add_source(&self, mut source: BoxedReader) {
        let writer = self.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; SOURCE_CHUNK];
            loop {
                match source.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Err(e) = writer.write(&buf[..n]).await {
                            debug!(error = %e, "input source stopped");
                            return;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "reading input source failed");
                        break;
                    }
                }
            }

            match writer.close().await {
                Ok(()) => {}
                Err(e) if e.is_closed() => {}
                Err(e) => debug!(error = %e, "closing input failed"),
            }
        });
    }

    async fn install_sink(&self, state: &mut State) {
        if state.sink.is_some() {
            return;
        }

        let mut added = self.shared.sink_added.subscribe();
        // the sender lives in `shared`, so this only returns once a sink exists
        let _ = added.wait_for(|added| *added).await;

        state.sink = self
            .shared
            .incoming
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}
