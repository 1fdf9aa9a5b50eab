use crate::codec::InputWriter;
use crate::rights::recv_descriptors;
use crate::{Input, signal_code};
use std::path::Path;
use std::sync::Arc;
use tether_core::{AsyncOwnedFd, Error, Result, Signal, WindowSize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

/// A connection to a running i/o daemon.
///
/// Creating a link recovers the child's stdout, stderr and exit status from
/// the daemon and starts relaying output into the given writers. Input goes
/// back over the same connection through a [`LinkWriter`].
pub struct Link {
    writer: LinkWriter,
    streaming: Vec<JoinHandle<()>>,
    exit_status: AsyncOwnedFd,
}

impl Link {
    pub async fn connect<O, E>(socket_path: impl AsRef<Path>, stdout: O, stderr: E) -> Result<Self>
    where
        O: AsyncWrite + Send + Unpin + 'static,
        E: AsyncWrite + Send + Unpin + 'static,
    {
        let socket_path = socket_path.as_ref();
        let stream = UnixStream::connect(socket_path).await.map_err(|e| {
            std::io::Error::new(e.kind(), format!("failed to connect to i/o daemon: {}", e))
        })?;

        let [out_fd, err_fd, status_fd] = recv_descriptors(&stream).await?;
        debug!(socket = %socket_path.display(), "linked to i/o daemon");

        let (_read_half, write_half) = stream.into_split();

        let streaming = vec![
            tokio::spawn(relay(AsyncOwnedFd::new(out_fd)?, stdout, "stdout")),
            tokio::spawn(relay(AsyncOwnedFd::new(err_fd)?, stderr, "stderr")),
        ];

        Ok(Self {
            writer: LinkWriter::new(write_half),
            streaming,
            exit_status: AsyncOwnedFd::new(status_fd)?,
        })
    }

    /// Returns a handle for sending input to the daemon.
    pub fn writer(&self) -> LinkWriter {
        self.writer.clone()
    }

    pub async fn write(&self, data: &[u8]) -> Result<()> {
        self.writer.write(data).await
    }

    pub async fn close(&self) -> Result<()> {
        self.writer.close().await
    }

    pub async fn set_window_size(&self, size: WindowSize) -> Result<()> {
        self.writer.set_window_size(size).await
    }

    pub async fn signal(&self, signal: Signal) -> Result<()> {
        self.writer.signal(signal).await
    }

    /// Waits for both output relays to drain, then reads the exit code the
    /// daemon wrote once the child finished.
    pub async fn wait(mut self) -> Result<i32> {
        for task in self.streaming.drain(..) {
            let _ = task.await;
        }

        let mut status = String::new();
        self.exit_status
            .read_to_string(&mut status)
            .await
            .map_err(|e| Error::Protocol(format!("could not determine exit status: {}", e)))?;

        parse_exit_status(&status)
    }
}

async fn relay<R, W>(mut source: R, mut sink: W, stream: &'static str)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if let Err(e) = tokio::io::copy(&mut source, &mut sink).await {
        debug!(stream, error = %e, "relay ended with error");
    }
    let _ = sink.flush().await;
}

/// Parses the `"<code>\n"` line the daemon writes to the exit-status pipe.
pub fn parse_exit_status(status: &str) -> Result<i32> {
    let line = status
        .lines()
        .next()
        .ok_or_else(|| Error::Protocol("could not determine exit status: no status line".into()))?;

    line.trim().parse().map_err(|e| {
        Error::Protocol(format!(
            "could not determine exit status from {:?}: {}",
            line, e
        ))
    })
}

/// Encodes input for the daemon. Clones share one connection, so messages
/// from every clone keep a single FIFO order.
#[derive(Clone)]
pub struct LinkWriter {
    encoder: Arc<Mutex<InputWriter<OwnedWriteHalf>>>,
}

impl LinkWriter {
    fn new(write_half: OwnedWriteHalf) -> Self {
        Self {
            encoder: Arc::new(Mutex::new(InputWriter::new(write_half))),
        }
    }

    async fn send(&self, input: Input) -> Result<()> {
        self.encoder.lock().await.send(input).await
    }

    pub async fn write(&self, data: &[u8]) -> Result<()> {
        self.send(Input::Data(data.to_vec())).await
    }

    pub async fn close(&self) -> Result<()> {
        self.send(Input::Eof).await
    }

    pub async fn set_window_size(&self, size: WindowSize) -> Result<()> {
        self.send(Input::WindowSize(size)).await
    }

    pub async fn signal(&self, signal: Signal) -> Result<()> {
        self.send(Input::Signal(signal_code(signal))).await
    }
}
