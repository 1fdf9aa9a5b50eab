use crate::Input;
use futures::{SinkExt, TryStreamExt};
use tether_core::Result;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serde::SymmetricallyFramed;
use tokio_serde::formats::SymmetricalBincode;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

/// Maximum size of one encoded [`Input`] frame (16MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

fn length_delimited() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_SIZE)
        .new_codec()
}

/// Encodes [`Input`] messages onto a byte stream, one frame per message.
pub struct InputWriter<W> {
    inner: SymmetricallyFramed<FramedWrite<W, LengthDelimitedCodec>, Input, SymmetricalBincode<Input>>,
}

impl<W: AsyncWrite + Unpin> InputWriter<W> {
    pub fn new(writer: W) -> Self {
        let framed = FramedWrite::new(writer, length_delimited());
        Self {
            inner: SymmetricallyFramed::new(framed, SymmetricalBincode::default()),
        }
    }

    pub async fn send(&mut self, input: Input) -> Result<()> {
        self.inner.send(input).await?;
        Ok(())
    }
}

/// Decodes [`Input`] messages written by an [`InputWriter`].
pub struct InputReader<R> {
    inner: SymmetricallyFramed<FramedRead<R, LengthDelimitedCodec>, Input, SymmetricalBincode<Input>>,
}

impl<R: AsyncRead + Unpin> InputReader<R> {
    pub fn new(reader: R) -> Self {
        let framed = FramedRead::new(reader, length_delimited());
        Self {
            inner: SymmetricallyFramed::new(framed, SymmetricalBincode::default()),
        }
    }

    /// Returns the next message, or `None` once the peer hung up.
    pub async fn next(&mut self) -> Result<Option<Input>> {
        Ok(self.inner.try_next().await?)
    }
}
