//! Duplex byte channel over an interactive exec session.

use std::pin::Pin;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::{SandboxError, SandboxResult};

type OutputStream = Pin<Box<dyn Stream<Item = SandboxResult<Bytes>> + Send>>;
type InputSink = Pin<Box<dyn AsyncWrite + Send>>;

/// A pseudo-terminal session inside a sandbox.
///
/// Reading yields output chunks as the shell produces them; writing sends
/// input bytes. Both halves are async, so a slow engine never parks a
/// runtime worker.
pub struct ExecChannel {
    reader: ChannelReader,
    writer: ChannelWriter,
}

impl ExecChannel {
    pub fn new<S, W>(output: S, input: W) -> Self
    where
        S: Stream<Item = SandboxResult<Bytes>> + Send + 'static,
        W: AsyncWrite + Send + 'static,
    {
        Self {
            reader: ChannelReader {
                output: Box::pin(output),
            },
            writer: ChannelWriter {
                input: Box::pin(input),
                closed: false,
            },
        }
    }

    /// Next output chunk, `None` once the shell has exited.
    pub async fn read(&mut self) -> SandboxResult<Option<Bytes>> {
        self.reader.read().await
    }

    pub async fn write(&mut self, data: &[u8]) -> SandboxResult<()> {
        self.writer.write(data).await
    }

    pub async fn close(&mut self) -> SandboxResult<()> {
        self.writer.close().await
    }

    /// Split into independently owned halves for concurrent pumping.
    pub fn split(self) -> (ChannelReader, ChannelWriter) {
        (self.reader, self.writer)
    }
}

impl std::fmt::Debug for ExecChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecChannel")
            .field("closed", &self.writer.closed)
            .finish()
    }
}

/// Output half of an [`ExecChannel`].
pub struct ChannelReader {
    output: OutputStream,
}

impl ChannelReader {
    pub async fn read(&mut self) -> SandboxResult<Option<Bytes>> {
        self.output.next().await.transpose()
    }
}

/// Input half of an [`ExecChannel`].
pub struct ChannelWriter {
    input: InputSink,
    closed: bool,
}

impl ChannelWriter {
    pub async fn write(&mut self, data: &[u8]) -> SandboxResult<()> {
        if self.closed {
            return Err(SandboxError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "channel closed",
            )));
        }
        self.input.write_all(data).await?;
        self.input.flush().await?;
        Ok(())
    }

    /// Shut down the input side. Closing twice is a no-op.
    pub async fn close(&mut self) -> SandboxResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.input.shutdown().await?;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio_util::io::ReaderStream;

    fn channel_pair() -> (ExecChannel, tokio::io::DuplexStream, tokio::io::DuplexStream) {
        let (shell_out, ours_out) = tokio::io::duplex(256);
        let (ours_in, shell_in) = tokio::io::duplex(256);
        let output = ReaderStream::new(ours_out).map(|r| r.map_err(SandboxError::from));
        (ExecChannel::new(output, ours_in), shell_out, shell_in)
    }

    #[tokio::test]
    async fn test_read_write_round_trip() {
        let (mut channel, mut shell_out, mut shell_in) = channel_pair();

        channel.write(b"ls\n").await.unwrap();
        let mut buf = [0u8; 3];
        shell_in.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ls\n");

        tokio::io::AsyncWriteExt::write_all(&mut shell_out, b"file.txt\n")
            .await
            .unwrap();
        let chunk = channel.read().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"file.txt\n");
    }

    #[tokio::test]
    async fn test_read_returns_none_at_eof() {
        let (mut channel, shell_out, _shell_in) = channel_pair();
        drop(shell_out);
        assert!(channel.read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_blocks_writes() {
        let (mut channel, _shell_out, mut shell_in) = channel_pair();
        channel.close().await.unwrap();
        channel.close().await.unwrap();
        assert!(channel.write(b"x").await.is_err());

        let mut buf = Vec::new();
        shell_in.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_split_halves_work_independently() {
        let (channel, mut shell_out, _shell_in) = channel_pair();
        let (mut reader, mut writer) = channel.split();

        assert!(!writer.is_closed());
        writer.close().await.unwrap();
        assert!(writer.is_closed());

        tokio::io::AsyncWriteExt::write_all(&mut shell_out, b"still here")
            .await
            .unwrap();
        let chunk = reader.read().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"still here");
    }
}
