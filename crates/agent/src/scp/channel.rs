use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// The slice of an authenticated SSH session channel an SCP transfer needs.
#[async_trait]
pub trait ScpChannel: Send {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()>;
    async fn send_exit_status(&mut self, status: u32) -> io::Result<()>;
    async fn close(&mut self) -> io::Result<()>;
    fn is_open(&self) -> bool;
}

/// Channel over a plain byte stream pair. There is no out-of-band exit status on
/// a stream, so it is recorded for the owner to deliver (e.g. as a process exit code).
pub struct StreamChannel<R, W> {
    reader: R,
    writer: W,
    exit_status: Option<u32>,
    closed: bool,
}

impl<R, W> StreamChannel<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            exit_status: None,
            closed: false,
        }
    }

    pub fn exit_status(&self) -> Option<u32> {
        self.exit_status
    }
}

pub type StdioChannel = StreamChannel<tokio::io::Stdin, tokio::io::Stdout>;

pub fn stdio_channel() -> StdioChannel {
    StreamChannel::new(tokio::io::stdin(), tokio::io::stdout())
}

#[async_trait]
impl<R, W> ScpChannel for StreamChannel<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf).await
    }

    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "channel closed"));
        }
        self.writer.write_all(data).await?;
        self.writer.flush().await
    }

    async fn send_exit_status(&mut self, status: u32) -> io::Result<()> {
        self.exit_status = Some(status);
        Ok(())
    }

    async fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.writer.shutdown().await
    }

    fn is_open(&self) -> bool {
        !self.closed
    }
}
