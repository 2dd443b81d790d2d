use std::{
    fmt, io,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::pivot::swap::lifecycle::ClosedGuard;

/// Independently owned unidirectional endpoints of one physical transport.
///
/// Trait objects keep the adapter agnostic of how the connection was split;
/// `Unpin` lets the poll impls stay plain delegation.
pub type ReadEndpoint = Box<dyn AsyncRead + Send + Unpin>;
pub type WriteEndpoint = Box<dyn AsyncWrite + Send + Unpin>;

/// One bidirectional stream assembled from a read endpoint and a write
/// endpoint. The two directions share no cursor, so after [`into_split`] the
/// halves can be driven from different tasks without locking.
///
/// [`into_split`]: DuplexStream::into_split
pub struct DuplexStream {
    read: ReadHalf,
    write: WriteHalf,
}

impl DuplexStream {
    pub fn new(read: ReadEndpoint, write: WriteEndpoint) -> Self {
        Self {
            read: ReadHalf { inner: read },
            write: WriteHalf {
                inner: write,
                guard: None,
                shutdown_done: false,
            },
        }
    }

    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (r, w) = tokio::io::split(stream);
        Self::new(Box::new(r), Box::new(w))
    }

    /// Attaches a closed guard to the write half: it fires when the stream is
    /// shut down or when the last half is dropped.
    pub fn with_closed_guard(mut self, guard: ClosedGuard) -> Self {
        self.write.guard = Some(guard);
        self
    }

    pub fn into_split(self) -> (ReadHalf, WriteHalf) {
        (self.read, self.write)
    }

    /// Completes the write endpoint. Safe to call any number of times; only
    /// the first call reaches the underlying transport.
    pub async fn close(&mut self) -> io::Result<()> {
        self.write.shutdown().await
    }
}

impl fmt::Debug for DuplexStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DuplexStream").finish_non_exhaustive()
    }
}

impl AsyncRead for DuplexStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().read).poll_read(cx, buf)
    }
}

impl AsyncWrite for DuplexStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().write).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().write).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().write).poll_shutdown(cx)
    }
}

pub struct ReadHalf {
    inner: ReadEndpoint,
}

impl AsyncRead for ReadHalf {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl fmt::Debug for ReadHalf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadHalf").finish_non_exhaustive()
    }
}

pub struct WriteHalf {
    inner: WriteEndpoint,
    guard: Option<ClosedGuard>,
    shutdown_done: bool,
}

impl AsyncWrite for WriteHalf {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.shutdown_done {
            return Poll::Ready(Ok(()));
        }
        match Pin::new(&mut this.inner).poll_shutdown(cx) {
            Poll::Ready(res) => {
                this.shutdown_done = true;
                if let Some(guard) = this.guard.as_mut() {
                    guard.fire();
                }
                Poll::Ready(res)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl fmt::Debug for WriteHalf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteHalf")
            .field("shutdown_done", &self.shutdown_done)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::pivot::swap::lifecycle;

    #[tokio::test]
    async fn reads_and_writes_touch_disjoint_endpoints() {
        let (near, mut far) = tokio::io::duplex(256);
        let mut stream = DuplexStream::from_stream(near);

        stream.write_all(b"ping").await.unwrap();
        stream.flush().await.unwrap();

        let mut got = [0u8; 4];
        far.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"ping");

        far.write_all(b"pong").await.unwrap();
        let mut got = [0u8; 4];
        stream.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"pong");
    }

    #[tokio::test]
    async fn split_halves_work_from_separate_tasks() {
        let (near, far) = tokio::io::duplex(256);
        let (mut fr, mut fw) = DuplexStream::from_stream(far).into_split();
        let (mut nr, mut nw) = DuplexStream::from_stream(near).into_split();

        let writer = tokio::spawn(async move {
            for _ in 0..100 {
                nw.write_all(b"abcdefgh").await.unwrap();
            }
            nw.shutdown().await.unwrap();
        });
        let echo = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            loop {
                let n = fr.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                fw.write_all(&buf[..n]).await.unwrap();
            }
            fw.shutdown().await.unwrap();
        });

        let mut total = Vec::new();
        nr.read_to_end(&mut total).await.unwrap();
        assert_eq!(total.len(), 800);

        writer.await.unwrap();
        echo.await.unwrap();
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (near, mut far) = tokio::io::duplex(256);
        let mut stream = DuplexStream::from_stream(near);

        stream.close().await.unwrap();
        stream.close().await.unwrap();

        let mut buf = Vec::new();
        far.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn closed_guard_fires_on_shutdown_and_on_drop() {
        let (near, _far) = tokio::io::duplex(256);
        let (guard, signal) = lifecycle::closed_pair();
        let mut stream = DuplexStream::from_stream(near).with_closed_guard(guard);
        stream.close().await.unwrap();
        signal.wait().await;

        let (near, _far) = tokio::io::duplex(256);
        let (guard, signal) = lifecycle::closed_pair();
        let stream = DuplexStream::from_stream(near).with_closed_guard(guard);
        drop(stream);
        signal.wait().await;
    }
}
