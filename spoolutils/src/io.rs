//! Reader adapters for streams that must keep something else alive.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncSeek, ReadBuf};

/// Wraps a reader together with an owned guard (a lock token, a tempdir,
/// anything droppable). The guard is released when the reader is dropped,
/// so consumers downstream never have to know what kept the bytes valid.
#[derive(Debug)]
pub struct GuardedReader<R, G> {
    inner: R,
    _guard: G,
}

impl<R, G> GuardedReader<R, G> {
    pub fn new(inner: R, guard: G) -> Self {
        Self {
            inner,
            _guard: guard,
        }
    }

    /// Access to the underlying reader, guard still held.
    pub fn get_ref(&self) -> &R {
        &self.inner
    }
}

impl<R, G> AsyncRead for GuardedReader<R, G>
where
    R: AsyncRead + Unpin,
    G: Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<R, G> AsyncSeek for GuardedReader<R, G>
where
    R: AsyncSeek + Unpin,
    G: Unpin,
{
    fn start_seek(mut self: Pin<&mut Self>, position: io::SeekFrom) -> io::Result<()> {
        Pin::new(&mut self.inner).start_seek(position)
    }

    fn poll_complete(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        Pin::new(&mut self.inner).poll_complete(cx)
    }
}
