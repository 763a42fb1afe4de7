use std::{
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::metrics::TransportMetrics;

/// Per-connection counts are pushed to the shared metrics once they reach
/// this many bytes, and on drop.
const FLUSH_THRESHOLD: u64 = 64 * 1024;

/// Connection wrapper counting bytes read and written.
pub struct MeteredConn<S> {
    inner: S,
    metrics: Arc<TransportMetrics>,
    read: u64,
    written: u64,
}

impl<S> MeteredConn<S> {
    pub fn new(inner: S, metrics: Arc<TransportMetrics>) -> Self {
        Self {
            inner,
            metrics,
            read: 0,
            written: 0,
        }
    }

    fn flush_counts(&mut self, force: bool) {
        if self.read > 0 && (force || self.read >= FLUSH_THRESHOLD) {
            self.metrics.received_bytes(self.read);
            self.read = 0;
        }
        if self.written > 0 && (force || self.written >= FLUSH_THRESHOLD) {
            self.metrics.sent_bytes(self.written);
            self.written = 0;
        }
    }
}

impl<S> Drop for MeteredConn<S> {
    fn drop(&mut self) {
        self.flush_counts(true);
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for MeteredConn<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let res = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = res {
            self.read += (buf.filled().len() - before) as u64;
            self.flush_counts(false);
        }
        res
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for MeteredConn<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let res = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = res {
            self.written += n as u64;
            self.flush_counts(false);
        }
        res
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
