//! An in-memory, seekable byte stream used as the backing store in tests.
//!
//! In the spirit of the disk-buffer test suite's `TestFile`, but extended
//! with `AsyncSeek` since the wire format in this crate is seek-heavy (every
//! random value read is a seek-read-seek-back).

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncSeek, AsyncWrite, ReadBuf};

/// Installs a `tracing` subscriber that prints to the test harness's
/// captured output, controlled by `RUST_LOG` the same way the rest of the
/// crate's instrumentation is. Safe to call from every test: the actual
/// subscriber is only ever installed once, by whichever test calls this
/// first.
pub fn init_tracing() {
    static SUBSCRIBER: Lazy<()> = Lazy::new(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("off"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
    Lazy::force(&SUBSCRIBER);
}

#[derive(Default)]
struct Inner {
    data: Vec<u8>,
    pos: u64,
}

/// A `Vec<u8>`-backed stream, cloneable (clones share the same underlying
/// buffer) so a test can simulate "close and reopen" by handing a clone to
/// a second `Database::open`.
#[derive(Clone, Default)]
pub struct MemoryStream {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the current byte contents, for asserting on the on-disk
    /// layout directly.
    pub fn snapshot(&self) -> Vec<u8> {
        self.inner.lock().data.clone()
    }
}

impl AsyncRead for MemoryStream {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut inner = self.inner.lock();
        let pos = inner.pos as usize;
        let len = inner.data.len();
        if pos >= len {
            return Poll::Ready(Ok(()));
        }
        let n = std::cmp::min(buf.remaining(), len - pos);
        buf.put_slice(&inner.data[pos..pos + n]);
        inner.pos += n as u64;
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MemoryStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut inner = self.inner.lock();
        let pos = inner.pos as usize;
        if pos + buf.len() > inner.data.len() {
            inner.data.resize(pos + buf.len(), 0);
        }
        inner.data[pos..pos + buf.len()].copy_from_slice(buf);
        inner.pos += buf.len() as u64;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl AsyncSeek for MemoryStream {
    fn start_seek(self: Pin<&mut Self>, position: io::SeekFrom) -> io::Result<()> {
        let mut inner = self.inner.lock();
        let new_pos = match position {
            io::SeekFrom::Start(p) => p as i64,
            io::SeekFrom::End(p) => inner.data.len() as i64 + p,
            io::SeekFrom::Current(p) => inner.pos as i64 + p,
        };
        if new_pos < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to negative position",
            ));
        }
        inner.pos = new_pos as u64;
        Ok(())
    }

    fn poll_complete(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        Poll::Ready(Ok(self.inner.lock().pos))
    }
}
