use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use rand::Rng;
use tokio::io::{AsyncRead, AsyncSeek, AsyncWrite, ReadBuf};

#[derive(Default)]
struct Inner {
    data: Vec<u8>,
    pos: u64,
}

/// A `Vec<u8>`-backed stream standing in for a real file, the same role
/// `TestFile` plays in the crate's own test suite -- kept bench-local since
/// criterion benchmarks are their own binary and can't reach test-only
/// crate internals.
#[derive(Clone, Default)]
pub struct MemStream {
    inner: Arc<Mutex<Inner>>,
}

impl MemStream {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AsyncRead for MemStream {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut inner = self.inner.lock().unwrap();
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

impl AsyncWrite for MemStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut inner = self.inner.lock().unwrap();
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

impl AsyncSeek for MemStream {
    fn start_seek(self: Pin<&mut Self>, position: io::SeekFrom) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let new_pos = match position {
            io::SeekFrom::Start(p) => p as i64,
            io::SeekFrom::End(p) => inner.data.len() as i64 + p,
            io::SeekFrom::Current(p) => inner.pos as i64 + p,
        };
        if new_pos < 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "negative seek"));
        }
        inner.pos = new_pos as u64;
        Ok(())
    }

    fn poll_complete(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        Poll::Ready(Ok(self.inner.lock().unwrap().pos))
    }
}

/// Builds `count` key/value items, each value `value_len` bytes, with keys
/// derived from the item index so they stay within the 253-byte limit for
/// any realistic benchmark width.
pub fn make_items(count: usize, value_len: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
    (0..count)
        .map(|i| (i.to_string().into_bytes(), vec![0xAB; value_len]))
        .collect()
}

/// Builds `count` key/value items with values of random length in
/// `min..max`, filled with random bytes. Mirrors the corpus's own
/// `generate_record_cache` helper for its buffer throughput tool, used here
/// to avoid a benchmark that only ever sees one fixed-size, perfectly
/// compressible payload.
pub fn make_random_items(count: usize, min: usize, max: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|i| {
            let len = rng.gen_range(min..max);
            let payload = (0..len).map(|_| rng.gen::<u8>()).collect();
            (i.to_string().into_bytes(), payload)
        })
        .collect()
}
