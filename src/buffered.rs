//! The buffered database: coalesces many small inserts into one
//! underlying batch.

use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncSeek, AsyncWrite};

use crate::config::BufferedDatabaseConfig;
use crate::database::{Database, ValueLoader};
use crate::device::Item;
use crate::error::DatabaseResult;

/// Smallest `buffer_size` the config will accept. Below this, per-batch
/// overhead dominates badly enough that it's almost certainly a mistake.
pub const MIN_BUFFER_SIZE: usize = 16;

/// Default `buffer_size` when none is configured.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Wraps a [`Database`], accumulating inserts in a fixed-capacity buffer
/// and flushing them as a single `insert_range` call on overflow or
/// dispose.
///
/// Iteration is not safe to interleave with insertion: callers must not
/// call `iter()` while a concurrent `insert`/`insert_range`/`flush` is in
/// flight on the same `BufferedDatabase`, or they may observe the buffer
/// mid-flush.
pub struct BufferedDatabase<S> {
    inner: Database<S>,
    capacity: usize,
    pending: Mutex<Vec<(Vec<u8>, Vec<u8>)>>,
}

impl<S> BufferedDatabase<S>
where
    S: AsyncRead + AsyncWrite + AsyncSeek + Unpin + Send + 'static,
{
    /// Wraps `inner`, buffering up to `capacity` pending entries before
    /// flushing.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is below [`MIN_BUFFER_SIZE`]; use
    /// [`crate::config::BufferedDatabaseConfigBuilder`] to validate this
    /// at construction time instead of panicking deep in calling code.
    pub fn new(inner: Database<S>, capacity: usize) -> Self {
        assert!(
            capacity >= MIN_BUFFER_SIZE,
            "buffer_size must be at least {MIN_BUFFER_SIZE}, got {capacity}"
        );
        Self {
            inner,
            capacity,
            pending: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    /// Buffers a single key/value pair, flushing first if the buffer is
    /// already full.
    pub async fn insert(&self, key: Vec<u8>, value: Vec<u8>) -> DatabaseResult<()> {
        let should_flush = {
            let pending = self.pending.lock();
            pending.len() == self.capacity
        };
        if should_flush {
            self.flush().await?;
        }
        self.pending.lock().push((key, value));
        Ok(())
    }

    /// Buffers `items`, flushing every time the buffer would overflow.
    pub async fn insert_range(&self, items: &[Item]) -> DatabaseResult<()> {
        for item in items {
            self.insert(item.0.clone(), item.1.clone()).await?;
        }
        Ok(())
    }

    /// Emits everything currently buffered as a single inner
    /// `insert_range` call, then clears the buffer.
    #[instrument(skip(self), level = "debug")]
    pub async fn flush(&self) -> DatabaseResult<()> {
        let batch = {
            let mut pending = self.pending.lock();
            if pending.is_empty() {
                return Ok(());
            }
            std::mem::take(&mut *pending)
        };
        self.inner.insert_range(&batch).await
    }

    /// Yields the inner database's entries first, then virtually appends
    /// the currently-buffered pending entries as eagerly-loaded pairs.
    ///
    /// Must not be called concurrently with `insert`/`insert_range`/
    /// `flush` on the same instance.
    pub fn iter(&self) -> impl Stream<Item = DatabaseResult<(Vec<u8>, ValueLoader<S>)>> + '_ {
        let tail: Vec<(Vec<u8>, Vec<u8>)> = self.pending.lock().clone();
        let inner_stream = self.inner.iter();
        let tail_stream = futures::stream::iter(tail.into_iter().map(|(k, v)| {
            let loader = self.inner.eager_loader(v);
            Ok((k, loader))
        }));
        inner_stream.chain(tail_stream)
    }

    /// Flushes any pending entries, then optionally disposes the wrapped
    /// database.
    pub async fn dispose(self, dispose_inner: bool) -> DatabaseResult<()> {
        self.flush().await?;
        if dispose_inner {
            self.inner.close().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MemoryStream;

    async fn collect(database: &Database<MemoryStream>) -> Vec<(Vec<u8>, Vec<u8>)> {
        let stream = database.iter();
        tokio::pin!(stream);
        let mut out = Vec::new();
        while let Some(entry) = stream.next().await {
            let (key, mut loader) = entry.unwrap();
            out.push((key, loader.load().await.unwrap()));
        }
        out
    }

    #[tokio::test]
    async fn insert_below_capacity_does_not_flush_to_inner() {
        let stream = MemoryStream::new();
        let inner = Database::open(stream.clone()).await.unwrap();
        let buffered = BufferedDatabase::new(inner, MIN_BUFFER_SIZE);
        buffered.insert(b"a".to_vec(), b"1".to_vec()).await.unwrap();

        // Only the 8-byte header should be on disk; nothing has overflowed
        // the buffer yet.
        assert_eq!(stream.snapshot(), vec![0u8; 8]);
    }

    #[tokio::test]
    async fn insert_overflow_flushes_exactly_one_batch() {
        let inner = Database::open(MemoryStream::new()).await.unwrap();
        let buffered = BufferedDatabase::new(inner, MIN_BUFFER_SIZE);

        for i in 0..MIN_BUFFER_SIZE {
            buffered
                .insert(i.to_string().into_bytes(), b"v".to_vec())
                .await
                .unwrap();
        }
        // The buffer is now exactly full; the next insert must flush the
        // prior contents as one batch before buffering the new entry.
        buffered.insert(b"overflow".to_vec(), b"v".to_vec()).await.unwrap();

        let entries = collect(&buffered).await;
        assert_eq!(entries.len(), MIN_BUFFER_SIZE + 1);
        assert_eq!(entries.last().unwrap().0, b"overflow".to_vec());
    }

    #[tokio::test]
    async fn iter_yields_flushed_entries_then_pending_tail() {
        let inner = Database::open(MemoryStream::new()).await.unwrap();
        let buffered = BufferedDatabase::new(inner, MIN_BUFFER_SIZE);
        buffered.insert(b"a".to_vec(), b"1".to_vec()).await.unwrap();
        buffered.flush().await.unwrap();
        buffered.insert(b"b".to_vec(), b"2".to_vec()).await.unwrap();

        assert_eq!(
            collect(&buffered).await,
            vec![(b"a".to_vec(), b"1".to_vec()), (b"b".to_vec(), b"2".to_vec())]
        );
    }

    #[tokio::test]
    async fn flush_is_a_no_op_when_nothing_is_pending() {
        let inner = Database::open(MemoryStream::new()).await.unwrap();
        let buffered = BufferedDatabase::new(inner, MIN_BUFFER_SIZE);
        buffered.flush().await.unwrap();
        assert_eq!(collect(&buffered).await, Vec::<(Vec<u8>, Vec<u8>)>::new());
    }

    #[tokio::test]
    async fn buffered_equivalence_matches_unbuffered_on_disk_state_after_flush() {
        let items: Vec<(Vec<u8>, Vec<u8>)> = (0..50)
            .map(|i| (i.to_string().into_bytes(), vec![0x42; i % 7]))
            .collect();

        let direct_stream = MemoryStream::new();
        let direct = Database::open(direct_stream.clone()).await.unwrap();
        for (k, v) in &items {
            direct.insert(k.clone(), v.clone()).await.unwrap();
        }
        direct.close().await.unwrap();

        let buffered_stream = MemoryStream::new();
        let inner = Database::open(buffered_stream.clone()).await.unwrap();
        let buffered = BufferedDatabase::new(inner, MIN_BUFFER_SIZE);
        for (k, v) in &items {
            buffered.insert(k.clone(), v.clone()).await.unwrap();
            buffered.flush().await.unwrap();
        }
        buffered.dispose(true).await.unwrap();

        assert_eq!(direct_stream.snapshot(), buffered_stream.snapshot());
    }

    #[tokio::test]
    #[should_panic(expected = "buffer_size must be at least")]
    async fn new_panics_below_minimum_buffer_size() {
        let inner = Database::open(MemoryStream::new()).await.unwrap();
        let _ = BufferedDatabase::new(inner, MIN_BUFFER_SIZE - 1);
    }
}
