//! The base database: `insert`/`insert_range` plus a lazy, restartable
//! iterator over `(key, value-loader)` pairs.

use std::sync::Arc;

use futures::Stream;
use tokio::io::{AsyncRead, AsyncSeek, AsyncWrite};
use tokio::sync::Mutex;

use crate::device::{DatabaseDevice, Item};
use crate::error::DatabaseResult;

/// A lazy handle to a value, tied to the device it was read from and the
/// absolute offset of its value record.
///
/// The loader holds no lock on the device between construction and
/// [`ValueLoader::load`]; callers must invoke `load` on the same logical
/// owner as the iterator that produced it, or through the query manager's
/// serialization discipline. The first call seeks, decodes, and caches the
/// bytes; every later call returns the cached copy.
pub struct ValueLoader<S> {
    device: Arc<Mutex<DatabaseDevice<S>>>,
    data_position: i64,
    cached: Option<Vec<u8>>,
}

impl<S> ValueLoader<S>
where
    S: AsyncRead + AsyncWrite + AsyncSeek + Unpin + Send,
{
    fn new(device: Arc<Mutex<DatabaseDevice<S>>>, data_position: i64) -> Self {
        Self {
            device,
            data_position,
            cached: None,
        }
    }

    /// An eager loader that already holds its value, used for buffered
    /// entries that have not yet been flushed to the device.
    fn eager(device: Arc<Mutex<DatabaseDevice<S>>>, value: Vec<u8>) -> Self {
        Self {
            device,
            data_position: -1,
            cached: Some(value),
        }
    }

    /// Materializes the value, seeking and decoding on the first call and
    /// returning the cached bytes on every later one.
    pub async fn load(&mut self) -> DatabaseResult<Vec<u8>> {
        if let Some(value) = &self.cached {
            return Ok(value.clone());
        }
        let value = self.device.lock().await.read_value(self.data_position).await?;
        self.cached = Some(value.clone());
        Ok(value)
    }
}

// Manual `Clone` impl: cloning only needs to duplicate the `Arc` and the
// (possibly already-populated) cache, never `S` itself, so this must not
// carry a `S: Clone` bound the way `#[derive(Clone)]` would add.
impl<S> Clone for ValueLoader<S> {
    fn clone(&self) -> Self {
        Self {
            device: Arc::clone(&self.device),
            data_position: self.data_position,
            cached: self.cached.clone(),
        }
    }
}

/// The base, unbuffered database: atomic batch inserts over a
/// [`DatabaseDevice`], and a lazy iterator over everything it has ever
/// stored.
///
/// `Database` is not internally thread-safe for writes -- callers must
/// serialize `insert`/`insert_range` calls -- but the device is wrapped in
/// an `Arc<Mutex<_>>` so that [`ValueLoader`]s produced by one iteration
/// can be materialized later, including from a different task (as the
/// query manager does).
pub struct Database<S> {
    device: Arc<Mutex<DatabaseDevice<S>>>,
}

/// Cloning shares the same underlying device: every clone is a handle onto
/// the same jump chain, the same way [`ValueLoader`] clones share their
/// back-reference. Used by [`crate::query::QueryManager`], which needs its
/// own long-lived handle alongside the caller's.
impl<S> Clone for Database<S> {
    fn clone(&self) -> Self {
        Self {
            device: Arc::clone(&self.device),
        }
    }
}

impl<S> Database<S>
where
    S: AsyncRead + AsyncWrite + AsyncSeek + Unpin + Send + 'static,
{
    /// Opens a database over `stream`.
    pub async fn open(stream: S) -> DatabaseResult<Self> {
        let device = DatabaseDevice::open(stream).await?;
        Ok(Self {
            device: Arc::new(Mutex::new(device)),
        })
    }

    /// Wraps an already-constructed device.
    pub fn from_device(device: DatabaseDevice<S>) -> Self {
        Self {
            device: Arc::new(Mutex::new(device)),
        }
    }

    /// Inserts a single key/value pair. Equivalent to
    /// `insert_range(&[(key, value)])`.
    pub async fn insert(&self, key: Vec<u8>, value: Vec<u8>) -> DatabaseResult<()> {
        self.insert_range(&[(key, value)]).await
    }

    /// Commits `items` as a single block via the device's insert-batch
    /// protocol.
    pub async fn insert_range(&self, items: &[Item]) -> DatabaseResult<()> {
        self.device.lock().await.insert(items).await?;
        Ok(())
    }

    /// Produces a restartable, finite, single-pass-per-construction lazy
    /// stream of `(key, loader)` pairs in insertion order. A fresh call
    /// always starts from the head of the jump chain.
    pub fn iter(&self) -> impl Stream<Item = DatabaseResult<(Vec<u8>, ValueLoader<S>)>> {
        let device = Arc::clone(&self.device);
        async_stream::try_stream! {
            device.lock().await.reset().await?;
            loop {
                let next = device.lock().await.read_next().await?;
                match next {
                    Some(entry) => {
                        let loader = ValueLoader::new(Arc::clone(&device), entry.data_position);
                        yield (entry.key, loader);
                    }
                    None => break,
                }
            }
        }
    }

    /// Exposes the device handle, for layers (the buffered database, the
    /// query manager) built directly on top of `Database`.
    pub(crate) fn device_handle(&self) -> Arc<Mutex<DatabaseDevice<S>>> {
        Arc::clone(&self.device)
    }

    /// Builds an eager loader for a value that hasn't been committed to
    /// the device yet (used by the buffered database's virtual tail).
    pub(crate) fn eager_loader(&self, value: Vec<u8>) -> ValueLoader<S> {
        ValueLoader::eager(Arc::clone(&self.device), value)
    }

    /// Flushes the underlying device.
    pub async fn flush(&self) -> DatabaseResult<()> {
        self.device.lock().await.flush().await?;
        Ok(())
    }

    /// Finalizes the database, writing the jump-chain head back into the
    /// file header. Idempotent only in the sense that the caller must not
    /// use the database afterward; there's nothing left to dispose twice.
    ///
    /// # Panics
    ///
    /// Panics if other handles to the same device (e.g. a
    /// [`crate::query::QueryManager`] built from a clone of this
    /// `Database`) are still alive.
    pub async fn close(self) -> DatabaseResult<()> {
        let device = Arc::try_unwrap(self.device)
            .unwrap_or_else(|arc| {
                panic!("close() called while {} other handle(s) to the device are still alive", Arc::strong_count(&arc) - 1)
            })
            .into_inner();
        device.dispose().await?;
        Ok(())
    }
}
