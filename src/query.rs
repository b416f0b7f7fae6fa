//! The query manager: fans out one streaming scan of a [`Database`] to many
//! concurrent subscribers, and serializes their random-access value loads
//! against that scan.
//!
//! The manager runs two long-lived tasks once [`QueryManager::spawn`] is
//! called:
//!
//! - the *scanner*, which waits for at least one active subscriber, then
//!   drives `database.iter()` and broadcasts each `(record_id, key)` pair
//!   to every subscriber that's active at that instant;
//! - the *listener*, which drains a control channel of `Go`/`Stop`/`Load`
//!   messages from subscribers, mutating the active set and servicing
//!   value loads.
//!
//! The two communicate through a shared active-subscriber map (guarded by
//! a plain [`parking_lot::Mutex`] -- the "light mutex" of the crate's
//! shared primitives) and a `worker_lock` (a [`tokio::sync::Mutex`]) that
//! the scanner holds while broadcasting a record and relinquishes before
//! advancing to the next one, so that a pending `Load` always gets a
//! chance to run between records rather than being starved by a scan that
//! never yields.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex as SyncMutex;
use tokio::io::{AsyncRead, AsyncSeek, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;

use crate::database::{Database, ValueLoader};
use crate::error::{QueryError, QueryResult};
use crate::sync::CancellationToken;

/// Capacity of each subscriber's delivery channel. Once full, the scanner's
/// broadcast to that subscriber backpressures the whole scan -- a slow
/// subscriber holds up everyone, the same way a single slow reader would in
/// the source's broadcast design.
const DELIVERY_CHANNEL_CAPACITY: usize = 64;

/// What a [`Query`] returns from [`Query::process`]: whether it wants to
/// keep receiving records, or is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessResult {
    /// Keep delivering records.
    Continue,
    /// Stop delivering records; the subscriber's `run` loop exits.
    Completed,
}

/// A query, driven one record at a time by a [`Subscription`].
///
/// `process` may or may not call [`ValueRequest::load`] -- a query that
/// only inspects keys never materializes a single value.
#[async_trait]
pub trait Query<S>: Send
where
    S: AsyncRead + AsyncWrite + AsyncSeek + Unpin + Send + 'static,
{
    /// Handles one delivered record, returning whether to keep going.
    async fn process(&mut self, key: Vec<u8>, request: ValueRequest<S>) -> ProcessResult;
}

/// A lazy handle to the value of one delivered record.
///
/// Invoking [`ValueRequest::load`] sends a `Load` message back to the
/// manager and awaits its reply, so the read is serialized against the
/// scan via the manager's `worker_lock` rather than racing it directly.
pub struct ValueRequest<S> {
    record_id: u64,
    subscriber_id: u64,
    loader: ValueLoader<S>,
    control_tx: mpsc::UnboundedSender<ControlMessage<S>>,
}

impl<S> ValueRequest<S>
where
    S: AsyncRead + AsyncWrite + AsyncSeek + Unpin + Send + 'static,
{
    /// The monotonically increasing id this record was broadcast with,
    /// restarted at the beginning of each scan. Subscribers use it to
    /// correlate out-of-order replies if they ever issue more than one
    /// `load` concurrently.
    pub fn record_id(&self) -> u64 {
        self.record_id
    }

    /// The id of the subscriber this record was delivered to.
    pub fn subscriber_id(&self) -> u64 {
        self.subscriber_id
    }

    /// Materializes this record's value, by way of the manager.
    pub async fn load(self) -> QueryResult<Vec<u8>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.control_tx
            .send(ControlMessage::Load {
                loader: self.loader,
                reply: reply_tx,
            })
            .map_err(|_| QueryError::ManagerGone)?;
        reply_rx.await.map_err(|_| QueryError::ManagerGone)?
    }
}

/// One broadcast record, delivered to a subscriber's delivery pipe.
struct Envelope<S> {
    record_id: u64,
    key: Vec<u8>,
    loader: ValueLoader<S>,
}

/// Control-plane messages a subscriber (or its [`ValueRequest`]) sends to
/// the manager.
enum ControlMessage<S> {
    /// Begin receiving broadcast records.
    Go {
        subscriber_id: u64,
        delivery_tx: mpsc::Sender<Envelope<S>>,
    },
    /// Cease receiving broadcast records.
    Stop { subscriber_id: u64 },
    /// Materialize the value behind `loader`, under the scan lock.
    Load {
        loader: ValueLoader<S>,
        reply: oneshot::Sender<QueryResult<Vec<u8>>>,
    },
}

type ActiveSet<S> = Arc<SyncMutex<HashMap<u64, mpsc::Sender<Envelope<S>>>>>;

/// One user query's handle onto a [`QueryManager`].
///
/// Dropping a `Subscription` without calling [`Subscription::run`] simply
/// never activates it -- the manager never learns it exists.
pub struct Subscription<S> {
    id: u64,
    control_tx: mpsc::UnboundedSender<ControlMessage<S>>,
    delivery_tx: Option<mpsc::Sender<Envelope<S>>>,
    delivery_rx: mpsc::Receiver<Envelope<S>>,
}

impl<S> Subscription<S>
where
    S: AsyncRead + AsyncWrite + AsyncSeek + Unpin + Send + 'static,
{
    /// Drives `query` with records from the manager until it returns
    /// [`ProcessResult::Completed`], the manager shuts down, or
    /// `cancel` is signalled. Always sends `Stop` on the way out.
    #[instrument(skip(self, query, cancel), fields(subscriber_id = self.id), level = "debug")]
    pub async fn run<Q>(mut self, mut query: Q, cancel: &CancellationToken) -> QueryResult<()>
    where
        Q: Query<S>,
    {
        let delivery_tx = self
            .delivery_tx
            .take()
            .expect("Subscription::run is only ever called once");
        let _ = self.control_tx.send(ControlMessage::Go {
            subscriber_id: self.id,
            delivery_tx,
        });

        let outcome = loop {
            let envelope = tokio::select! {
                () = cancel.cancelled() => break Err(QueryError::Cancelled),
                envelope = self.delivery_rx.recv() => envelope,
            };
            let Some(envelope) = envelope else {
                break Ok(());
            };
            let request = ValueRequest {
                record_id: envelope.record_id,
                subscriber_id: self.id,
                loader: envelope.loader,
                control_tx: self.control_tx.clone(),
            };
            match query.process(envelope.key, request).await {
                ProcessResult::Continue => continue,
                ProcessResult::Completed => break Ok(()),
            }
        };

        let _ = self.control_tx.send(ControlMessage::Stop {
            subscriber_id: self.id,
        });
        outcome
    }
}

/// Fans out one streaming scan of a [`Database`] to many concurrent
/// [`Subscription`]s.
///
/// Construction spawns the scanner and listener tasks; dropping or
/// discarding the manager does not stop them -- call
/// [`QueryManager::shutdown`] and, if you want to wait for a clean exit,
/// [`QueryManager::join`].
pub struct QueryManager<S> {
    control_tx: mpsc::UnboundedSender<ControlMessage<S>>,
    next_subscriber_id: AtomicU64,
    cancel: CancellationToken,
    scanner: JoinHandle<()>,
    listener: JoinHandle<()>,
}

impl<S> QueryManager<S>
where
    S: AsyncRead + AsyncWrite + AsyncSeek + Unpin + Send + 'static,
{
    /// Starts the manager's scanner and listener tasks over `database`.
    pub fn spawn(database: Database<S>) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let active: ActiveSet<S> = Arc::new(SyncMutex::new(HashMap::new()));
        let worker_lock = Arc::new(AsyncMutex::new(()));
        let wait_notify = Arc::new(Notify::new());
        let cancel = CancellationToken::new();

        let scanner = tokio::spawn(run_scanner(
            database,
            Arc::clone(&active),
            Arc::clone(&worker_lock),
            Arc::clone(&wait_notify),
            cancel.clone(),
        ));
        let listener = tokio::spawn(run_listener(
            control_rx,
            active,
            worker_lock,
            wait_notify,
            cancel.clone(),
        ));

        Self {
            control_tx,
            next_subscriber_id: AtomicU64::new(0),
            cancel,
            scanner,
            listener,
        }
    }

    /// Allocates a new subscriber handle. The subscriber isn't added to the
    /// active set -- and so won't see any records -- until
    /// [`Subscription::run`] is called on it.
    pub fn subscribe(&self) -> Subscription<S> {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (delivery_tx, delivery_rx) = mpsc::channel(DELIVERY_CHANNEL_CAPACITY);
        Subscription {
            id,
            control_tx: self.control_tx.clone(),
            delivery_tx: Some(delivery_tx),
            delivery_rx,
        }
    }

    /// The cancellation token shared by the manager's own tasks. Subscribers
    /// started with a clone of this token stop when the manager shuts down.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Signals cancellation. Cooperative: the scanner and listener exit at
    /// their next suspension point, without attempting further I/O.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Waits for the scanner and listener tasks to exit. Call
    /// [`QueryManager::shutdown`] first, or this waits forever if
    /// subscribers remain active.
    pub async fn join(self) {
        let _ = self.scanner.await;
        let _ = self.listener.await;
    }
}

#[instrument(skip_all, level = "debug")]
async fn run_scanner<S>(
    database: Database<S>,
    active: ActiveSet<S>,
    worker_lock: Arc<AsyncMutex<()>>,
    wait_notify: Arc<Notify>,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + AsyncSeek + Unpin + Send + 'static,
{
    loop {
        if wait_for_subscribers(&active, &wait_notify, &cancel).await.is_err() {
            return;
        }

        let mut record_id: u64 = 0;
        let stream = database.iter();
        tokio::pin!(stream);
        let mut guard = worker_lock.lock().await;

        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => {
                    drop(guard);
                    return;
                }
                next = stream.next() => next,
            };

            let (key, loader) = match next {
                None => break,
                Some(Err(e)) => {
                    warn!(error = %e, "scan aborted by device error");
                    break;
                }
                Some(Ok(entry)) => entry,
            };

            let subscribers: Vec<(u64, mpsc::Sender<Envelope<S>>)> = {
                let active = active.lock();
                active.iter().map(|(id, tx)| (*id, tx.clone())).collect()
            };
            if subscribers.is_empty() {
                break;
            }

            let id = record_id;
            record_id += 1;
            trace!(record_id = id, fanout = subscribers.len(), "broadcasting record");
            for (subscriber_id, tx) in subscribers {
                let envelope = Envelope {
                    record_id: id,
                    key: key.clone(),
                    loader: loader.clone(),
                };
                if tx.send(envelope).await.is_err() {
                    debug!(subscriber_id, "dropping unreachable subscriber");
                    active.lock().remove(&subscriber_id);
                }
            }

            // Relinquish the scan lock between emissions so a pending
            // `Load` is never starved by a scan that never yields.
            drop(guard);
            tokio::task::yield_now().await;
            guard = worker_lock.lock().await;
        }

        drop(guard);
    }
}

/// Blocks until the active set is non-empty, or returns `Err(())` if
/// cancellation fired first.
async fn wait_for_subscribers<S>(
    active: &ActiveSet<S>,
    wait_notify: &Notify,
    cancel: &CancellationToken,
) -> Result<(), ()> {
    loop {
        if !active.lock().is_empty() {
            return Ok(());
        }
        if cancel.is_cancelled() {
            return Err(());
        }
        // Subscribe to the notification *before* the second emptiness
        // check, so a `Go` that lands between the check and the `await`
        // below isn't missed.
        let notified = wait_notify.notified();
        if !active.lock().is_empty() {
            return Ok(());
        }
        tokio::select! {
            () = notified => {}
            () = cancel.cancelled() => return Err(()),
        }
    }
}

#[instrument(skip_all, level = "debug")]
async fn run_listener<S>(
    mut control_rx: mpsc::UnboundedReceiver<ControlMessage<S>>,
    active: ActiveSet<S>,
    worker_lock: Arc<AsyncMutex<()>>,
    wait_notify: Arc<Notify>,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + AsyncSeek + Unpin + Send + 'static,
{
    loop {
        let message = tokio::select! {
            () = cancel.cancelled() => return,
            message = control_rx.recv() => message,
        };
        let Some(message) = message else {
            return;
        };

        match message {
            ControlMessage::Go {
                subscriber_id,
                delivery_tx,
            } => {
                active.lock().insert(subscriber_id, delivery_tx);
                wait_notify.notify_waiters();
                debug!(subscriber_id, "subscriber activated");
            }
            ControlMessage::Stop { subscriber_id } => {
                active.lock().remove(&subscriber_id);
                debug!(subscriber_id, "subscriber stopped");
            }
            ControlMessage::Load { mut loader, reply } => {
                let _guard = worker_lock.lock().await;
                let result = loader.load().await.map_err(QueryError::from);
                let _ = reply.send(result);
            }
        }
    }
}
