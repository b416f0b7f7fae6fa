//! StringDB: an embeddable, single-file, append-only key/value store with
//! an on-disk "jump chain" format and a lazy, streaming read model.
//!
//! Each logical commit ([`Database::insert_range`]) writes a self-contained
//! block -- a run of index records followed by their values -- stitched to
//! the previous block by a single forward-pointing jump record. Readers
//! walk this chain lazily via [`Database::iter`] and materialize a value
//! only when its [`database::ValueLoader`] is invoked.
//!
//! Layers, bottom to top:
//!
//! - [`format`]: the wire format and the byte-level device that reads and
//!   writes it.
//! - [`device`]: the database I/O device -- a linear `(key, data-position)`
//!   stream stitched out of the low-level device's blocks, plus the atomic
//!   insert-batch protocol.
//! - [`database`]: [`Database`], the public base type: `insert`,
//!   `insert_range`, and a lazy `iter()`.
//! - [`buffered`]: [`buffered::BufferedDatabase`], which coalesces many
//!   small inserts into one batch.
//! - [`query`]: [`query::QueryManager`], which fans out one scan of a
//!   `Database` to many concurrent subscribers.
//!
//! The core stores opaque byte strings for both key and value; it has no
//! opinion on serialization, and no concept of deletion, in-place mutation,
//! or range scans by key order -- iteration order is always insertion
//! order.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::type_complexity)] // long-types happen, especially in async code
#![allow(clippy::must_use_candidate)]

#[macro_use]
extern crate tracing;

pub mod buffered;
pub mod config;
pub mod database;
pub mod device;
pub mod error;
pub mod format;
pub mod query;
pub mod sync;

#[cfg(test)]
pub(crate) mod test_support;

pub use buffered::BufferedDatabase;
pub use database::{Database, ValueLoader};
pub use query::{ProcessResult, Query, QueryManager, Subscription, ValueRequest};
