//! Error types for every layer of the store.
//!
//! Each layer gets its own [`snafu`]-derived enum, mirroring the shape of the
//! operation it guards: the low-level device reports wire-format problems,
//! the database device adds disposal and device failures, and the query
//! manager adds cancellation on top of that. Errors are never retried here
//! -- the on-disk format has no recovery discipline (see the crate's module
//! documentation), so a [`FormatError`] or [`DeviceError`] is always fatal to
//! the operation that produced it.

use std::io;

use snafu::Snafu;

/// Errors raised while decoding the on-disk wire format.
///
/// These correspond to the "FormatError" kind in the design: a malformed
/// marker byte, an unsupported length tag, or a record that runs past the
/// end of the stream when a complete one was expected.
#[derive(Debug, Snafu)]
pub enum FormatError {
    /// A length-prefix tag other than `0x01`, `0x02`, or `0x03` was read.
    #[snafu(display("invalid length tag {:#04x}, expected 0x01, 0x02, or 0x03", tag))]
    InvalidLengthTag { tag: u8 },

    /// A byte was read where a key-length, marker, or EOF sentinel was
    /// expected, but it didn't decode as any of them.
    #[snafu(display("invalid record marker byte {:#04x}", byte))]
    InvalidMarker { byte: u8 },

    /// An index record's key length decoded outside of `1..=253`.
    #[snafu(display("key length {} out of range (must be 1..=253)", len))]
    KeyLengthOutOfRange { len: usize },

    /// The stream ended in the middle of a record that should have been
    /// complete (e.g. a jump record's 8-byte offset, or a value's payload).
    #[snafu(display("stream ended while reading a {} record", what))]
    Truncated { what: &'static str },
}

/// Errors raised when a caller asks the device to write something that
/// violates a hard limit of the wire format.
///
/// These are caller faults: the format simply cannot represent the request,
/// so the write never touches the stream.
#[derive(Debug, Snafu)]
pub enum LimitError {
    /// Attempted to write a key longer than 253 bytes.
    #[snafu(display("key of length {} exceeds the maximum of 253 bytes", len))]
    KeyTooLong { len: usize },

    /// Attempted to write a value whose length doesn't fit in a 4-byte
    /// length prefix.
    #[snafu(display("value of length {} exceeds the maximum representable length", len))]
    ValueTooLarge { len: u64 },
}

/// Errors surfaced by the low-level I/O device and the database device.
///
/// I/O and format errors are surfaced unchanged from the point they occur;
/// they are never retried, because the append-only format has no mechanism
/// for recovering a torn or corrupted write.
#[derive(Debug, Snafu)]
pub enum DeviceError {
    /// The underlying stream returned an I/O error (short read, failed seek,
    /// etc.).
    #[snafu(display("stream I/O error: {}", source))]
    Io { source: io::Error },

    /// The wire format was violated.
    #[snafu(context(false))]
    Format { source: FormatError },

    /// The caller tried to write something the format cannot represent.
    #[snafu(context(false))]
    Limit { source: LimitError },

    /// A `seek` was requested to a position outside `0..=len`.
    #[snafu(display("seek to {} is out of bounds for a stream of length {}", pos, len))]
    InvalidSeek { pos: i64, len: u64 },

    /// The device was already disposed.
    #[snafu(display("operation invoked on a disposed device"))]
    Disposed,
}

impl From<io::Error> for DeviceError {
    fn from(source: io::Error) -> Self {
        DeviceError::Io { source }
    }
}

/// Errors surfaced by [`Database`](crate::database::Database) and
/// [`BufferedDatabase`](crate::buffered::BufferedDatabase).
#[derive(Debug, Snafu)]
pub enum DatabaseError {
    /// The underlying device failed.
    #[snafu(context(false))]
    Device { source: DeviceError },

    /// The database was already disposed.
    #[snafu(display("operation invoked on a disposed database"))]
    Disposed,
}

impl From<io::Error> for DatabaseError {
    fn from(source: io::Error) -> Self {
        DeviceError::from(source).into()
    }
}

/// Errors surfaced by the query manager and its subscribers.
///
/// Cancellation is modeled here as a typed, normal termination path rather
/// than a panic: a cancelled query or manager loop returns
/// [`QueryError::Cancelled`] instead of tearing down the process.
#[derive(Debug, Snafu)]
pub enum QueryError {
    /// The underlying database failed.
    #[snafu(context(false))]
    Database { source: DatabaseError },

    /// Cooperative cancellation was signalled before the operation
    /// completed.
    #[snafu(display("operation cancelled"))]
    Cancelled,

    /// The manager (or the subscriber's channel to it) has shut down.
    #[snafu(display("query manager is no longer running"))]
    ManagerGone,
}

pub type DeviceResult<T> = Result<T, DeviceError>;
pub type DatabaseResult<T> = Result<T, DatabaseError>;
pub type QueryResult<T> = Result<T, QueryError>;
