//! The database I/O device: a linear `(key, data-position)` stream stitched
//! together out of the low-level device's blocks, plus the atomic
//! insert-batch protocol.

use tokio::io::{AsyncRead, AsyncSeek, AsyncWrite};

use crate::error::DeviceResult;
use crate::format::LowLevelDevice;
use crate::format::Peek;

/// One key/value pair to be committed as part of a batch.
pub type Item = (Vec<u8>, Vec<u8>);

/// A `(key, data-position)` pair read off the jump chain. `data_position`
/// is the absolute offset of the value record; callers materialize it with
/// [`DatabaseDevice::read_value`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPosition {
    pub key: Vec<u8>,
    pub data_position: i64,
}

/// Raised whenever `read_next` had to follow one or more jump records to
/// find its result, hinting that the read just crossed a block boundary.
///
/// This is a one-shot flag: calling [`DatabaseDevice::take_optimal_read_hint`]
/// both reads and clears it.
#[derive(Debug, Default)]
struct OptimalReadFlag(bool);

/// Presents the low-level device as a linear stream of index entries,
/// transparently following jump records, and implements the atomic
/// "insert a batch" protocol described in the crate's module
/// documentation.
///
/// Like [`LowLevelDevice`], `DatabaseDevice` is not internally
/// thread-safe; it assumes a single logical owner driving `read_next` and
/// `insert` calls one at a time.
#[derive(Debug)]
pub struct DatabaseDevice<S> {
    low_level: LowLevelDevice<S>,
    open_jump_position: i64,
    optimal_read: OptimalReadFlag,
}

impl<S> DatabaseDevice<S>
where
    S: AsyncRead + AsyncWrite + AsyncSeek + Unpin + Send,
{
    /// Wraps an already-opened [`LowLevelDevice`].
    ///
    /// The header's head-of-chain offset is the position of the currently
    /// open (still-zero) tail jump record, so reopening an existing file
    /// picks up exactly where the previous session's `insert` left off --
    /// the next `insert` patches that same slot instead of leaving it
    /// dangling.
    pub fn new(low_level: LowLevelDevice<S>) -> Self {
        let open_jump_position = low_level.head_of_chain();
        Self {
            low_level,
            open_jump_position,
            optimal_read: OptimalReadFlag::default(),
        }
    }

    /// Opens a device over `stream`, delegating header handling to
    /// [`LowLevelDevice::open`].
    pub async fn open(stream: S) -> DeviceResult<Self> {
        Ok(Self::new(LowLevelDevice::open(stream).await?))
    }

    /// Seeks to the start of the jump chain (offset 8, just past the
    /// header). The header's head-of-chain offset names the currently open
    /// tail jump, not the first record, so it plays no part in where a
    /// scan begins.
    pub async fn reset(&mut self) -> DeviceResult<()> {
        self.low_level.reset().await
    }

    /// Reads the next `(key, data-position)` pair, transparently
    /// following jump records until an index record or end-of-items is
    /// found.
    pub async fn read_next(&mut self) -> DeviceResult<Option<KeyPosition>> {
        let mut crossed_jump = false;
        loop {
            match self.low_level.peek().await? {
                Peek::Jump => {
                    let next = self.low_level.read_jump().await?;
                    crossed_jump = true;
                    if next == 0 {
                        // Open tail: nothing written past this block yet.
                        self.optimal_read.0 = crossed_jump;
                        return Ok(None);
                    }
                    self.low_level.seek(next).await?;
                }
                Peek::EndOfFile => {
                    self.optimal_read.0 = crossed_jump;
                    return Ok(None);
                }
                Peek::Index => {
                    let record = self.low_level.read_index().await?;
                    self.optimal_read.0 = crossed_jump;
                    return Ok(Some(KeyPosition {
                        key: record.key,
                        data_position: record.data_position,
                    }));
                }
            }
        }
    }

    /// Reads whether the most recent `read_next` call crossed one or more
    /// block boundaries, clearing the flag.
    pub fn take_optimal_read_hint(&mut self) -> bool {
        std::mem::take(&mut self.optimal_read.0)
    }

    /// Reads the value at `data_position` without disturbing the current
    /// iteration cursor.
    pub async fn read_value(&mut self, data_position: i64) -> DeviceResult<Vec<u8>> {
        self.low_level.read_value(data_position).await
    }

    /// Commits `items` as a single atomic block: all of their index
    /// records, one trailing jump, then all of their value records, in
    /// that order.
    ///
    /// A crash between patching the previous block's jump and writing the
    /// new one's can leave a dangling pointer to a partially written
    /// block; this format provides no recovery from that (see the crate's
    /// module documentation on durability).
    #[instrument(skip(self, items), fields(count = items.len()), level = "debug")]
    pub async fn insert(&mut self, items: &[Item]) -> DeviceResult<()> {
        if items.is_empty() {
            return Ok(());
        }

        let block_start = self.low_level.seek_end().await?;

        // Patch the previously open jump slot to point at this new block.
        // No-op on the very first batch, when `open_jump_position` is 0.
        if self.open_jump_position != 0 {
            let after = self.low_level.position().await?;
            self.low_level.seek(self.open_jump_position).await?;
            self.low_level.write_jump(block_start).await?;
            self.low_level.seek(after).await?;
        }

        let mut offset = block_start as u64
            + items
                .iter()
                .map(|(k, _)| LowLevelDevice::<S>::calc_index_offset(k))
                .sum::<u64>()
            + LowLevelDevice::<S>::jump_offset_size();

        for (key, value) in items {
            self.low_level.write_index(key, offset as i64).await?;
            offset += LowLevelDevice::<S>::calc_value_offset(value)?;
        }

        let new_jump_position = self.low_level.position().await?;
        self.low_level.write_jump(0).await?;
        self.open_jump_position = new_jump_position;
        self.low_level.set_head_of_chain(new_jump_position);

        for (_, value) in items {
            self.low_level.write_value(value).await?;
        }

        Ok(())
    }

    /// Flushes the underlying stream.
    pub async fn flush(&mut self) -> DeviceResult<()> {
        self.low_level.flush().await
    }

    /// Finalizes the device, writing the jump-chain head back into the
    /// file header.
    pub async fn dispose(self) -> DeviceResult<()> {
        self.low_level.dispose().await
    }
}
