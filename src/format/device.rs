use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, AsyncWrite, AsyncWriteExt, SeekFrom};

use super::record::{IndexRecord, Peek};
use super::{
    index_record_len, LengthTag, JUMP_RECORD_LEN, MARKER_DELETED, MARKER_EOF, MARKER_JUMP,
    MAX_KEY_LEN, TYPE_TAG,
};
use crate::error::{DeviceError, DeviceResult, FormatError, LimitError};

/// Bit-exact reader/writer for the StringDB wire format over a seekable
/// byte stream.
///
/// `LowLevelDevice` has strict pre- and postconditions on the stream
/// cursor for every operation: reads leave the cursor immediately after
/// what they read, writes leave it immediately after what they wrote, and
/// `peek`/`read_value` restore the cursor to where they found it. It knows
/// nothing about blocks, batching, or iteration order -- that's
/// [`crate::device::DatabaseDevice`]'s job.
///
/// Not thread-safe: callers must serialize access to a single
/// `LowLevelDevice`, the same way a single file descriptor has one logical
/// owner at a time.
#[derive(Debug)]
pub struct LowLevelDevice<S> {
    stream: S,
    head_of_chain: i64,
}

impl<S> LowLevelDevice<S>
where
    S: AsyncRead + AsyncWrite + AsyncSeek + Unpin + Send,
{
    /// Opens a device over `stream`, initializing the 8-byte header if the
    /// stream is shorter than 8 bytes, or reading the existing
    /// head-of-chain offset otherwise.
    #[instrument(skip_all, level = "debug")]
    pub async fn open(mut stream: S) -> DeviceResult<Self> {
        let len = stream.seek(SeekFrom::End(0)).await?;
        let head_of_chain = if len < 8 {
            stream.seek(SeekFrom::Start(0)).await?;
            stream.write_all(&[0u8; 8]).await?;
            stream.flush().await?;
            0
        } else {
            stream.seek(SeekFrom::Start(0)).await?;
            let mut buf = [0u8; 8];
            stream.read_exact(&mut buf).await?;
            (&buf[..]).get_i64_le()
        };
        stream.seek(SeekFrom::Start(8)).await?;
        Ok(Self {
            stream,
            head_of_chain,
        })
    }

    /// Seeks to the first record position (offset 8, just past the
    /// header).
    pub async fn reset(&mut self) -> DeviceResult<()> {
        self.seek(8).await
    }

    /// Seeks to an absolute offset, rejecting anything outside `0..=len`.
    pub async fn seek(&mut self, pos: i64) -> DeviceResult<()> {
        let len = self.stream_len().await?;
        if pos < 0 || pos as u64 > len {
            return Err(DeviceError::InvalidSeek { pos, len });
        }
        self.stream.seek(SeekFrom::Start(pos as u64)).await?;
        Ok(())
    }

    /// Seeks to the end of the stream and returns the resulting offset.
    pub async fn seek_end(&mut self) -> DeviceResult<i64> {
        let pos = self.stream.seek(SeekFrom::End(0)).await?;
        Ok(pos as i64)
    }

    /// Reports the current stream offset without moving the cursor.
    pub async fn position(&mut self) -> DeviceResult<i64> {
        let pos = self.stream.seek(SeekFrom::Current(0)).await?;
        Ok(pos as i64)
    }

    async fn stream_len(&mut self) -> DeviceResult<u64> {
        let cur = self.stream.seek(SeekFrom::Current(0)).await?;
        let len = self.stream.seek(SeekFrom::End(0)).await?;
        self.stream.seek(SeekFrom::Start(cur)).await?;
        Ok(len)
    }

    /// Reads one byte without consuming it, classifying it as
    /// [`Peek::EndOfFile`], [`Peek::Jump`], or [`Peek::Index`].
    pub async fn peek(&mut self) -> DeviceResult<Peek> {
        let pos = self.position().await?;
        let mut byte = [0u8; 1];
        let n = self.stream.read(&mut byte).await?;
        self.seek(pos).await?;
        if n == 0 {
            return Ok(Peek::EndOfFile);
        }
        Ok(match byte[0] {
            MARKER_EOF | MARKER_DELETED => Peek::EndOfFile,
            MARKER_JUMP => Peek::Jump,
            _ => Peek::Index,
        })
    }

    /// Reads an index record at the current position. The cursor must be
    /// at [`Peek::Index`].
    #[instrument(skip(self), level = "trace")]
    pub async fn read_index(&mut self) -> DeviceResult<IndexRecord> {
        let mut len_byte = [0u8; 1];
        self.read_exact_or_truncated(&mut len_byte, "index length").await?;
        let len = len_byte[0];
        if len == 0 || len as usize > MAX_KEY_LEN {
            return Err(FormatError::KeyLengthOutOfRange { len: len as usize }.into());
        }

        let mut pos_buf = [0u8; 8];
        self.read_exact_or_truncated(&mut pos_buf, "index data position").await?;
        let data_position = (&pos_buf[..]).get_i64_le();

        let mut tag_buf = [0u8; 1];
        self.read_exact_or_truncated(&mut tag_buf, "index type tag").await?;

        let mut key = vec![0u8; len as usize];
        self.read_exact_or_truncated(&mut key, "index key").await?;

        Ok(IndexRecord { key, data_position })
    }

    /// Reads a jump record at the current position, returning the next
    /// offset (0 denotes the open tail). The cursor must be at
    /// [`Peek::Jump`].
    pub async fn read_jump(&mut self) -> DeviceResult<i64> {
        let mut marker = [0u8; 1];
        self.read_exact_or_truncated(&mut marker, "jump marker").await?;
        if marker[0] != MARKER_JUMP {
            return Err(FormatError::InvalidMarker { byte: marker[0] }.into());
        }

        let mut offset_buf = [0u8; 8];
        self.read_exact_or_truncated(&mut offset_buf, "jump offset").await?;
        Ok((&offset_buf[..]).get_i64_le())
    }

    /// Reads the value record at absolute offset `p`, restoring the
    /// cursor to wherever it was before the call. Never alters logical
    /// iteration state.
    #[instrument(skip(self), level = "trace")]
    pub async fn read_value(&mut self, p: i64) -> DeviceResult<Vec<u8>> {
        let saved = self.position().await?;
        self.seek(p).await?;

        let mut tag = [0u8; 1];
        self.read_exact_or_truncated(&mut tag, "value type tag").await?;

        let mut len_tag_buf = [0u8; 1];
        self.read_exact_or_truncated(&mut len_tag_buf, "value length tag").await?;
        let len_tag = LengthTag::from_byte(len_tag_buf[0])?;

        let len: u64 = match len_tag {
            LengthTag::U8 => {
                let mut b = [0u8; 1];
                self.read_exact_or_truncated(&mut b, "value length").await?;
                b[0] as u64
            }
            LengthTag::U16 => {
                let mut b = [0u8; 2];
                self.read_exact_or_truncated(&mut b, "value length").await?;
                (&b[..]).get_u16_le() as u64
            }
            LengthTag::U32 => {
                let mut b = [0u8; 4];
                self.read_exact_or_truncated(&mut b, "value length").await?;
                (&b[..]).get_u32_le() as u64
            }
        };

        let mut payload = vec![0u8; len as usize];
        self.read_exact_or_truncated(&mut payload, "value payload").await?;

        self.seek(saved).await?;
        Ok(payload)
    }

    /// Writes a jump record at the current (tail) position.
    pub async fn write_jump(&mut self, next_offset: i64) -> DeviceResult<()> {
        let mut buf = BytesMut::with_capacity(JUMP_RECORD_LEN as usize);
        buf.put_u8(MARKER_JUMP);
        buf.put_i64_le(next_offset);
        self.stream.write_all(&buf).await?;
        Ok(())
    }

    /// Writes an index record at the current (tail) position.
    ///
    /// # Errors
    ///
    /// Returns [`LimitError::KeyTooLong`] if `key` is empty or longer than
    /// 253 bytes, without writing anything.
    pub async fn write_index(&mut self, key: &[u8], data_position: i64) -> DeviceResult<()> {
        if key.is_empty() || key.len() > MAX_KEY_LEN {
            return Err(LimitError::KeyTooLong { len: key.len() }.into());
        }

        let mut buf = BytesMut::with_capacity(index_record_len(key.len()) as usize);
        buf.put_u8(key.len() as u8);
        buf.put_i64_le(data_position);
        buf.put_u8(TYPE_TAG);
        buf.put_slice(key);
        self.stream.write_all(&buf).await?;
        Ok(())
    }

    /// Writes a value record at the current (tail) position, picking the
    /// smallest length tag that fits.
    pub async fn write_value(&mut self, value: &[u8]) -> DeviceResult<()> {
        let tag = LengthTag::smallest_for(value.len() as u64)?;

        let mut header = BytesMut::with_capacity(2 + tag.field_len() as usize);
        header.put_u8(TYPE_TAG);
        header.put_u8(tag as u8);
        match tag {
            LengthTag::U8 => header.put_u8(value.len() as u8),
            LengthTag::U16 => header.put_u16_le(value.len() as u16),
            LengthTag::U32 => header.put_u32_le(value.len() as u32),
        }

        self.stream.write_all(&header).await?;
        self.stream.write_all(value).await?;
        Ok(())
    }

    /// Byte size an index record for `key` would occupy, without writing
    /// it.
    pub fn calc_index_offset(key: &[u8]) -> u64 {
        index_record_len(key.len())
    }

    /// Byte size a value record for `value` would occupy, without writing
    /// it.
    pub fn calc_value_offset(value: &[u8]) -> DeviceResult<u64> {
        Ok(super::value_record_len(value.len() as u64)?)
    }

    /// Byte size of a jump record. Always 9.
    pub const fn jump_offset_size() -> u64 {
        JUMP_RECORD_LEN
    }

    /// The offset of the currently open (still-zero) tail jump record, as
    /// currently known to this device. Zero until the first block has been
    /// written. [`crate::device::DatabaseDevice`] persists this on every
    /// insert so that reopening the file and inserting again patches the
    /// same slot instead of leaving it dangling.
    pub fn head_of_chain(&self) -> i64 {
        self.head_of_chain
    }

    /// Sets the head-of-chain offset. Called by
    /// [`crate::device::DatabaseDevice`] after every batch, once the new
    /// tail jump has been written.
    pub fn set_head_of_chain(&mut self, offset: i64) {
        self.head_of_chain = offset;
    }

    /// Flushes the underlying stream without touching the header.
    pub async fn flush(&mut self) -> DeviceResult<()> {
        self.stream.flush().await?;
        Ok(())
    }

    /// Writes the current head-of-chain offset back into the 8-byte
    /// header and flushes the stream. Consumes the device.
    #[instrument(skip_all, level = "debug")]
    pub async fn dispose(mut self) -> DeviceResult<()> {
        self.stream.seek(SeekFrom::Start(0)).await?;
        let mut buf = BytesMut::with_capacity(8);
        buf.put_i64_le(self.head_of_chain);
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_exact_or_truncated(
        &mut self,
        buf: &mut [u8],
        what: &'static str,
    ) -> DeviceResult<()> {
        match self.stream.read_exact(buf).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                Err(FormatError::Truncated { what }.into())
            }
            Err(e) => Err(e.into()),
        }
    }
}
