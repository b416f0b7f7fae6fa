//! The on-disk wire format: markers, length encoding, and the low-level
//! device that reads and writes it one record at a time.
//!
//! This module knows nothing about batching, jump-chain traversal, or
//! iteration -- that lives one layer up, in [`crate::device`]. Everything
//! here operates in terms of absolute stream offsets and single records.

mod device;
mod record;

pub use device::LowLevelDevice;
pub use record::{IndexRecord, Peek};

/// End-of-file / uninitialized-slot marker. Also the reserved deletion
/// marker `0xFE` decodes as this in the current format version (see the
/// crate's design notes on the unused deletion marker).
pub const MARKER_EOF: u8 = 0x00;

/// Reserved for a future deletion marker. Treated as EOF on read; never
/// written.
pub const MARKER_DELETED: u8 = 0xFE;

/// Marks the start of a jump record.
pub const MARKER_JUMP: u8 = 0xFF;

/// The fixed type tag written (and expected, but ignored) on index records
/// and value records.
pub const TYPE_TAG: u8 = 0x01;

/// The largest key length the format can represent: 253. Key lengths of
/// 0x00, 0xFE (254), and 0xFF are forbidden because their first byte would
/// collide with a marker -- a key of length `MARKER_DELETED` (254) would
/// make `peek` misclassify its own index record as end-of-file, silently
/// truncating iteration.
pub const MAX_KEY_LEN: usize = (MARKER_DELETED - 1) as usize;

/// Byte size of a jump record: 1-byte marker + 8-byte offset.
pub const JUMP_RECORD_LEN: u64 = 9;

/// Length-prefix tag selecting how many bytes follow to encode a length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthTag {
    /// 1-byte length, for payloads shorter than 255 bytes.
    U8 = 0x01,
    /// 2-byte length, for payloads shorter than 65535 bytes.
    U16 = 0x02,
    /// 4-byte length, for anything larger.
    U32 = 0x03,
}

impl LengthTag {
    /// Picks the smallest tag whose payload field can hold `len`.
    pub fn smallest_for(len: u64) -> Result<Self, crate::error::LimitError> {
        if len < 255 {
            Ok(LengthTag::U8)
        } else if len < 65535 {
            Ok(LengthTag::U16)
        } else if len <= u32::MAX as u64 {
            Ok(LengthTag::U32)
        } else {
            Err(crate::error::LimitError::ValueTooLarge { len })
        }
    }

    /// Number of bytes occupied by the length field that follows this tag.
    pub fn field_len(self) -> u64 {
        match self {
            LengthTag::U8 => 1,
            LengthTag::U16 => 2,
            LengthTag::U32 => 4,
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self, crate::error::FormatError> {
        match byte {
            0x01 => Ok(LengthTag::U8),
            0x02 => Ok(LengthTag::U16),
            0x03 => Ok(LengthTag::U32),
            tag => Err(crate::error::FormatError::InvalidLengthTag { tag }),
        }
    }
}

/// Total on-disk size, in bytes, of a value record (tag + length-tag +
/// length field + payload) for a payload of `len` bytes.
pub fn value_record_len(len: u64) -> Result<u64, crate::error::LimitError> {
    let tag = LengthTag::smallest_for(len)?;
    Ok(1 + 1 + tag.field_len() + len)
}

/// Total on-disk size, in bytes, of an index record for a key of `key_len`
/// bytes: 1-byte length + 8-byte data position + 1-byte type tag + key
/// bytes.
pub fn index_record_len(key_len: usize) -> u64 {
    (1 + 8 + 1 + key_len) as u64
}
