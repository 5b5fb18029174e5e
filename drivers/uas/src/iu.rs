//! # Information Units
//!
//! Wire layout of the information units exchanged on the command and status
//! channels.
//!
//! Command IU:
//!
//! ```text
//!  0      1      2..4    4          5      6            7      8..16  16..
//! +------+------+-------+----------+------+------------+------+------+-----+
//! | 0x01 | rsvd | tag   | prio/attr| rsvd | add cdb len| rsvd | LUN  | CDB |
//! +------+------+-------+----------+------+------------+------+------+-----+
//! ```

use alloc::vec;
use alloc::vec::Vec;
use static_assertions::{const_assert, const_assert_eq};

use crate::tag::Tag;

/// Command IU
pub const IU_ID_COMMAND: u8 = 0x01;
/// Sense IU, the normal status response
pub const IU_ID_STATUS: u8 = 0x03;
/// Response IU
pub const IU_ID_RESPONSE: u8 = 0x04;

/// SIMPLE task attribute
pub const TASK_ATTR_SIMPLE: u8 = 0x00;

/// Command IU header length
pub const COMMAND_IU_HEADER_LEN: usize = 16;
/// Base CDB field length
pub const CDB_FIELD_LEN: usize = 16;
/// Command IU length without additional CDB bytes
pub const COMMAND_IU_LEN: usize = 32;
/// Largest additional CDB length
pub const MAX_ADD_CDB_LEN: usize = 252;
/// Largest CDB accepted
pub const MAX_CDB_LEN: usize = CDB_FIELD_LEN + MAX_ADD_CDB_LEN;

/// Sense buffer size handed upward
pub const SENSE_BUFFER_SIZE: usize = 96;
/// Header of the legacy response envelopes
pub const LEGACY_HEADER_LEN: usize = 8;
/// Header of the extended response envelope
pub const EXTENDED_HEADER_LEN: usize = 16;
/// Status response buffer size
pub const STATUS_IU_LEN: usize = EXTENDED_HEADER_LEN + SENSE_BUFFER_SIZE;

const_assert_eq!(COMMAND_IU_LEN, COMMAND_IU_HEADER_LEN + CDB_FIELD_LEN);
const_assert_eq!(STATUS_IU_LEN, 112);
const_assert_eq!(MAX_ADD_CDB_LEN % 4, 0);
const_assert!(LEGACY_HEADER_LEN < EXTENDED_HEADER_LEN);

/// Byte offsets inside a status response
pub mod status_offset {
    /// IU id
    pub const IU_ID: usize = 0;
    /// Legacy length field (big endian, 2 bytes)
    pub const LEGACY_LENGTH: usize = 4;
    /// Legacy R01 marker byte
    pub const LEGACY_MARKER: usize = 5;
    /// SCSI status byte
    pub const STATUS: usize = 6;
    /// First sense byte in the legacy envelope
    pub const LEGACY_SENSE: usize = 8;
    /// Extended length field (big endian, 2 bytes)
    pub const EXTENDED_LENGTH: usize = 14;
}

/// Encode a LUN in the 8-byte SCSI addressing format
///
/// Each 16-bit level of the LUN is stored big endian, lowest level first.
pub fn scsi_lun(lun: u64) -> [u8; 8] {
    let mut bytes = [0u8; 8];
    let mut rest = lun;
    for level in 0..4 {
        bytes[level * 2] = (rest >> 8) as u8;
        bytes[level * 2 + 1] = rest as u8;
        rest >>= 16;
    }
    bytes
}

/// Additional CDB length, rounded up to a multiple of 4
pub fn additional_cdb_len(cdb_len: usize) -> usize {
    let extra = cdb_len.saturating_sub(CDB_FIELD_LEN);
    (extra + 3) & !3
}

/// Serialise a command IU
pub fn command_iu(tag: Tag, lun: u64, cdb: &[u8]) -> Vec<u8> {
    let add_len = additional_cdb_len(cdb.len());
    let mut iu = vec![0u8; COMMAND_IU_LEN + add_len];

    iu[0] = IU_ID_COMMAND;
    iu[2..4].copy_from_slice(&tag.get().to_be_bytes());
    iu[4] = TASK_ATTR_SIMPLE;
    iu[6] = add_len as u8;
    iu[8..16].copy_from_slice(&scsi_lun(lun));

    let end = COMMAND_IU_HEADER_LEN + cdb.len().min(CDB_FIELD_LEN + add_len);
    iu[COMMAND_IU_HEADER_LEN..end].copy_from_slice(&cdb[..end - COMMAND_IU_HEADER_LEN]);
    iu
}

/// Fresh, zeroed status response buffer
pub fn status_buffer() -> Vec<u8> {
    vec![0u8; STATUS_IU_LEN]
}

/// IU id of a received response
pub fn iu_id(buffer: &[u8]) -> Option<u8> {
    buffer.get(status_offset::IU_ID).copied()
}

/// Read a big-endian u16 field
pub(crate) fn be16(buffer: &[u8], offset: usize) -> u16 {
    match buffer.get(offset..offset + 2) {
        Some(b) => u16::from_be_bytes([b[0], b[1]]),
        None => 0,
    }
}
