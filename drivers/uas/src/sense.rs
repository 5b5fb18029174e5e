//! # Sense/Status Decoder
//!
//! Turns a status-channel response into a SCSI status byte and a sense
//! payload.
//!
//! Bridges disagree on the envelope. Three shapes exist in the wild and the
//! shape a device uses is learned from the first response that carries
//! anything beyond GOOD, then remembered in the session quirks:
//!
//! | Shape        | Header | Length field             | Sense at |
//! |--------------|--------|--------------------------|----------|
//! | legacy R01   | 8      | bytes 4..6, minus 2      | 8        |
//! | legacy R02   | 8      | bytes 4..6               | 8        |
//! | extended R00 | 16     | bytes 14..16             | 16       |
//!
//! The status byte is always at offset 6.

use arrayvec::ArrayVec;
use core::fmt;
use helix_uas_quirks::{Quirks, SenseFixup, SenseFormat};

use crate::command::{opcode, ScsiStatus};
use crate::iu::{self, status_offset, EXTENDED_HEADER_LEN, LEGACY_HEADER_LEN, SENSE_BUFFER_SIZE};

/// Fixed-format response code, current errors
pub const RESPONSE_CODE_FIXED: u8 = 0x70;
/// Response code class mask
pub const RESPONSE_CODE_CLASS: u8 = 0x70;
/// Fixed-format sense length used when synthesising sense
pub const FIXED_SENSE_LEN: usize = 18;

/// ILLEGAL REQUEST sense key
pub const SENSE_KEY_ILLEGAL_REQUEST: u8 = 0x05;
/// INVALID FIELD IN CDB additional sense code
pub const ASC_INVALID_FIELD_IN_CDB: u8 = 0x24;

/// Sense bytes returned with a command
#[derive(Clone, PartialEq, Eq, Default)]
pub struct SenseData {
    bytes: ArrayVec<u8, SENSE_BUFFER_SIZE>,
}

impl SenseData {
    /// No sense data
    pub fn new() -> Self {
        Self { bytes: ArrayVec::new() }
    }

    /// Copy sense bytes, truncating at the buffer size
    pub fn from_slice(bytes: &[u8]) -> Self {
        let len = bytes.len().min(SENSE_BUFFER_SIZE);
        Self {
            bytes: bytes[..len].iter().copied().collect(),
        }
    }

    /// Fixed-format sense with the given key, ASC and ASCQ
    pub fn fixed(key: u8, asc: u8, ascq: u8) -> Self {
        let mut raw = [0u8; FIXED_SENSE_LEN];
        raw[0] = RESPONSE_CODE_FIXED;
        raw[2] = key & 0x0f;
        raw[7] = (FIXED_SENSE_LEN - 8) as u8;
        raw[12] = asc;
        raw[13] = ascq;
        Self::from_slice(&raw)
    }

    /// ILLEGAL REQUEST / INVALID FIELD IN CDB
    pub fn invalid_cdb() -> Self {
        Self::fixed(SENSE_KEY_ILLEGAL_REQUEST, ASC_INVALID_FIELD_IN_CDB, 0)
    }

    /// Raw sense bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Number of sense bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// No sense bytes present
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn byte(&self, index: usize) -> u8 {
        self.bytes.get(index).copied().unwrap_or(0)
    }

    /// Response code (byte 0, without the VALID bit)
    pub fn response_code(&self) -> u8 {
        self.byte(0) & 0x7f
    }

    /// Descriptor-format sense (response codes 0x72/0x73)
    pub fn is_descriptor(&self) -> bool {
        matches!(self.response_code(), 0x72 | 0x73)
    }

    /// Sense key
    pub fn key(&self) -> u8 {
        if self.is_descriptor() {
            self.byte(1) & 0x0f
        } else {
            self.byte(2) & 0x0f
        }
    }

    /// Additional sense code
    pub fn asc(&self) -> u8 {
        if self.is_descriptor() {
            self.byte(2)
        } else {
            self.byte(12)
        }
    }

    /// Additional sense code qualifier
    pub fn ascq(&self) -> u8 {
        if self.is_descriptor() {
            self.byte(3)
        } else {
            self.byte(13)
        }
    }
}

impl fmt::Debug for SenseData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "SenseData(none)");
        }
        write!(
            f,
            "SenseData(key=0x{:x} asc=0x{:02x} ascq=0x{:02x} len={})",
            self.key(),
            self.asc(),
            self.ascq(),
            self.len()
        )
    }
}

/// Decoded status response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedStatus {
    /// SCSI status byte
    pub status: ScsiStatus,
    /// Sense payload
    pub sense: SenseData,
}

/// Detect the envelope shape from a non-GOOD response
pub fn detect_format(data: &[u8]) -> SenseFormat {
    let first_sense = data.get(status_offset::LEGACY_SENSE).copied().unwrap_or(0);
    if first_sense & RESPONSE_CODE_CLASS == RESPONSE_CODE_CLASS {
        if data.get(status_offset::LEGACY_MARKER).copied().unwrap_or(0) != 0 {
            SenseFormat::LegacyR01
        } else {
            SenseFormat::LegacyR02
        }
    } else {
        SenseFormat::ExtendedR00
    }
}

/// Clamp a reported sense length to what actually arrived
///
/// When `reported + header` disagrees with `received`, the smaller of the
/// two wins; the result never goes below zero.
pub fn clamp_sense_len(reported: usize, header: usize, received: usize) -> usize {
    if reported + header == received {
        reported
    } else {
        (reported + header).min(received).saturating_sub(header)
    }
}

/// Decode a status response of `received` valid bytes
///
/// Learns the envelope shape into `quirks` the first time a non-GOOD
/// response is seen.
pub fn decode(data: &[u8], received: usize, quirks: &mut Quirks) -> DecodedStatus {
    let received = received.min(data.len());
    let data = &data[..received];

    let length_hi = data.get(status_offset::LEGACY_LENGTH).copied().unwrap_or(0);
    let status = data.get(status_offset::STATUS).copied().unwrap_or(0);
    if length_hi | status == 0 {
        return DecodedStatus { status: ScsiStatus::GOOD, sense: SenseData::new() };
    }

    let format = match quirks.sense_format() {
        Some(format) => format,
        None => {
            let format = detect_format(data);
            quirks.learn_sense_format(format);
            log::debug!("[uas] status format learned: {:?}", format);
            format
        }
    };

    let (header, reported) = match format {
        SenseFormat::LegacyR01 => (
            LEGACY_HEADER_LEN,
            (iu::be16(data, status_offset::LEGACY_LENGTH) as usize).saturating_sub(2),
        ),
        SenseFormat::LegacyR02 => (
            LEGACY_HEADER_LEN,
            iu::be16(data, status_offset::LEGACY_LENGTH) as usize,
        ),
        SenseFormat::ExtendedR00 => (
            EXTENDED_HEADER_LEN,
            iu::be16(data, status_offset::EXTENDED_LENGTH) as usize,
        ),
    };

    let len = clamp_sense_len(reported, header, received).min(SENSE_BUFFER_SIZE);
    let sense = match data.get(header..header + len) {
        Some(bytes) => SenseData::from_slice(bytes),
        None => SenseData::new(),
    };

    log::trace!("[uas] status 0x{:02x} {:?}", status, sense);
    DecodedStatus { status: ScsiStatus(status), sense }
}

/// Repair sense data for devices with a known framing bug
pub fn apply_fixup(fixup: SenseFixup, cdb_opcode: u8, sense: &mut SenseData) {
    match fixup {
        SenseFixup::BareTestUnitReadySense => {
            if cdb_opcode != opcode::TEST_UNIT_READY || sense.is_empty() {
                return;
            }
            let raw = sense.as_bytes();
            if raw[0] & RESPONSE_CODE_CLASS == RESPONSE_CODE_CLASS {
                return;
            }
            let key = raw[0];
            let asc = raw.get(1).copied().unwrap_or(0);
            let ascq = raw.get(2).copied().unwrap_or(0);
            log::debug!("[uas] remapping bare sense {:02x}/{:02x}/{:02x}", key, asc, ascq);
            *sense = SenseData::fixed(key, asc, ascq);
        }
    }
}
