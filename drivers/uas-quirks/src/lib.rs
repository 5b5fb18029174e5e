//! # Helix UAS Quirks
//!
//! Per-device behavioural flags for the USB Attached SCSI driver.
//!
//! Quirks come from two places:
//! - the static [`table`], keyed by vendor/product/revision and applied once
//!   at attach
//! - the status-response format, learned from the first non-trivial response
//!   a device sends and never re-evaluated afterwards
//!
//! The flag set is a plain `u32` underneath so it can be logged, stored or
//! passed across an ABI boundary with [`Quirks::bits`] and
//! [`Quirks::from_bits_truncate`].

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

pub mod table;

use bitflags::bitflags;
use core::fmt;

pub use table::{QuirkEntry, QUIRK_TABLE};

bitflags! {
    /// Device quirk flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Quirks: u32 {
        /// Status responses use the legacy R01 envelope (length field biased by 2)
        const SENSE_IU_R01 = 1 << 0;
        /// Status responses use the legacy R02 envelope
        const SENSE_IU_R02 = 1 << 1;
        /// Status responses use the extended R00 envelope
        const SENSE_IU_2R00 = 1 << 2;
        /// ATA PASS-THROUGH commands must be rejected locally
        const NO_ATA_PASS_THROUGH = 1 << 3;
        /// TEST UNIT READY is answered locally with GOOD
        const NO_TEST_UNIT_READY = 1 << 4;
        /// Only one stream exists; every command uses the untagged stream
        const ONE_STREAM_ID = 1 << 5;
        /// Streams exist but commands must be issued one at a time
        const SERIAL_STREAM_ID = 1 << 6;
        /// Do not issue REPORT SUPPORTED OPERATION CODES
        const NO_REPORT_OPCODES = 1 << 7;
        /// The bridge mishandles the FUA bit
        const BROKEN_FUA = 1 << 8;
        /// Do not issue REPORT LUNS
        const NO_REPORT_LUNS = 1 << 9;
        /// The device must not be driven over UAS at all
        const INCOMPATIBLE_DEVICE = 1 << 31;
    }
}

impl Quirks {
    /// All sense-format quirks
    pub const SENSE_FORMAT_MASK: Self = Self::SENSE_IU_R01
        .union(Self::SENSE_IU_R02)
        .union(Self::SENSE_IU_2R00);

    /// Quirks that may be carried over from a table entry onto a session
    pub const SESSION_MASK: Self = Self::SENSE_FORMAT_MASK
        .union(Self::NO_ATA_PASS_THROUGH)
        .union(Self::NO_TEST_UNIT_READY)
        .union(Self::ONE_STREAM_ID)
        .union(Self::SERIAL_STREAM_ID)
        .union(Self::NO_REPORT_OPCODES)
        .union(Self::BROKEN_FUA)
        .union(Self::NO_REPORT_LUNS);

    /// The response envelope shape, if already known
    pub fn sense_format(self) -> Option<SenseFormat> {
        if self.contains(Self::SENSE_IU_R01) {
            Some(SenseFormat::LegacyR01)
        } else if self.contains(Self::SENSE_IU_R02) {
            Some(SenseFormat::LegacyR02)
        } else if self.contains(Self::SENSE_IU_2R00) {
            Some(SenseFormat::ExtendedR00)
        } else {
            None
        }
    }

    /// Record a learned response format
    ///
    /// Returns `false` and leaves the set untouched if a format is already
    /// known.
    pub fn learn_sense_format(&mut self, format: SenseFormat) -> bool {
        if self.intersects(Self::SENSE_FORMAT_MASK) {
            return false;
        }
        self.insert(format.quirk());
        true
    }

    /// Device only ever has one stream
    pub fn is_single_stream(self) -> bool {
        self.contains(Self::ONE_STREAM_ID)
    }

    /// Device may only have one command in flight
    pub fn is_one_command_only(self) -> bool {
        self.intersects(Self::ONE_STREAM_ID | Self::SERIAL_STREAM_ID)
    }
}

impl fmt::Display for Quirks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.bits())
    }
}

/// Status-channel response envelope shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SenseFormat {
    /// Legacy envelope, 8-byte header, length field reports sense length + 2
    LegacyR01,
    /// Legacy envelope, 8-byte header
    LegacyR02,
    /// Extended envelope, 16-byte header
    ExtendedR00,
}

impl SenseFormat {
    /// The quirk bit recording this format
    pub const fn quirk(self) -> Quirks {
        match self {
            SenseFormat::LegacyR01 => Quirks::SENSE_IU_R01,
            SenseFormat::LegacyR02 => Quirks::SENSE_IU_R02,
            SenseFormat::ExtendedR00 => Quirks::SENSE_IU_2R00,
        }
    }
}

/// Identity reported by the attached device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    /// idVendor
    pub vendor: u16,
    /// idProduct
    pub product: u16,
    /// bcdDevice
    pub revision: u16,
}

impl DeviceIdentity {
    /// Create a new identity
    pub const fn new(vendor: u16, product: u16, revision: u16) -> Self {
        Self { vendor, product, revision }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x} rev {:04x}", self.vendor, self.product, self.revision)
    }
}

/// Post-decode repairs for devices that frame sense data incorrectly
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenseFixup {
    /// TEST UNIT READY answers carry bare `key, asc, ascq` bytes instead of
    /// fixed-format sense data
    BareTestUnitReadySense,
}

/// Quirks to apply to a newly attached device
///
/// First matching table entry wins; only [`Quirks::SESSION_MASK`] bits are
/// returned.
pub fn quirks_for(identity: &DeviceIdentity) -> Quirks {
    let quirks = table::lookup(identity)
        .map(|entry| entry.quirks & Quirks::SESSION_MASK)
        .unwrap_or_else(Quirks::empty);

    if !quirks.is_empty() {
        log::info!("[uas] {}: device quirks = {}", identity, quirks);
    }
    quirks
}

/// Whether the device must be refused and left to the bulk-only driver
pub fn is_incompatible(identity: &DeviceIdentity) -> bool {
    table::lookup(identity)
        .map(|entry| entry.quirks.contains(Quirks::INCOMPATIBLE_DEVICE))
        .unwrap_or(false)
}

/// Sense repair required for this device, if any
pub fn sense_fixup_for(identity: &DeviceIdentity) -> Option<SenseFixup> {
    match (identity.vendor, identity.product) {
        (0x05e3, 0x0733) => Some(SenseFixup::BareTestUnitReadySense),
        _ => None,
    }
}
