//! # Quirk Table
//!
//! Static device table. Revision ranges are inclusive bcdDevice bounds.

use crate::{DeviceIdentity, Quirks};

/// One quirk table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuirkEntry {
    /// idVendor
    pub vendor: u16,
    /// idProduct
    pub product: u16,
    /// Lowest matching bcdDevice
    pub revision_lo: u16,
    /// Highest matching bcdDevice
    pub revision_hi: u16,
    /// Quirks applied on match
    pub quirks: Quirks,
}

impl QuirkEntry {
    /// Entry matching a vendor/product over a revision range
    pub const fn new(
        vendor: u16,
        product: u16,
        revision_lo: u16,
        revision_hi: u16,
        quirks: Quirks,
    ) -> Self {
        Self { vendor, product, revision_lo, revision_hi, quirks }
    }

    /// Check whether this entry applies to a device
    pub fn matches(&self, identity: &DeviceIdentity) -> bool {
        self.vendor == identity.vendor
            && self.product == identity.product
            && (self.revision_lo..=self.revision_hi).contains(&identity.revision)
    }
}

const ANY_REV: (u16, u16) = (0x0000, 0x9999);

const fn any_rev(vendor: u16, product: u16, quirks: Quirks) -> QuirkEntry {
    QuirkEntry::new(vendor, product, ANY_REV.0, ANY_REV.1, quirks)
}

const fn exact_rev(vendor: u16, product: u16, revision: u16, quirks: Quirks) -> QuirkEntry {
    QuirkEntry::new(vendor, product, revision, revision, quirks)
}

/// Known devices
pub static QUIRK_TABLE: &[QuirkEntry] = &[
    // Bridges that only work reliably with the bulk-only driver
    exact_rev(0x0984, 0x0301, 0x0128, Quirks::INCOMPATIBLE_DEVICE),
    exact_rev(0x4971, 0x1013, 0x4896, Quirks::INCOMPATIBLE_DEVICE),
    exact_rev(0x4971, 0x1012, 0x4798, Quirks::INCOMPATIBLE_DEVICE),
    exact_rev(0x059b, 0x0070, 0x0006, Quirks::INCOMPATIBLE_DEVICE),

    exact_rev(0x1759, 0x5002, 0x2270, Quirks::NO_TEST_UNIT_READY),

    // Seagate
    any_rev(0x0bc2, 0x2312, Quirks::NO_ATA_PASS_THROUGH),
    any_rev(0x0bc2, 0x3312, Quirks::NO_ATA_PASS_THROUGH),
    any_rev(0x0bc2, 0x3320, Quirks::NO_ATA_PASS_THROUGH),
    any_rev(0x0bc2, 0xa003, Quirks::NO_ATA_PASS_THROUGH),
    any_rev(0x0bc2, 0xa013, Quirks::NO_ATA_PASS_THROUGH),
    any_rev(
        0x0bc2,
        0xa0a4,
        Quirks::NO_ATA_PASS_THROUGH.union(Quirks::SERIAL_STREAM_ID),
    ),
    any_rev(0x0bc2, 0xab20, Quirks::NO_ATA_PASS_THROUGH),
    any_rev(0x0bc2, 0xab21, Quirks::NO_ATA_PASS_THROUGH),
    any_rev(0x0bc2, 0xab2a, Quirks::NO_ATA_PASS_THROUGH),
    any_rev(0x13fd, 0x3940, Quirks::NO_ATA_PASS_THROUGH),
    any_rev(0x2109, 0x0711, Quirks::NO_ATA_PASS_THROUGH),

    // JMicron and friends
    any_rev(0x152d, 0x0539, Quirks::NO_REPORT_OPCODES),
    any_rev(
        0x152d,
        0x0567,
        Quirks::NO_REPORT_OPCODES.union(Quirks::BROKEN_FUA),
    ),
    any_rev(0x357d, 0x7788, Quirks::NO_REPORT_OPCODES),
    any_rev(0x4971, 0x8017, Quirks::NO_REPORT_OPCODES),
    any_rev(0x0bc2, 0x331a, Quirks::NO_REPORT_LUNS),

    exact_rev(0x05e3, 0x0733, 0x5405, Quirks::ONE_STREAM_ID),
    exact_rev(0x174c, 0x5106, 0x0100, Quirks::SERIAL_STREAM_ID),
];

/// Find the first entry matching a device
pub fn lookup(identity: &DeviceIdentity) -> Option<&'static QuirkEntry> {
    QUIRK_TABLE.iter().find(|entry| entry.matches(identity))
}
