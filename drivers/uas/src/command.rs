//! # SCSI Commands
//!
//! What the upper layer hands in, and what it gets back.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use crate::sense::SenseData;
use crate::CommandId;

/// Opcodes the core looks at
pub mod opcode {
    /// TEST UNIT READY
    pub const TEST_UNIT_READY: u8 = 0x00;
    /// ATA PASS-THROUGH (16)
    pub const ATA_16: u8 = 0x85;
    /// ATA PASS-THROUGH (12)
    pub const ATA_12: u8 = 0xa1;
}

/// Data phase direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataDirection {
    /// No data phase
    None,
    /// Host to device
    ToDevice,
    /// Device to host
    FromDevice,
    /// Both ways (not supported)
    Bidirectional,
}

impl DataDirection {
    /// Whether a data leg is needed
    pub fn has_data(self) -> bool {
        matches!(self, DataDirection::ToDevice | DataDirection::FromDevice)
    }
}

/// One DMA segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Bus address
    pub address: u64,
    /// Length in bytes
    pub length: u32,
}

impl Segment {
    /// Create a segment
    pub const fn new(address: u64, length: u32) -> Self {
        Self { address, length }
    }
}

/// Caller-owned scatter list
///
/// Shared with the data leg, never copied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScatterList {
    segments: Vec<Segment>,
}

impl ScatterList {
    /// Empty list
    pub fn new() -> Self {
        Self { segments: Vec::new() }
    }

    /// Build from segments
    pub fn from_segments(segments: Vec<Segment>) -> Self {
        Self { segments }
    }

    /// Segments in order
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Total byte count
    pub fn total_len(&self) -> u32 {
        self.segments
            .iter()
            .fold(0u32, |acc, seg| acc.saturating_add(seg.length))
    }
}

/// A SCSI command as handed to the core
#[derive(Debug, Clone)]
pub struct ScsiCommand {
    /// Logical unit
    pub lun: u64,
    /// Command descriptor block
    pub cdb: Vec<u8>,
    /// Data phase direction
    pub direction: DataDirection,
    /// Data buffer, present when there is a data phase
    pub data: Option<Arc<ScatterList>>,
}

impl ScsiCommand {
    /// Command with no data phase
    pub fn new(lun: u64, cdb: &[u8]) -> Self {
        Self {
            lun,
            cdb: cdb.to_vec(),
            direction: DataDirection::None,
            data: None,
        }
    }

    /// Attach a data phase
    pub fn with_data(mut self, direction: DataDirection, data: Arc<ScatterList>) -> Self {
        self.direction = direction;
        self.data = Some(data);
        self
    }

    /// First CDB byte
    pub fn opcode(&self) -> u8 {
        self.cdb.first().copied().unwrap_or(0)
    }

    /// Requested transfer length
    pub fn transfer_len(&self) -> u32 {
        self.data.as_ref().map(|d| d.total_len()).unwrap_or(0)
    }

    /// ATA PASS-THROUGH (12) or (16)
    pub fn is_ata_pass_through(&self) -> bool {
        matches!(self.opcode(), opcode::ATA_12 | opcode::ATA_16)
    }
}

/// SCSI status byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScsiStatus(pub u8);

impl ScsiStatus {
    /// GOOD
    pub const GOOD: Self = Self(0x00);
    /// CHECK CONDITION
    pub const CHECK_CONDITION: Self = Self(0x02);
    /// BUSY
    pub const BUSY: Self = Self(0x08);
    /// RESERVATION CONFLICT
    pub const RESERVATION_CONFLICT: Self = Self(0x18);
    /// TASK SET FULL
    pub const TASK_SET_FULL: Self = Self(0x28);
    /// ACA ACTIVE
    pub const ACA_ACTIVE: Self = Self(0x30);
    /// TASK ABORTED
    pub const TASK_ABORTED: Self = Self(0x40);
}

impl fmt::Display for ScsiStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ScsiStatus::GOOD => write!(f, "GOOD"),
            ScsiStatus::CHECK_CONDITION => write!(f, "CHECK CONDITION"),
            ScsiStatus::BUSY => write!(f, "BUSY"),
            ScsiStatus::TASK_SET_FULL => write!(f, "TASK SET FULL"),
            ScsiStatus(other) => write!(f, "0x{:02x}", other),
        }
    }
}

/// Host byte: command reached the device
pub const DID_OK: u8 = 0x00;
/// Host byte: device unreachable
pub const DID_NO_CONNECT: u8 = 0x01;
/// Host byte: internal error
pub const DID_ERROR: u8 = 0x07;
/// Message byte: initiator detected error
pub const INITIATOR_ERROR: u8 = 0x05;

/// Final result of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandResult {
    /// The device answered with a status byte
    Device(ScsiStatus),
    /// The exchange broke down on the initiator side
    InitiatorError,
    /// The device is gone
    NoConnect,
    /// Rejected before reaching the device
    Error,
}

impl CommandResult {
    /// Packed `host << 16 | message << 8 | status` word
    pub fn to_raw(self) -> u32 {
        match self {
            CommandResult::Device(status) => status.0 as u32,
            CommandResult::InitiatorError => (INITIATOR_ERROR as u32) << 8,
            CommandResult::NoConnect => (DID_NO_CONNECT as u32) << 16,
            CommandResult::Error => (DID_ERROR as u32) << 16,
        }
    }

    /// Device status GOOD
    pub fn is_good(self) -> bool {
        self == CommandResult::Device(ScsiStatus::GOOD)
    }
}

impl fmt::Display for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandResult::Device(status) => write!(f, "{}", status),
            CommandResult::InitiatorError => write!(f, "INITIATOR ERROR"),
            CommandResult::NoConnect => write!(f, "NO CONNECT"),
            CommandResult::Error => write!(f, "ERROR"),
        }
    }
}

/// A finished command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Which command
    pub id: CommandId,
    /// Final result
    pub result: CommandResult,
    /// Sense data, possibly empty
    pub sense: SenseData,
    /// Requested minus transferred bytes
    pub residual: u32,
}

impl Completion {
    /// Completion with no sense data and no residual
    pub fn new(id: CommandId, result: CommandResult) -> Self {
        Self {
            id,
            result,
            sense: SenseData::new(),
            residual: 0,
        }
    }

    /// Attach sense data
    pub fn with_sense(mut self, sense: SenseData) -> Self {
        self.sense = sense;
        self
    }
}

/// Receiver of finished commands
///
/// Called without the session lock held; may submit new commands.
pub trait CommandSink: Send + Sync {
    /// Deliver one finished command
    fn complete(&self, completion: Completion);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_result_encoding() {
        assert_eq!(CommandResult::Device(ScsiStatus::CHECK_CONDITION).to_raw(), 0x02);
        assert_eq!(CommandResult::InitiatorError.to_raw(), 0x0500);
        assert_eq!(CommandResult::NoConnect.to_raw(), 0x01_0000);
        assert_eq!(CommandResult::Error.to_raw(), 0x07_0000);
    }

    #[test]
    fn test_transfer_len() {
        let list = ScatterList::from_segments(vec![
            Segment::new(0x1000, 512),
            Segment::new(0x3000, 1024),
        ]);
        let cmd = ScsiCommand::new(0, &[0x28, 0, 0, 0, 0, 0, 0, 0, 3, 0])
            .with_data(DataDirection::FromDevice, Arc::new(list));
        assert_eq!(cmd.transfer_len(), 1536);
        assert!(cmd.direction.has_data());
    }

    #[test]
    fn test_ata_pass_through_detection() {
        assert!(ScsiCommand::new(0, &[opcode::ATA_12]).is_ata_pass_through());
        assert!(ScsiCommand::new(0, &[opcode::ATA_16]).is_ata_pass_through());
        assert!(!ScsiCommand::new(0, &[opcode::TEST_UNIT_READY]).is_ata_pass_through());
    }
}
