//! # Command State Machine
//!
//! One record per accepted command. The record tracks which legs still need
//! submitting, which are in flight, and whether the command was swept up by
//! an error broadcast.
//!
//! A record is finished once it has no `NEED_*` and no `*_INFLIGHT` bits
//! left; see [`CommandRecord::is_settled`].

use alloc::vec::Vec;
use bitflags::bitflags;
use core::fmt;

use crate::command::{CommandResult, Completion, ScsiCommand};
use crate::leg;
use crate::sense::SenseData;
use crate::tag::Tag;
use crate::transport::{TransferHandle, Transport, TransportError, Urgency};
use crate::CommandId;

bitflags! {
    /// Per-command state flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CommandState: u32 {
        /// Status leg not yet submitted
        const NEED_STATUS = 1 << 0;
        /// Data leg not yet submitted
        const NEED_DATA = 1 << 1;
        /// Command leg not yet submitted
        const NEED_COMMAND = 1 << 2;
        /// Command/status exchange outstanding
        const COMMAND_INFLIGHT = 1 << 3;
        /// Data leg outstanding
        const DATA_INFLIGHT = 1 << 4;
        /// Forcibly retired by an error broadcast
        const ERROR = 1 << 5;

        /// Any leg still to submit
        const NEEDS = Self::NEED_STATUS.bits() | Self::NEED_DATA.bits() | Self::NEED_COMMAND.bits();
        /// Any leg outstanding
        const INFLIGHT = Self::COMMAND_INFLIGHT.bits() | Self::DATA_INFLIGHT.bits();
    }
}

impl fmt::Display for CommandState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(CommandState, &str); 6] = [
            (CommandState::NEED_STATUS, " S-SIU"),
            (CommandState::NEED_DATA, " S-DATA"),
            (CommandState::NEED_COMMAND, " S-CIU"),
            (CommandState::DATA_INFLIGHT, " DATA"),
            (CommandState::COMMAND_INFLIGHT, " CMD"),
            (CommandState::ERROR, " ERROR"),
        ];
        for (flag, name) in NAMES {
            if self.contains(flag) {
                f.write_str(name)?;
            }
        }
        Ok(())
    }
}

/// One outstanding command
#[derive(Debug)]
pub struct CommandRecord {
    /// Command ID
    pub id: CommandId,
    /// Stream tag on the wire
    pub tag: Tag,
    /// Tag came from the pool and must be returned
    pub pooled: bool,
    /// State flags
    pub state: CommandState,
    /// The command itself
    pub command: ScsiCommand,
    /// Result reported at finalize
    pub result: CommandResult,
    /// Sense reported at finalize
    pub sense: SenseData,
    /// Residual byte count
    pub residual: u32,
    /// Command leg handle
    pub command_handle: Option<TransferHandle>,
    /// Data leg handle
    pub data_handle: Option<TransferHandle>,
    /// Status leg handle, used only to unwind a failed submission
    pub status_handle: Option<TransferHandle>,
}

impl CommandRecord {
    /// New record with every needed leg pending
    pub fn new(id: CommandId, tag: Tag, pooled: bool, command: ScsiCommand) -> Self {
        let mut state = CommandState::NEED_STATUS | CommandState::NEED_COMMAND;
        if command.direction.has_data() {
            state |= CommandState::NEED_DATA;
        }
        Self {
            id,
            tag,
            pooled,
            state,
            command,
            result: CommandResult::Error,
            sense: SenseData::new(),
            residual: 0,
            command_handle: None,
            data_handle: None,
            status_handle: None,
        }
    }

    /// Submit every pending leg, status first and command last
    ///
    /// Stops at the first failure and leaves the remaining `NEED_*` bits
    /// set.
    pub fn submit_pending<T: Transport + ?Sized>(
        &mut self,
        transport: &T,
        urgency: Urgency,
    ) -> Result<(), TransportError> {
        if self.state.contains(CommandState::NEED_STATUS) {
            leg::submit_status(transport, self, urgency)?;
            self.state.remove(CommandState::NEED_STATUS);
        }
        if self.state.contains(CommandState::NEED_DATA) {
            leg::submit_data(transport, self, urgency)?;
            self.state.remove(CommandState::NEED_DATA);
        }
        if self.state.contains(CommandState::NEED_COMMAND) {
            leg::submit_command(transport, self, urgency)?;
            self.state.remove(CommandState::NEED_COMMAND);
        }
        Ok(())
    }

    /// No legs in flight; finalize is allowed
    pub fn is_settled(&self) -> bool {
        !self.state.intersects(CommandState::INFLIGHT)
    }

    /// Data leg finished normally
    pub fn data_done(&mut self, actual: usize) {
        let requested = self.command.transfer_len();
        self.residual = requested.saturating_sub(actual.min(u32::MAX as usize) as u32);
        self.state.remove(CommandState::DATA_INFLIGHT);
    }

    /// Sweep into the error state
    pub fn force_error(&mut self) {
        self.state.remove(CommandState::INFLIGHT);
        self.state.insert(CommandState::ERROR);
        self.result = CommandResult::InitiatorError;
    }

    /// Handles of every leg that was armed
    pub fn armed_handles(&self) -> Vec<TransferHandle> {
        [self.status_handle, self.data_handle, self.command_handle]
            .into_iter()
            .flatten()
            .collect()
    }

    /// Take the command and data leg handles for retirement
    pub fn take_leg_handles(&mut self) -> Vec<TransferHandle> {
        [self.command_handle.take(), self.data_handle.take()]
            .into_iter()
            .flatten()
            .collect()
    }

    /// Build the upward completion
    pub fn into_completion(self) -> Completion {
        Completion {
            id: self.id,
            result: self.result,
            sense: self.sense,
            residual: self.residual,
        }
    }

    /// Log the full command state
    pub fn log_state(&self, prefix: &str) {
        log::info!(
            "[uas] {}: {} tag {} opcode 0x{:02x} len {} state{}",
            prefix,
            self.id,
            self.tag,
            self.command.opcode(),
            self.command.transfer_len(),
            self.state
        );
    }
}
