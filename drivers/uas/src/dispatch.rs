//! # Command Dispatcher
//!
//! Public intake. A command is either answered on the spot, refused as busy,
//! or gets a tag and a record and has its legs submitted.
//!
//! Checks run in this order:
//!
//! 1. disconnecting: no connection
//! 2. intake blocked by a pending reset: busy
//! 3. quiescing, bidirectional data or a malformed CDB: error
//! 4. quirk legality (ATA pass-through, TEST UNIT READY)
//! 5. untagged reservation held, or no free tag: busy
//!
//! All of them are made under the session lock, so a pre-reset that has
//! blocked intake never races a command into the active set.

use crate::command::{CommandResult, Completion, DataDirection, ScsiCommand, ScsiStatus};
use crate::iu::MAX_CDB_LEN;
use crate::sense::SenseData;
use crate::session::{LifecycleFlags, Session, SessionState, SessionStats};
use crate::state::CommandRecord;
use crate::tag::Tag;
use crate::transport::{Clock, Transport, TransportError, Urgency};
use crate::CommandId;
use helix_uas_quirks::Quirks;

/// What happened to a submitted command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Answered without reaching the device
    Completed(Completion),
    /// Handed to the transport; the completion arrives through the sink
    Queued(CommandId),
    /// Retry later
    Busy,
}

impl SessionState {
    /// Answer a command locally if lifecycle or quirks require it
    fn screen(&self, id: CommandId, command: &ScsiCommand) -> Option<Completion> {
        if self.flags.contains(LifecycleFlags::QUIESCING)
            || command.direction == DataDirection::Bidirectional
        {
            return Some(Completion::new(id, CommandResult::Error));
        }
        if command.cdb.is_empty() || command.cdb.len() > MAX_CDB_LEN {
            log::debug!("[uas] {} rejected, CDB length {}", id, command.cdb.len());
            return Some(Completion::new(id, CommandResult::Error));
        }

        if command.is_ata_pass_through() && self.quirks.contains(Quirks::NO_ATA_PASS_THROUGH) {
            return Some(
                Completion::new(id, CommandResult::Device(ScsiStatus::CHECK_CONDITION))
                    .with_sense(SenseData::invalid_cdb()),
            );
        }
        if command.opcode() == crate::command::opcode::TEST_UNIT_READY
            && self.quirks.contains(Quirks::NO_TEST_UNIT_READY)
        {
            return Some(Completion::new(id, CommandResult::Device(ScsiStatus::GOOD)));
        }
        None
    }

    /// Pick a stream for a new command
    ///
    /// Returns the tag and whether it came from the pool. The serial
    /// reservation is only taken once a tag is actually held.
    fn assign_tag(&mut self, id: CommandId) -> Option<(Tag, bool)> {
        if self.quirks.is_single_stream() {
            self.untagged = Some(id);
            return Some((Tag::UNTAGGED, false));
        }
        let tag = self.tags.acquire()?;
        if self.quirks.contains(Quirks::SERIAL_STREAM_ID) {
            self.untagged = Some(id);
        }
        Some((tag, true))
    }

    /// Undo [`assign_tag`](Self::assign_tag)
    fn release_assignment(&mut self, id: CommandId, tag: Tag, pooled: bool) {
        if pooled {
            self.tags.release(tag);
        }
        if self.untagged == Some(id) {
            self.untagged = None;
        }
    }
}

impl<T: Transport, C: Clock> Session<T, C> {
    /// Accept a command from the upper layer
    pub fn submit(&self, command: ScsiCommand) -> SubmitOutcome {
        let id = CommandId::new();
        let mut state = self.state.lock();

        if state.flags.contains(LifecycleFlags::DISCONNECTING) {
            drop(state);
            log::debug!("[uas] {} refused, device disconnecting", id);
            SessionStats::bump(&self.stats.immediate);
            return SubmitOutcome::Completed(Completion::new(id, CommandResult::NoConnect));
        }
        if state.flags.contains(LifecycleFlags::INTAKE_BLOCKED) {
            SessionStats::bump(&self.stats.busy);
            return SubmitOutcome::Busy;
        }

        if let Some(completion) = state.screen(id, &command) {
            drop(state);
            log::debug!("[uas] {} answered locally: {}", id, completion.result);
            SessionStats::bump(&self.stats.immediate);
            return SubmitOutcome::Completed(completion);
        }

        if state.untagged.is_some() {
            SessionStats::bump(&self.stats.busy);
            return SubmitOutcome::Busy;
        }
        let Some((tag, pooled)) = state.assign_tag(id) else {
            SessionStats::bump(&self.stats.busy);
            return SubmitOutcome::Busy;
        };

        let mut record = CommandRecord::new(id, tag, pooled, command);
        match record.submit_pending(&self.transport, Urgency::Atomic) {
            Ok(()) => {
                log::trace!("[uas] {} queued on stream {}", id, tag);
                state.records.insert(id, record);
                state.active.insert(id);
                SessionStats::bump(&self.stats.queued);
                SubmitOutcome::Queued(id)
            }
            Err(err) => {
                state.release_assignment(id, tag, pooled);
                drop(state);

                log::debug!("[uas] {} submission failed: {}", id, err);
                for handle in record.armed_handles() {
                    self.transport.cancel(handle);
                }

                if err == TransportError::NoMemory {
                    SessionStats::bump(&self.stats.busy);
                    SubmitOutcome::Busy
                } else {
                    SessionStats::bump(&self.stats.immediate);
                    SubmitOutcome::Completed(Completion::new(id, CommandResult::Error))
                }
            }
        }
    }
}
