//! # Device Session
//!
//! One attached UAS device: quirks, the tag pool, every live command record
//! and the lifecycle flags, all behind a single [`spin::Mutex`].
//!
//! Transfer completions enter through [`Session::complete_transfer`]. Work
//! that must not run under the lock (cancelling transfers, retiring handles,
//! reporting finished commands) is collected in an [`Outbox`] and flushed
//! once the lock is dropped.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use helix_uas_quirks::{self as quirks, DeviceIdentity, Quirks, SenseFixup};

use crate::command::{CommandResult, CommandSink, Completion};
use crate::config::UasConfig;
use crate::iu::{self, MAX_CDB_LEN};
use crate::sense;
use crate::state::{CommandRecord, CommandState};
use crate::tag::{TagPool, MAX_TAGS};
use crate::transport::{
    Clock, Leg, TransferCompletion, TransferHandle, TransferStatus, Transport,
};
use crate::wait::WaitQueue;
use crate::{CommandId, UasError, UasResult};

bitflags! {
    /// Session lifecycle flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct LifecycleFlags: u32 {
        /// A transport fault was seen; new work is refused
        const QUIESCING = 1 << 0;
        /// The device is going away
        const DISCONNECTING = 1 << 1;
        /// A bus reset is cancelling transfers
        const RESETTING = 1 << 2;
        /// A device reset is pending; new commands are refused as busy
        const INTAKE_BLOCKED = 1 << 3;
    }
}

// =============================================================================
// Session State
// =============================================================================

/// Everything guarded by the session lock
#[derive(Debug)]
pub(crate) struct SessionState {
    pub(crate) quirks: Quirks,
    pub(crate) flags: LifecycleFlags,
    pub(crate) tags: TagPool,
    pub(crate) stream_capacity: u16,
    /// Every live command
    pub(crate) records: BTreeMap<CommandId, CommandRecord>,
    /// Commands still waiting for their status leg
    pub(crate) active: BTreeSet<CommandId>,
    /// Holder of the one-command-at-a-time reservation
    pub(crate) untagged: Option<CommandId>,
}

/// Deferred work, executed after the lock is released
#[derive(Debug, Default)]
pub(crate) struct Outbox {
    pub(crate) completions: Vec<Completion>,
    pub(crate) cancels: Vec<TransferHandle>,
    pub(crate) retired: Vec<TransferHandle>,
    pub(crate) drained: bool,
}

impl SessionState {
    fn new(quirks: Quirks) -> Self {
        Self {
            quirks,
            flags: LifecycleFlags::empty(),
            tags: TagPool::empty(),
            stream_capacity: 0,
            records: BTreeMap::new(),
            active: BTreeSet::new(),
            untagged: None,
        }
    }

    /// Remove from the active set, noting when it empties
    pub(crate) fn leave_active(&mut self, id: CommandId, outbox: &mut Outbox) {
        if self.active.remove(&id) && self.active.is_empty() {
            outbox.drained = true;
        }
    }

    /// Finish a command: retire handles, return the tag, queue the completion
    pub(crate) fn finalize(&mut self, id: CommandId, outbox: &mut Outbox) {
        let Some(mut record) = self.records.remove(&id) else {
            return;
        };
        debug_assert!(record.is_settled(), "finalize with legs in flight");

        if !record.state.contains(CommandState::ERROR) {
            outbox.retired.extend(record.take_leg_handles());
        }
        if record.pooled {
            self.tags.release(record.tag);
        }
        if self.untagged == Some(id) {
            self.untagged = None;
        }
        self.leave_active(id, outbox);

        if self.flags.contains(LifecycleFlags::DISCONNECTING) {
            record.result = CommandResult::NoConnect;
        }
        log::trace!("[uas] {} done: {}", id, record.result);
        outbox.completions.push(record.into_completion());
    }

    /// Finalize if no legs remain in flight
    pub(crate) fn try_finalize(&mut self, id: CommandId, outbox: &mut Outbox) {
        let settled = self
            .records
            .get(&id)
            .map(CommandRecord::is_settled)
            .unwrap_or(false);
        if settled {
            self.finalize(id, outbox);
        }
    }

    /// Enter quiescing and fail every live command exactly once
    pub(crate) fn broadcast_error(&mut self, outbox: &mut Outbox) -> bool {
        if self.flags.contains(LifecycleFlags::QUIESCING) {
            return false;
        }
        self.flags.insert(LifecycleFlags::QUIESCING);
        log::warn!(
            "[uas] transport fault, failing {} outstanding commands",
            self.records.len()
        );

        let ids: Vec<CommandId> = self.records.keys().copied().collect();
        for id in ids {
            if let Some(record) = self.records.get_mut(&id) {
                record.force_error();
            }
            self.finalize(id, outbox);
        }
        true
    }

    /// Route one transfer completion
    pub(crate) fn handle_completion(
        &mut self,
        done: TransferCompletion,
        fixup: Option<SenseFixup>,
        outbox: &mut Outbox,
    ) -> bool {
        let id = done.context.command;
        let leg = done.context.leg;
        if !self.records.contains_key(&id) {
            log::debug!("[uas] stale {} completion for {}", leg, id);
            return false;
        }

        match done.status {
            TransferStatus::Completed => match leg {
                Leg::Status => self.status_done(id, done, fixup, outbox),
                Leg::Data => {
                    if let Some(record) = self.records.get_mut(&id) {
                        record.data_done(done.actual_length);
                    }
                }
                Leg::Command => return true,
            },
            TransferStatus::Cancelled => {
                self.leg_cancelled(id, leg, outbox);
                if self.flags.contains(LifecycleFlags::RESETTING) {
                    if let Some(record) = self.records.get_mut(&id) {
                        match leg {
                            Leg::Data => record.data_handle = None,
                            Leg::Command => record.command_handle = None,
                            Leg::Status => record.status_handle = None,
                        }
                    }
                    return true;
                }
                if leg == Leg::Command {
                    return true;
                }
            }
            TransferStatus::Failed(err) => {
                log::warn!("[uas] {} {} leg failed: {}", id, leg, err);
                self.broadcast_error(outbox);
                return true;
            }
        }

        self.try_finalize(id, outbox);
        true
    }

    fn status_done(
        &mut self,
        id: CommandId,
        done: TransferCompletion,
        fixup: Option<SenseFixup>,
        outbox: &mut Outbox,
    ) {
        let Some(record) = self.records.get_mut(&id) else {
            return;
        };
        let buffer = done.buffer.unwrap_or_default();

        match iu::iu_id(&buffer) {
            Some(iu::IU_ID_STATUS) => {
                let decoded = sense::decode(&buffer, done.actual_length, &mut self.quirks);
                record.result = CommandResult::Device(decoded.status);
                record.sense = decoded.sense;
                if let Some(fixup) = fixup {
                    sense::apply_fixup(fixup, record.command.opcode(), &mut record.sense);
                }
            }
            other => {
                log::debug!("[uas] {} bogus IU {:02x?}", id, other);
                record.result = CommandResult::InitiatorError;
            }
        }

        if record.state.contains(CommandState::DATA_INFLIGHT) {
            if let Some(handle) = record.data_handle {
                log::debug!("[uas] {} status before data, cancelling data leg", id);
                outbox.cancels.push(handle);
            }
        }
        record.state.remove(CommandState::COMMAND_INFLIGHT);
        record.status_handle = None;

        if self.untagged == Some(id) {
            self.untagged = None;
        }
        self.leave_active(id, outbox);
    }

    fn leg_cancelled(&mut self, id: CommandId, leg: Leg, outbox: &mut Outbox) {
        let disconnecting = self.flags.contains(LifecycleFlags::DISCONNECTING);
        match leg {
            Leg::Data => {
                if let Some(record) = self.records.get_mut(&id) {
                    record.state.remove(CommandState::DATA_INFLIGHT);
                }
            }
            Leg::Status => {
                self.leave_active(id, outbox);
                if disconnecting {
                    if let Some(record) = self.records.get_mut(&id) {
                        record.state.remove(CommandState::COMMAND_INFLIGHT);
                        record.result = CommandResult::NoConnect;
                    }
                }
            }
            Leg::Command => {}
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

#[derive(Debug, Default)]
pub(crate) struct SessionStats {
    pub(crate) queued: AtomicU64,
    pub(crate) immediate: AtomicU64,
    pub(crate) busy: AtomicU64,
    pub(crate) completed: AtomicU64,
    pub(crate) quiesce_events: AtomicU64,
    pub(crate) bus_resets: AtomicU64,
    pub(crate) stale_completions: AtomicU64,
}

impl SessionStats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> UasStats {
        UasStats {
            queued: self.queued.load(Ordering::Relaxed),
            immediate: self.immediate.load(Ordering::Relaxed),
            busy: self.busy.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            quiesce_events: self.quiesce_events.load(Ordering::Relaxed),
            bus_resets: self.bus_resets.load(Ordering::Relaxed),
            stale_completions: self.stale_completions.load(Ordering::Relaxed),
        }
    }
}

/// Session statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UasStats {
    /// Commands handed to the transport
    pub queued: u64,
    /// Commands answered without touching the device
    pub immediate: u64,
    /// Submissions refused as busy
    pub busy: u64,
    /// Queued commands that finished
    pub completed: u64,
    /// Error broadcasts
    pub quiesce_events: u64,
    /// Bus resets attempted
    pub bus_resets: u64,
    /// Completions for commands no longer tracked
    pub stale_completions: u64,
}

// =============================================================================
// Device Settings
// =============================================================================

/// Limits and behaviour hints for the upper SCSI layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSettings {
    /// Commands the device may have queued
    pub queue_depth: u16,
    /// Longest CDB
    pub max_cdb_len: usize,
    /// Largest transfer in 512-byte sectors
    pub max_sectors: u32,
    /// Number of addressable LUNs
    pub max_lun: u32,
    /// Request timeout (ms)
    pub request_timeout_ms: u64,
    /// Buffer alignment mask
    pub dma_alignment: u32,
    /// Limit MODE SENSE page 0x3f to 192 bytes
    pub use_192_bytes_for_3f: bool,
    /// Never ask for MODE SENSE page 8
    pub skip_ms_page_8: bool,
    /// Never ask for VPD pages
    pub skip_vpd_pages: bool,
    /// Try READ CAPACITY(10) before (16)
    pub try_rc_10_first: bool,
    /// Never issue WRITE SAME
    pub no_write_same: bool,
    /// Never issue REPORT SUPPORTED OPERATION CODES
    pub no_report_opcodes: bool,
    /// FUA is not honoured
    pub broken_fua: bool,
    /// Never issue REPORT LUNS
    pub no_report_luns: bool,
}

impl DeviceSettings {
    /// 512-byte alignment
    pub const DMA_ALIGNMENT: u32 = 512 - 1;
    /// Addressable LUNs
    pub const MAX_LUN: u32 = 256;

    fn derive(quirks: Quirks, capacity: u16, config: &UasConfig) -> Self {
        let queue_depth = if quirks.is_one_command_only() { 1 } else { capacity };
        Self {
            queue_depth,
            max_cdb_len: MAX_CDB_LEN,
            max_sectors: config.max_sectors,
            max_lun: Self::MAX_LUN,
            request_timeout_ms: config.request_timeout_ms,
            dma_alignment: Self::DMA_ALIGNMENT,
            use_192_bytes_for_3f: true,
            skip_ms_page_8: true,
            skip_vpd_pages: true,
            try_rc_10_first: true,
            no_write_same: true,
            no_report_opcodes: quirks.contains(Quirks::NO_REPORT_OPCODES),
            broken_fua: quirks.contains(Quirks::BROKEN_FUA),
            no_report_luns: quirks.contains(Quirks::NO_REPORT_LUNS),
        }
    }
}

// =============================================================================
// Session
// =============================================================================

/// One attached UAS device
pub struct Session<T: Transport, C: Clock> {
    pub(crate) transport: T,
    pub(crate) clock: C,
    pub(crate) sink: Arc<dyn CommandSink>,
    pub(crate) identity: DeviceIdentity,
    pub(crate) fixup: Option<SenseFixup>,
    pub(crate) config: UasConfig,
    pub(crate) state: Mutex<SessionState>,
    pub(crate) drain: WaitQueue,
    pub(crate) stats: SessionStats,
}

impl<T: Transport, C: Clock> Session<T, C> {
    /// Bring up a session for a newly attached device
    ///
    /// Refuses devices listed as incompatible, applies table quirks and
    /// negotiates stream capacity.
    pub fn attach(
        transport: T,
        clock: C,
        identity: DeviceIdentity,
        config: UasConfig,
        sink: Arc<dyn CommandSink>,
    ) -> UasResult<Self> {
        if quirks::is_incompatible(&identity) {
            log::info!("[uas] {}: not driven over UAS", identity);
            return Err(UasError::Incompatible);
        }

        let session = Self {
            transport,
            clock,
            sink,
            identity,
            fixup: quirks::sense_fixup_for(&identity),
            config: config.validated(),
            state: Mutex::new(SessionState::new(quirks::quirks_for(&identity))),
            drain: WaitQueue::new(),
            stats: SessionStats::default(),
        };
        session.negotiate_streams()?;

        log::info!(
            "[uas] {}: attached, {} streams",
            identity,
            session.state.lock().stream_capacity
        );
        Ok(session)
    }

    /// Allocate streams and size the tag pool
    pub(crate) fn negotiate_streams(&self) -> UasResult<()> {
        let single = self.state.lock().quirks.is_single_stream();
        let request = if single {
            self.config.single_stream_max
        } else {
            self.config.max_streams
        };

        let granted = match self.transport.alloc_streams(request) {
            Ok(granted) => granted,
            Err(err) => {
                log::error!("[uas] {}: stream allocation failed: {}", self.identity, err);
                return Err(UasError::StreamNegotiation(err));
            }
        };
        if granted == 0 && !single {
            log::error!("[uas] {}: no streams granted", self.identity);
            return Err(UasError::NoStreams);
        }
        log::debug!("[uas] requested {} streams, granted {}", request, granted);

        let mut state = self.state.lock();
        state.stream_capacity = granted.min(MAX_TAGS);
        if single {
            state.tags = TagPool::empty();
        } else {
            state.tags.reset(granted);
        }
        Ok(())
    }

    /// Feed a transfer completion from the transport
    pub fn complete_transfer(&self, done: TransferCompletion) {
        let mut outbox = Outbox::default();
        let tracked = {
            let mut state = self.state.lock();
            let quiescing = state.flags.contains(LifecycleFlags::QUIESCING);
            let tracked = state.handle_completion(done, self.fixup, &mut outbox);
            if !quiescing && state.flags.contains(LifecycleFlags::QUIESCING) {
                SessionStats::bump(&self.stats.quiesce_events);
            }
            tracked
        };
        if !tracked {
            SessionStats::bump(&self.stats.stale_completions);
        }
        self.flush(outbox);
    }

    /// Run deferred work with the lock released
    pub(crate) fn flush(&self, outbox: Outbox) {
        for handle in outbox.retired {
            self.transport.retire(handle);
        }
        for handle in outbox.cancels {
            self.transport.cancel(handle);
        }
        for completion in outbox.completions {
            SessionStats::bump(&self.stats.completed);
            self.sink.complete(completion);
        }
        if outbox.drained {
            self.drain.wake();
        }
    }

    /// Settings for the upper SCSI layer
    pub fn device_settings(&self) -> DeviceSettings {
        let state = self.state.lock();
        DeviceSettings::derive(state.quirks, state.stream_capacity, &self.config)
    }

    /// Statistics snapshot
    pub fn stats(&self) -> UasStats {
        self.stats.snapshot()
    }

    /// Device identity
    pub fn identity(&self) -> DeviceIdentity {
        self.identity
    }

    /// Current quirks, including any learned sense format
    pub fn quirks(&self) -> Quirks {
        self.state.lock().quirks
    }

    /// Current lifecycle flags
    pub fn lifecycle(&self) -> LifecycleFlags {
        self.state.lock().flags
    }

    /// Live command records
    pub fn outstanding(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Commands still waiting for status
    pub fn active(&self) -> usize {
        self.state.lock().active.len()
    }

    /// Free tags in the pool
    pub fn available_tags(&self) -> u16 {
        self.state.lock().tags.available()
    }

    /// State flags of a live command
    pub fn command_state(&self, id: CommandId) -> Option<CommandState> {
        self.state.lock().records.get(&id).map(|r| r.state)
    }

    /// Whether intake is blocked by a pending reset
    pub fn intake_blocked(&self) -> bool {
        self.state.lock().flags.contains(LifecycleFlags::INTAKE_BLOCKED)
    }

    /// Configuration in effect
    pub fn config(&self) -> &UasConfig {
        &self.config
    }
}
