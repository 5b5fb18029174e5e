//! # Recovery Controller
//!
//! Abort, bus reset, the pre/post reset pair and disconnect.
//!
//! The error broadcast triggered by a transport fault lives with the
//! completion path in [`session`](crate::session); everything here is
//! driven from outside.

use crate::session::{LifecycleFlags, Session, SessionStats};
use crate::transport::{Channel, Clock, Transport};
use crate::{CommandId, UasError, UasResult};

impl<T: Transport, C: Clock> Session<T, C> {
    /// Abort one command
    ///
    /// UAS has no per-command abort that bridges implement reliably, so this
    /// only logs the command and reports failure; the caller escalates to a
    /// bus reset.
    pub fn abort(&self, id: CommandId) -> UasResult<()> {
        let state = self.state.lock();
        match state.records.get(&id) {
            Some(record) => record.log_state("abort"),
            None => log::info!("[uas] abort: {} not outstanding", id),
        }
        Err(UasError::AbortUnsupported)
    }

    /// Cancel everything and reset the device
    pub fn reset_bus(&self) -> UasResult<()> {
        {
            let mut state = self.state.lock();
            if state.flags.contains(LifecycleFlags::DISCONNECTING) {
                log::info!("[uas] {}: no reset during disconnect", self.identity);
                return Err(UasError::Disconnecting);
            }
            state.flags.remove(LifecycleFlags::QUIESCING);
            state.flags.insert(LifecycleFlags::RESETTING);
        }
        SessionStats::bump(&self.stats.bus_resets);

        for channel in Channel::ALL {
            self.transport.cancel_channel(channel);
        }
        let result = self.transport.reset_device();

        self.state.lock().flags.remove(LifecycleFlags::RESETTING);

        match result {
            Ok(()) => {
                log::info!("[uas] {}: bus reset SUCCESS", self.identity);
                Ok(())
            }
            Err(err) => {
                log::info!("[uas] {}: bus reset FAILED: {}", self.identity, err);
                Err(UasError::Transport(err))
            }
        }
    }

    /// Stop intake and wait for outstanding commands before a device reset
    ///
    /// On timeout intake is re-enabled and the reset should be abandoned.
    pub fn pre_reset(&self) -> UasResult<()> {
        self.state.lock().flags.insert(LifecycleFlags::INTAKE_BLOCKED);

        let drained = self
            .drain
            .wait_timeout(&self.clock, self.config.drain_timeout_ms, || {
                self.state.lock().active.is_empty()
            });
        if !drained {
            let mut state = self.state.lock();
            log::error!(
                "[uas] {}: pre-reset timed out with {} commands active",
                self.identity,
                state.active.len()
            );
            state.flags.remove(LifecycleFlags::INTAKE_BLOCKED);
            return Err(UasError::Timeout);
        }

        self.transport.free_streams();
        Ok(())
    }

    /// Rebuild stream state after a device reset and resume intake
    ///
    /// If streams cannot be renegotiated intake stays blocked.
    pub fn post_reset(&self) -> UasResult<()> {
        {
            let mut state = self.state.lock();
            if !state.records.is_empty() {
                log::debug!("[uas] post-reset: dropping {} records", state.records.len());
            }
            state.untagged = None;
            state.active.clear();
            state.records.clear();
            let capacity = state.tags.capacity();
            state.tags.reset(capacity);
        }

        self.negotiate_streams()?;

        self.state.lock().flags.remove(LifecycleFlags::INTAKE_BLOCKED);
        log::info!("[uas] {}: reset complete", self.identity);
        Ok(())
    }

    /// The device is going away
    ///
    /// Every outstanding command finishes with no-connection, and so does
    /// every later submission.
    pub fn disconnect(&self) {
        self.state.lock().flags.insert(LifecycleFlags::DISCONNECTING);
        log::info!("[uas] {}: disconnecting", self.identity);

        for channel in Channel::ALL {
            self.transport.cancel_channel(channel);
        }
        self.transport.free_streams();
    }
}
