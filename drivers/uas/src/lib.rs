//! # Helix UAS Transport Core
//!
//! Protocol engine for USB Attached SCSI devices. Several independent SCSI
//! commands share four physical channels (command, status, data-in,
//! data-out); each in-flight command is identified by a stream tag.
//!
//! ## Components
//!
//! - [`tag`]: stream tag pool with round-robin allocation
//! - [`sense`]: status response decoding and sense data handling
//! - [`leg`]: building and submitting the command, data and status legs
//! - [`state`]: per-command flags and the completion decision
//! - [`dispatch`]: command intake
//! - [`recovery`]: abort, bus reset, pre/post reset, disconnect
//! - [`session`]: the per-device state everything above operates on
//!
//! ## Key Principle
//!
//! The core owns no hardware. The bus driver supplies a [`Transport`] and a
//! [`Clock`], feeds every transfer completion back through
//! [`Session::complete_transfer`], and receives finished commands through a
//! [`CommandSink`].

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod command;
pub mod config;
pub mod dispatch;
pub mod iu;
pub mod leg;
pub mod recovery;
pub mod sense;
pub mod session;
pub mod state;
pub mod tag;
pub mod transport;

mod wait;

#[cfg(test)]
mod testing;

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

pub use helix_uas_quirks::{DeviceIdentity, Quirks, SenseFixup, SenseFormat};

pub use command::{
    CommandResult, CommandSink, Completion, DataDirection, ScatterList, ScsiCommand,
    ScsiStatus, Segment,
};
pub use config::UasConfig;
pub use dispatch::SubmitOutcome;
pub use sense::SenseData;
pub use session::{DeviceSettings, LifecycleFlags, Session, UasStats};
pub use state::CommandState;
pub use tag::{Tag, TagPool};
pub use transport::{
    Channel, Clock, Leg, Transfer, TransferCompletion, TransferContext, TransferHandle,
    TransferPayload, TransferStatus, Transport, TransportError, Urgency,
};

/// Identifier of one accepted command
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CommandId(u64);

impl CommandId {
    /// Allocate a new command ID
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for CommandId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cmd#{}", self.0)
    }
}

/// UAS result type
pub type UasResult<T> = Result<T, UasError>;

/// UAS core errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UasError {
    /// Device is listed as unusable over UAS
    Incompatible,
    /// Stream capacity could not be negotiated
    StreamNegotiation(TransportError),
    /// The transport granted no usable streams
    NoStreams,
    /// The session is being torn down
    Disconnecting,
    /// Outstanding commands did not drain in time
    Timeout,
    /// The protocol has no in-band abort for a single command
    AbortUnsupported,
    /// The transport reported a failure
    Transport(TransportError),
}

impl fmt::Display for UasError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UasError::Incompatible => write!(f, "Device is not UAS compatible"),
            UasError::StreamNegotiation(e) => write!(f, "Stream negotiation failed: {}", e),
            UasError::NoStreams => write!(f, "No streams granted"),
            UasError::Disconnecting => write!(f, "Device is disconnecting"),
            UasError::Timeout => write!(f, "Timed out waiting for commands to drain"),
            UasError::AbortUnsupported => write!(f, "Single command abort not supported"),
            UasError::Transport(e) => write!(f, "Transport error: {}", e),
        }
    }
}

impl From<TransportError> for UasError {
    fn from(err: TransportError) -> Self {
        UasError::Transport(err)
    }
}
