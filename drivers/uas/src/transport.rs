//! # Transport Interface
//!
//! The capability set the bus driver provides. The core never touches
//! hardware; it asks the [`Transport`] to move buffers and is told about
//! the outcome through [`Session::complete_transfer`](crate::Session::complete_transfer).
//!
//! ## Locking contract
//!
//! - [`Transport::submit`] is called with the session lock held and must not
//!   deliver the completion synchronously.
//! - Every other method is called without the lock and may complete
//!   transfers from inside the call.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use crate::command::ScatterList;
use crate::CommandId;

/// The four physical channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Command IUs
    Command,
    /// Status responses
    Status,
    /// Device to host data
    DataIn,
    /// Host to device data
    DataOut,
}

impl Channel {
    /// Every channel, in teardown order
    pub const ALL: [Channel; 4] = [
        Channel::Command,
        Channel::DataIn,
        Channel::DataOut,
        Channel::Status,
    ];
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Command => write!(f, "cmd"),
            Channel::Status => write!(f, "status"),
            Channel::DataIn => write!(f, "data-in"),
            Channel::DataOut => write!(f, "data-out"),
        }
    }
}

/// Allocation urgency hint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Urgency {
    /// The transport may sleep for memory
    MayBlock,
    /// The transport must not sleep
    Atomic,
}

/// One of the three transfers making up a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Leg {
    /// Command IU
    Command,
    /// Data phase
    Data,
    /// Status response
    Status,
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Leg::Command => write!(f, "command"),
            Leg::Data => write!(f, "data"),
            Leg::Status => write!(f, "status"),
        }
    }
}

/// Handle issued by the transport for a submitted transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransferHandle(pub u64);

/// Routing information carried by every transfer and echoed back on
/// completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferContext {
    /// Owning command
    pub command: CommandId,
    /// Which leg
    pub leg: Leg,
}

/// Transfer payload
#[derive(Debug, Clone)]
pub enum TransferPayload {
    /// Bytes to send
    Out(Vec<u8>),
    /// Buffer to receive into
    In(Vec<u8>),
    /// Caller scatter list
    Scatter {
        /// Shared list
        list: Arc<ScatterList>,
        /// Bytes requested
        length: u32,
    },
}

impl TransferPayload {
    /// Requested length in bytes
    pub fn len(&self) -> usize {
        match self {
            TransferPayload::Out(buf) | TransferPayload::In(buf) => buf.len(),
            TransferPayload::Scatter { length, .. } => *length as usize,
        }
    }

    /// Zero-length payload
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A transfer request
#[derive(Debug, Clone)]
pub struct Transfer {
    /// Target channel
    pub channel: Channel,
    /// Stream tag, `None` on the command channel
    pub stream: Option<u16>,
    /// What to move
    pub payload: TransferPayload,
    /// Echoed back on completion
    pub context: TransferContext,
}

/// Transport failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// Out of memory or transfer slots
    NoMemory,
    /// Device gone
    NoDevice,
    /// Endpoint stalled
    Stalled,
    /// Protocol or framing error
    Protocol,
    /// Requested feature not available
    Unsupported,
    /// Other I/O failure
    Io,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::NoMemory => write!(f, "Out of memory"),
            TransportError::NoDevice => write!(f, "No device"),
            TransportError::Stalled => write!(f, "Endpoint stalled"),
            TransportError::Protocol => write!(f, "Protocol error"),
            TransportError::Unsupported => write!(f, "Not supported"),
            TransportError::Io => write!(f, "I/O error"),
        }
    }
}

/// How a transfer ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Completed normally
    Completed,
    /// Cancelled by the core or by a channel teardown
    Cancelled,
    /// Failed on the bus
    Failed(TransportError),
}

/// Completion report for one transfer
#[derive(Debug, Clone)]
pub struct TransferCompletion {
    /// Handle returned by [`Transport::submit`]
    pub handle: TransferHandle,
    /// Context from the submitted [`Transfer`]
    pub context: TransferContext,
    /// Outcome
    pub status: TransferStatus,
    /// Bytes actually moved
    pub actual_length: usize,
    /// Receive buffer for [`TransferPayload::In`] transfers
    pub buffer: Option<Vec<u8>>,
}

impl TransferCompletion {
    /// Completion without a returned buffer
    pub fn new(
        handle: TransferHandle,
        context: TransferContext,
        status: TransferStatus,
        actual_length: usize,
    ) -> Self {
        Self {
            handle,
            context,
            status,
            actual_length,
            buffer: None,
        }
    }

    /// Attach the receive buffer
    pub fn with_buffer(mut self, buffer: Vec<u8>) -> Self {
        self.buffer = Some(buffer);
        self
    }
}

/// Bus driver capabilities
pub trait Transport: Send + Sync {
    /// Queue a transfer
    ///
    /// On failure the transfer and its buffers are dropped.
    fn submit(
        &self,
        transfer: Transfer,
        urgency: Urgency,
    ) -> Result<TransferHandle, TransportError>;

    /// Cancel one transfer; completes it with [`TransferStatus::Cancelled`]
    fn cancel(&self, handle: TransferHandle);

    /// Cancel every outstanding transfer on a channel
    fn cancel_channel(&self, channel: Channel);

    /// Release bookkeeping for a transfer that finished normally
    fn retire(&self, _handle: TransferHandle) {}

    /// Negotiate stream capacity, returning the granted count
    fn alloc_streams(&self, max_streams: u16) -> Result<u16, TransportError>;

    /// Release stream resources
    fn free_streams(&self);

    /// Perform a physical device reset
    fn reset_device(&self) -> Result<(), TransportError>;
}

/// Millisecond time source for bounded waits
pub trait Clock: Send + Sync {
    /// Monotonic milliseconds
    fn now_ms(&self) -> u64;

    /// Called between polls of a wait loop
    fn relax(&self) {
        core::hint::spin_loop();
    }
}
