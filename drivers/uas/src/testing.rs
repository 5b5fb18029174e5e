//! Mock transport, fake clock and recording sink for session tests.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::command::{CommandSink, Completion};
use crate::iu;
use crate::transport::{
    Channel, Clock, Leg, Transfer, TransferCompletion, TransferHandle, TransferPayload,
    TransferStatus, Transport, TransportError, Urgency,
};

#[derive(Debug, Default)]
pub(crate) struct MockState {
    next_handle: u64,
    /// Submitted and not yet completed
    pub(crate) pending: Vec<(TransferHandle, Transfer)>,
    pub(crate) submitted: Vec<(Channel, Option<u16>)>,
    pub(crate) cancelled: Vec<TransferHandle>,
    pub(crate) cancelled_channels: Vec<Channel>,
    pub(crate) retired: Vec<TransferHandle>,
    pub(crate) fail_channel: Option<(Channel, TransportError)>,
    pub(crate) granted: u16,
    pub(crate) stream_error: Option<TransportError>,
    pub(crate) stream_requests: Vec<u16>,
    pub(crate) streams_freed: usize,
    pub(crate) resets: usize,
}

type CompletionHook = Box<dyn Fn(TransferCompletion) + Send + Sync>;

/// Transport that records everything
///
/// Nothing completes on its own. Once a completion hook is installed,
/// channel teardown completes the channel's pending transfers as cancelled.
#[derive(Clone)]
pub(crate) struct MockTransport {
    pub(crate) inner: Arc<Mutex<MockState>>,
    on_complete: Arc<Mutex<Option<CompletionHook>>>,
}

impl MockTransport {
    pub(crate) fn new(granted: u16) -> Self {
        let state = MockState {
            next_handle: 1,
            granted,
            ..MockState::default()
        };
        Self {
            inner: Arc::new(Mutex::new(state)),
            on_complete: Arc::new(Mutex::new(None)),
        }
    }

    /// Route completions produced by channel teardown to `hook`
    pub(crate) fn deliver_to(&self, hook: impl Fn(TransferCompletion) + Send + Sync + 'static) {
        *self.on_complete.lock() = Some(Box::new(hook));
    }

    pub(crate) fn fail_on(&self, channel: Channel, err: TransportError) {
        self.inner.lock().fail_channel = Some((channel, err));
    }

    pub(crate) fn clear_failure(&self) {
        self.inner.lock().fail_channel = None;
    }

    pub(crate) fn fail_streams(&self, err: Option<TransportError>) {
        self.inner.lock().stream_error = err;
    }

    /// Remove the pending transfer for a command leg
    pub(crate) fn take(
        &self,
        command: crate::CommandId,
        leg: Leg,
    ) -> Option<(TransferHandle, Transfer)> {
        let mut inner = self.inner.lock();
        let pos = inner
            .pending
            .iter()
            .position(|(_, t)| t.context.command == command && t.context.leg == leg)?;
        Some(inner.pending.remove(pos))
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }
}

impl Transport for MockTransport {
    fn submit(
        &self,
        transfer: Transfer,
        _urgency: Urgency,
    ) -> Result<TransferHandle, TransportError> {
        let mut inner = self.inner.lock();
        if let Some((channel, err)) = inner.fail_channel {
            if channel == transfer.channel {
                return Err(err);
            }
        }
        let handle = TransferHandle(inner.next_handle);
        inner.next_handle += 1;
        inner.submitted.push((transfer.channel, transfer.stream));
        inner.pending.push((handle, transfer));
        Ok(handle)
    }

    fn cancel(&self, handle: TransferHandle) {
        self.inner.lock().cancelled.push(handle);
    }

    fn cancel_channel(&self, channel: Channel) {
        let hook = self.on_complete.lock();
        let Some(hook) = hook.as_ref() else {
            self.inner.lock().cancelled_channels.push(channel);
            return;
        };

        let torn_down: Vec<(TransferHandle, Transfer)> = {
            let mut inner = self.inner.lock();
            inner.cancelled_channels.push(channel);
            let (torn_down, kept) = core::mem::take(&mut inner.pending)
                .into_iter()
                .partition(|(_, t)| t.channel == channel);
            inner.pending = kept;
            torn_down
        };
        for (handle, transfer) in torn_down {
            hook(finished(handle, &transfer, TransferStatus::Cancelled, 0));
        }
    }

    fn retire(&self, handle: TransferHandle) {
        self.inner.lock().retired.push(handle);
    }

    fn alloc_streams(&self, max_streams: u16) -> Result<u16, TransportError> {
        let mut inner = self.inner.lock();
        inner.stream_requests.push(max_streams);
        match inner.stream_error {
            Some(err) => Err(err),
            None => Ok(inner.granted.min(max_streams)),
        }
    }

    fn free_streams(&self) {
        self.inner.lock().streams_freed += 1;
    }

    fn reset_device(&self) -> Result<(), TransportError> {
        self.inner.lock().resets += 1;
        Ok(())
    }
}

type RelaxHook = Box<dyn FnMut() + Send>;

#[derive(Default)]
struct ClockState {
    now: AtomicU64,
    step: AtomicU64,
    hook: Mutex<Option<RelaxHook>>,
}

/// Clock that advances only when relaxed
#[derive(Clone, Default)]
pub(crate) struct FakeClock {
    inner: Arc<ClockState>,
}

impl FakeClock {
    pub(crate) fn new(step_ms: u64) -> Self {
        let clock = Self::default();
        clock.inner.step.store(step_ms, Ordering::Relaxed);
        clock
    }

    /// Run `hook` once, on the next relax
    pub(crate) fn on_next_relax(&self, hook: impl FnMut() + Send + 'static) {
        *self.inner.hook.lock() = Some(Box::new(hook));
    }
}

impl Clock for FakeClock {
    fn now_ms(&self) -> u64 {
        self.inner.now.load(Ordering::Relaxed)
    }

    fn relax(&self) {
        let hook = self.inner.hook.lock().take();
        if let Some(mut hook) = hook {
            hook();
        }
        let step = self.inner.step.load(Ordering::Relaxed);
        self.inner.now.fetch_add(step, Ordering::Relaxed);
    }
}

/// Sink collecting every completion
#[derive(Debug, Default)]
pub(crate) struct RecordingSink {
    pub(crate) completions: Mutex<Vec<Completion>>,
}

impl RecordingSink {
    pub(crate) fn taken(&self) -> Vec<Completion> {
        core::mem::take(&mut *self.completions.lock())
    }
}

impl CommandSink for RecordingSink {
    fn complete(&self, completion: Completion) {
        self.completions.lock().push(completion);
    }
}

/// Completion for a pending transfer
pub(crate) fn finished(
    handle: TransferHandle,
    transfer: &Transfer,
    status: TransferStatus,
    actual: usize,
) -> TransferCompletion {
    let done = TransferCompletion::new(handle, transfer.context, status, actual);
    match &transfer.payload {
        TransferPayload::In(buf) => done.with_buffer(buf.clone()),
        _ => done,
    }
}

/// Status response with a GOOD status
pub(crate) fn good_status(handle: TransferHandle, transfer: &Transfer) -> TransferCompletion {
    let mut buffer = iu::status_buffer();
    buffer[0] = iu::IU_ID_STATUS;
    buffer[2..4].copy_from_slice(&transfer.stream.unwrap_or(0).to_be_bytes());
    TransferCompletion::new(handle, transfer.context, TransferStatus::Completed, 16)
        .with_buffer(buffer)
}

/// Status response carrying raw bytes
pub(crate) fn raw_status(
    handle: TransferHandle,
    transfer: &Transfer,
    bytes: &[u8],
) -> TransferCompletion {
    let mut buffer = iu::status_buffer();
    buffer[..bytes.len()].copy_from_slice(bytes);
    TransferCompletion::new(handle, transfer.context, TransferStatus::Completed, bytes.len())
        .with_buffer(buffer)
}
