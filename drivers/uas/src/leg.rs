//! # Transfer Leg Manager
//!
//! Builds and submits the three transfers of a command. Each function
//! stores the returned handle on the record and sets the matching in-flight
//! bit; on failure the transfer is dropped along with its buffers and the
//! record is left as it was.

use alloc::sync::Arc;

use crate::command::{DataDirection, ScatterList};
use crate::iu;
use crate::state::{CommandRecord, CommandState};
use crate::transport::{
    Channel, Leg, Transfer, TransferContext, TransferPayload, Transport, TransportError, Urgency,
};

fn context(record: &CommandRecord, leg: Leg) -> TransferContext {
    TransferContext { command: record.id, leg }
}

/// Arm the status leg
///
/// The handle is kept only so a half-submitted command can be unwound.
pub fn submit_status<T: Transport + ?Sized>(
    transport: &T,
    record: &mut CommandRecord,
    urgency: Urgency,
) -> Result<(), TransportError> {
    let transfer = Transfer {
        channel: Channel::Status,
        stream: Some(record.tag.get()),
        payload: TransferPayload::In(iu::status_buffer()),
        context: context(record, Leg::Status),
    };
    let handle = transport.submit(transfer, urgency)?;
    record.status_handle = Some(handle);
    Ok(())
}

/// Arm the data leg on the channel matching the command direction
pub fn submit_data<T: Transport + ?Sized>(
    transport: &T,
    record: &mut CommandRecord,
    urgency: Urgency,
) -> Result<(), TransportError> {
    let channel = match record.command.direction {
        DataDirection::FromDevice => Channel::DataIn,
        DataDirection::ToDevice => Channel::DataOut,
        DataDirection::None | DataDirection::Bidirectional => {
            return Err(TransportError::Unsupported)
        }
    };
    let list = record
        .command
        .data
        .clone()
        .unwrap_or_else(|| Arc::new(ScatterList::new()));
    let length = list.total_len();

    let transfer = Transfer {
        channel,
        stream: Some(record.tag.get()),
        payload: TransferPayload::Scatter { list, length },
        context: context(record, Leg::Data),
    };
    let handle = transport.submit(transfer, urgency)?;
    record.data_handle = Some(handle);
    record.state.insert(CommandState::DATA_INFLIGHT);
    Ok(())
}

/// Arm the command leg
pub fn submit_command<T: Transport + ?Sized>(
    transport: &T,
    record: &mut CommandRecord,
    urgency: Urgency,
) -> Result<(), TransportError> {
    let buffer = iu::command_iu(record.tag, record.command.lun, &record.command.cdb);
    log::trace!("[uas] {} command IU {:02x?}", record.id, &buffer[..]);

    let transfer = Transfer {
        channel: Channel::Command,
        stream: None,
        payload: TransferPayload::Out(buffer),
        context: context(record, Leg::Command),
    };
    let handle = transport.submit(transfer, urgency)?;
    record.command_handle = Some(handle);
    record.state.insert(CommandState::COMMAND_INFLIGHT);
    Ok(())
}
